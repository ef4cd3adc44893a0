//! Stage outputs and artifacts: the evidence the contract projection and
//! readiness rules read.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::{PipelineStore, Result, parse_json, parse_ts, ts};
use crate::stages::Stage;

/// One worker-produced output record for a (project, stage) run.
#[derive(Clone, Debug)]
pub struct StageOutput {
    pub id: Uuid,
    pub project_id: Uuid,
    pub stage: Stage,
    pub status: String,
    pub outputs: Value,
    pub created_at: DateTime<Utc>,
}

/// Uploaded or generated artifact metadata (bytes live in object storage).
#[derive(Clone, Debug)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub kind: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

impl PipelineStore {
    #[instrument(skip(self, outputs), err)]
    pub async fn add_stage_output(
        &self,
        project_id: Uuid,
        stage: Stage,
        status: &str,
        outputs: &Value,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO stage_outputs (id, project_id, stage, status, outputs_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(stage.encode())
        .bind(status)
        .bind(outputs.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Most recent output for a stage, if any.
    pub async fn latest_stage_output(
        &self,
        project_id: Uuid,
        stage: Stage,
    ) -> Result<Option<StageOutput>> {
        let row = sqlx::query(
            "SELECT id, status, outputs_json, created_at FROM stage_outputs \
             WHERE project_id = ?1 AND stage = ?2 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(project_id.to_string())
        .bind(stage.encode())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|row| {
            let id: String = row.get("id");
            StageOutput {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                project_id,
                stage,
                status: row.get("status"),
                outputs: parse_json(&row.get::<String, _>("outputs_json")),
                created_at: parse_ts(&row.get::<String, _>("created_at")),
            }
        }))
    }

    /// All latest-per-stage outputs for a project (contract projection input).
    pub async fn latest_stage_outputs(&self, project_id: Uuid) -> Result<Vec<StageOutput>> {
        let mut results = Vec::new();
        for stage in crate::stages::STAGE_ORDER {
            if let Some(output) = self.latest_stage_output(project_id, stage).await? {
                results.push(output);
            }
        }
        Ok(results)
    }

    pub async fn add_artifact(
        &self,
        project_id: Uuid,
        kind: &str,
        storage_key: &str,
        size_bytes: i64,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO artifacts (id, project_id, kind, storage_key, size_bytes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(kind)
        .bind(storage_key)
        .bind(size_bytes)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn list_artifacts(&self, project_id: Uuid) -> Result<Vec<ArtifactRow>> {
        let rows = sqlx::query(
            "SELECT id, kind, storage_key, size_bytes, created_at FROM artifacts \
             WHERE project_id = ?1 ORDER BY created_at ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                ArtifactRow {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    project_id,
                    kind: row.get("kind"),
                    storage_key: row.get("storage_key"),
                    size_bytes: row.get("size_bytes"),
                    created_at: parse_ts(&row.get::<String, _>("created_at")),
                }
            })
            .collect())
    }
}
