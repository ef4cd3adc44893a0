//! Per-(project, stage_key) state rows.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{
    PipelineStore, Result, StoreError, parse_json, parse_string_list, parse_ts, parse_uuid,
    parse_uuid_opt, ts,
};
use crate::model::{ProjectStageState, StageStateStatus};
use crate::stages::STAGE_ORDER;

fn state_from_row(row: &SqliteRow) -> Result<ProjectStageState> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let status_raw: String = row.get("status");
    Ok(ProjectStageState {
        id: parse_uuid(&id, "project_stage_states.id")?,
        project_id: parse_uuid(&project_id, "project_stage_states.project_id")?,
        stage_key: row.get("stage_key"),
        status: StageStateStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("project_stage_states.status '{status_raw}'"),
        })?,
        blocked_reasons: parse_string_list(&row.get::<String, _>("blocked_reasons_json")),
        required_actions: parse_string_list(&row.get::<String, _>("required_actions_json")),
        last_job_id: parse_uuid_opt(row.get("last_job_id")),
        evidence: parse_json(&row.get::<String, _>("evidence_json")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    })
}

impl PipelineStore {
    /// Ensure a state row exists for every real stage key (`0…6`). Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_stage_states(&self, project_id: Uuid) -> Result<()> {
        let now = ts(Utc::now());
        for stage in STAGE_ORDER {
            sqlx::query(
                "INSERT OR IGNORE INTO project_stage_states (id, project_id, stage_key, status, updated_at) \
                 VALUES (?1, ?2, ?3, 'not_started', ?4)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id.to_string())
            .bind(stage.key())
            .bind(&now)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn get_stage_state(
        &self,
        project_id: Uuid,
        stage_key: &str,
    ) -> Result<Option<ProjectStageState>> {
        let row = sqlx::query(
            "SELECT id, project_id, stage_key, status, blocked_reasons_json, \
             required_actions_json, last_job_id, evidence_json, updated_at \
             FROM project_stage_states WHERE project_id = ?1 AND stage_key = ?2",
        )
        .bind(project_id.to_string())
        .bind(stage_key)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    pub async fn list_stage_states(&self, project_id: Uuid) -> Result<Vec<ProjectStageState>> {
        let rows = sqlx::query(
            "SELECT id, project_id, stage_key, status, blocked_reasons_json, \
             required_actions_json, last_job_id, evidence_json, updated_at \
             FROM project_stage_states WHERE project_id = ?1 ORDER BY stage_key ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        let mut states: Vec<ProjectStageState> =
            rows.iter().map(state_from_row).collect::<Result<_>>()?;
        // "10_…" sorts before "2_…" lexicographically; order by numeric prefix.
        states.sort_by_key(|s| {
            s.stage_key
                .split('_')
                .next()
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(u32::MAX)
        });
        Ok(states)
    }

    /// Set a stage-state row's status, replacing reasons and actions.
    #[instrument(skip(self, blocked_reasons, required_actions), err)]
    pub async fn set_stage_state(
        &self,
        project_id: Uuid,
        stage_key: &str,
        status: StageStateStatus,
        blocked_reasons: &[String],
        required_actions: &[String],
    ) -> Result<()> {
        sqlx::query(
            "UPDATE project_stage_states SET status = ?3, blocked_reasons_json = ?4, \
             required_actions_json = ?5, updated_at = ?6 \
             WHERE project_id = ?1 AND stage_key = ?2",
        )
        .bind(project_id.to_string())
        .bind(stage_key)
        .bind(status.encode())
        .bind(serde_json::to_string(blocked_reasons)?)
        .bind(serde_json::to_string(required_actions)?)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Append blocked reasons without clobbering the existing list.
    pub async fn append_stage_blocked_reasons(
        &self,
        project_id: Uuid,
        stage_key: &str,
        reasons: &[String],
        required_actions: Option<&[String]>,
    ) -> Result<()> {
        let Some(state) = self.get_stage_state(project_id, stage_key).await? else {
            return Ok(());
        };
        let mut merged = state.blocked_reasons;
        for reason in reasons {
            if !merged.contains(reason) {
                merged.push(reason.clone());
            }
        }
        let actions: Vec<String> = required_actions
            .map(<[String]>::to_vec)
            .unwrap_or(state.required_actions);
        sqlx::query(
            "UPDATE project_stage_states SET blocked_reasons_json = ?3, \
             required_actions_json = ?4, updated_at = ?5 \
             WHERE project_id = ?1 AND stage_key = ?2",
        )
        .bind(project_id.to_string())
        .bind(stage_key)
        .bind(serde_json::to_string(&merged)?)
        .bind(serde_json::to_string(&actions)?)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the last job that ran for a stage plus any evidence it left.
    pub async fn set_stage_state_job(
        &self,
        project_id: Uuid,
        stage_key: &str,
        job_id: Uuid,
        evidence: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE project_stage_states SET last_job_id = ?3, \
             evidence_json = COALESCE(?4, evidence_json), updated_at = ?5 \
             WHERE project_id = ?1 AND stage_key = ?2",
        )
        .bind(project_id.to_string())
        .bind(stage_key)
        .bind(job_id.to_string())
        .bind(evidence.map(Value::to_string))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
