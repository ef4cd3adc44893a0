//! Stage approval rows. At most one `pending` row per (project, stage_key);
//! the lifecycle logic lives in [`crate::hitl`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{
    PipelineStore, Result, StoreError, parse_json, parse_ts, parse_uuid, parse_uuid_opt, ts,
};
use crate::model::{ApprovalStatus, StageApproval};

fn approval_from_row(row: &SqliteRow) -> Result<StageApproval> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let status_raw: String = row.get("status");
    Ok(StageApproval {
        id: parse_uuid(&id, "stage_approvals.id")?,
        project_id: parse_uuid(&project_id, "stage_approvals.project_id")?,
        stage_key: row.get("stage_key"),
        status: ApprovalStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("stage_approvals.status '{status_raw}'"),
        })?,
        approver_user_id: parse_uuid_opt(row.get("approver_user_id")),
        comment: row.get("comment"),
        gate_snapshot: parse_json(&row.get::<String, _>("gate_snapshot_json")),
        inputs_fingerprint: row.get("inputs_fingerprint"),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    })
}

const APPROVAL_COLUMNS: &str = "id, project_id, stage_key, status, approver_user_id, comment, \
     gate_snapshot_json, inputs_fingerprint, created_at, updated_at";

impl PipelineStore {
    pub async fn get_pending_approval(
        &self,
        project_id: Uuid,
        stage_key: &str,
    ) -> Result<Option<StageApproval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM stage_approvals \
             WHERE project_id = ?1 AND stage_key = ?2 AND status = 'pending'"
        ))
        .bind(project_id.to_string())
        .bind(stage_key)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    pub async fn get_approval(&self, approval_id: Uuid) -> Result<Option<StageApproval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM stage_approvals WHERE id = ?1"
        ))
        .bind(approval_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(approval_from_row).transpose()
    }

    pub async fn list_pending_approvals(&self, project_id: Uuid) -> Result<Vec<StageApproval>> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM stage_approvals \
             WHERE project_id = ?1 AND status = 'pending' ORDER BY created_at ASC"
        ))
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(approval_from_row).collect()
    }

    pub async fn list_approvals(&self, project_id: Uuid) -> Result<Vec<StageApproval>> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM stage_approvals \
             WHERE project_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(approval_from_row).collect()
    }

    /// Create a pending approval, or refresh the snapshot/fingerprint on the
    /// existing pending row (only one pending per stage).
    #[instrument(skip(self, gate_snapshot), err)]
    pub async fn upsert_pending_approval(
        &self,
        project_id: Uuid,
        stage_key: &str,
        gate_snapshot: &Value,
        inputs_fingerprint: &str,
    ) -> Result<StageApproval> {
        let now = ts(Utc::now());
        if let Some(existing) = self.get_pending_approval(project_id, stage_key).await? {
            sqlx::query(
                "UPDATE stage_approvals SET gate_snapshot_json = ?2, inputs_fingerprint = ?3, \
                 updated_at = ?4 WHERE id = ?1",
            )
            .bind(existing.id.to_string())
            .bind(gate_snapshot.to_string())
            .bind(inputs_fingerprint)
            .bind(&now)
            .execute(self.pool())
            .await?;
            return self
                .get_approval(existing.id)
                .await?
                .ok_or_else(|| StoreError::Corrupt {
                    what: format!("approval {} vanished during update", existing.id),
                });
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO stage_approvals \
             (id, project_id, stage_key, status, gate_snapshot_json, inputs_fingerprint, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(stage_key)
        .bind(gate_snapshot.to_string())
        .bind(inputs_fingerprint)
        .bind(&now)
        .execute(self.pool())
        .await?;
        self.get_approval(id).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("approval {id} vanished after insert"),
        })
    }

    /// Move an approval to a new status, recording the decider and comment.
    pub async fn resolve_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        approver_user_id: Option<Uuid>,
        comment: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE stage_approvals SET status = ?2, approver_user_id = ?3, comment = ?4, \
             updated_at = ?5 WHERE id = ?1",
        )
        .bind(approval_id.to_string())
        .bind(status.encode())
        .bind(approver_user_id.map(|u| u.to_string()))
        .bind(comment)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Pending approvals older than `cutoff`, across all projects or one.
    pub async fn list_pending_approvals_before(
        &self,
        cutoff: DateTime<Utc>,
        project_id: Option<Uuid>,
    ) -> Result<Vec<StageApproval>> {
        let rows = match project_id {
            Some(project_id) => {
                sqlx::query(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM stage_approvals \
                     WHERE status = 'pending' AND created_at < ?1 AND project_id = ?2"
                ))
                .bind(ts(cutoff))
                .bind(project_id.to_string())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM stage_approvals \
                     WHERE status = 'pending' AND created_at < ?1"
                ))
                .bind(ts(cutoff))
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(approval_from_row).collect()
    }
}
