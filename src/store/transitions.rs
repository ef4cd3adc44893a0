//! Single source of truth for stage transitions.
//!
//! All stage changes go through [`PipelineStore::transition_project_stage`]:
//! it validates against the valid-next map, appends exactly one stage-history
//! entry, records the phase start time, rolls the stage-state rows forward,
//! and writes one audit record — atomically, inside one transaction.
//! An invalid transition is not an error; it returns `false` and is logged.

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::Row;
use tracing::{instrument, warn};
use uuid::Uuid;

use super::projects::history_entry;
use super::{PipelineStore, Result, ts};
use crate::stages::{Stage, can_transition};

impl PipelineStore {
    /// Atomically transition a project to a new stage.
    ///
    /// Idempotent: transitioning to the current stage is a no-op returning
    /// `false`. `from` (when given) must match the current stage, otherwise
    /// the call is refused — callers racing each other see `false` and
    /// re-evaluate on their next tick.
    #[instrument(skip(self, metadata), err)]
    pub async fn transition_project_stage(
        &self,
        project_id: Uuid,
        from: Option<Stage>,
        to: Stage,
        reason: Option<&str>,
        metadata: Option<Value>,
        actor_user_id: Option<Uuid>,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT current_stage, stage_history_json, phase_start_dates_json \
             FROM projects WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            warn!(%project_id, "transition_project_stage: project not found");
            return Ok(false);
        };

        let current_raw: String = row.get("current_stage");
        let Some(current) = Stage::decode(&current_raw) else {
            warn!(%project_id, stage = %current_raw, "transition_project_stage: unknown stage");
            return Ok(false);
        };
        if current == to {
            return Ok(false);
        }
        if let Some(from) = from {
            if from != current {
                warn!(
                    %project_id, expected = %from, actual = %current,
                    "transition_project_stage: stale from-stage"
                );
                return Ok(false);
            }
        }
        if !can_transition(Some(current), to) {
            warn!(%project_id, from = %current, to = %to, "transition_project_stage: invalid transition");
            return Ok(false);
        }

        let now = Utc::now();
        let mut history: Vec<Value> =
            serde_json::from_str(&row.get::<String, _>("stage_history_json")).unwrap_or_default();
        history.push(history_entry(Some(current), to, actor_user_id));

        let mut phase_starts: serde_json::Map<String, Value> =
            serde_json::from_str(&row.get::<String, _>("phase_start_dates_json"))
                .unwrap_or_default();
        phase_starts
            .entry(to.encode().to_string())
            .or_insert_with(|| json!(ts(now)));

        sqlx::query(
            "UPDATE projects SET current_stage = ?2, stage_history_json = ?3, \
             phase_start_dates_json = ?4, updated_at = ?5 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(to.encode())
        .bind(Value::Array(history).to_string())
        .bind(Value::Object(phase_starts).to_string())
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        // Previous stage row completes; the target row becomes ready unless it
        // already progressed past that.
        sqlx::query(
            "UPDATE project_stage_states SET status = 'complete', blocked_reasons_json = '[]', \
             required_actions_json = '[]', updated_at = ?3 \
             WHERE project_id = ?1 AND stage_key = ?2",
        )
        .bind(project_id.to_string())
        .bind(current.key())
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE project_stage_states SET status = 'ready', blocked_reasons_json = '[]', \
             required_actions_json = '[]', updated_at = ?3 \
             WHERE project_id = ?1 AND stage_key = ?2 \
             AND status IN ('not_started', 'blocked', 'failed')",
        )
        .bind(project_id.to_string())
        .bind(to.key())
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        let mut payload = json!({
            "from_stage": current.encode(),
            "to_stage": to.encode(),
            "reason": reason,
        });
        if let (Some(obj), Some(Value::Object(meta))) = (payload.as_object_mut(), metadata) {
            obj.extend(meta);
        }
        sqlx::query(
            "INSERT INTO audit_logs (id, project_id, actor_user_id, action, payload_json, created_at) \
             VALUES (?1, ?2, ?3, 'STAGE_TRANSITION', ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(actor_user_id.map(|u| u.to_string()))
        .bind(payload.to_string())
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(%project_id, from = %current, to = %to, "stage transition applied");
        Ok(true)
    }

    /// Set project status to HOLD with a reason. No-op for missing projects.
    #[instrument(skip(self), err)]
    pub async fn set_project_hold(
        &self,
        project_id: Uuid,
        reason: &str,
        actor_user_id: Option<Uuid>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE projects SET status = 'HOLD', hold_reason = ?2, needs_review_reason = NULL, \
             updated_at = ?3 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(reason)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(());
        }
        self.add_audit(
            Some(project_id),
            actor_user_id,
            "PROJECT_HOLD",
            json!({"reason": reason}),
        )
        .await
    }

    /// Set project status to NEEDS_REVIEW with a reason. No-op for missing
    /// projects.
    #[instrument(skip(self), err)]
    pub async fn set_project_needs_review(
        &self,
        project_id: Uuid,
        reason: &str,
        actor_user_id: Option<Uuid>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE projects SET status = 'NEEDS_REVIEW', needs_review_reason = ?2, \
             updated_at = ?3 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(reason)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(());
        }
        self.add_audit(
            Some(project_id),
            actor_user_id,
            "PROJECT_NEEDS_REVIEW",
            json!({"reason": reason}),
        )
        .await
    }
}
