//! Project rows: creation, lookup, and the field updates the orchestrator
//! and assignment engine make.

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{
    PipelineStore, Result, StoreError, parse_json, parse_json_opt, parse_ts, parse_ts_opt,
    parse_uuid, parse_uuid_opt, ts,
};
use crate::model::{AutopilotMode, Project, ProjectStatus};
use crate::stages::Stage;

/// Inputs for creating a project in SALES.
#[derive(Clone, Debug, Default)]
pub struct NewProject {
    pub title: String,
    pub client_name: String,
    pub client_emails: String,
    pub priority: String,
    pub sales_user_id: Option<Uuid>,
    pub autopilot_mode: AutopilotMode,
}

pub(crate) fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let id: String = row.get("id");
    let status_raw: String = row.get("status");
    let stage_raw: String = row.get("current_stage");
    let mode_raw: String = row.get("autopilot_mode");
    Ok(Project {
        id: parse_uuid(&id, "projects.id")?,
        title: row.get("title"),
        client_name: row.get("client_name"),
        client_emails: row.get("client_emails"),
        priority: row.get("priority"),
        status: ProjectStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("projects.status '{status_raw}'"),
        })?,
        current_stage: Stage::decode(&stage_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("projects.current_stage '{stage_raw}'"),
        })?,
        sales_user_id: parse_uuid_opt(row.get("sales_user_id")),
        consultant_user_id: parse_uuid_opt(row.get("consultant_user_id")),
        builder_user_id: parse_uuid_opt(row.get("builder_user_id")),
        tester_user_id: parse_uuid_opt(row.get("tester_user_id")),
        manager_user_id: parse_uuid_opt(row.get("manager_user_id")),
        autopilot_enabled: row.get::<i64, _>("autopilot_enabled") != 0,
        autopilot_mode: AutopilotMode::decode(&mode_raw).unwrap_or_default(),
        autopilot_failure_count: row.get("autopilot_failure_count"),
        autopilot_lock_until: parse_ts_opt(row.get("autopilot_lock_until")),
        defect_cycle_count: row.get("defect_cycle_count"),
        is_delayed: row.get::<i64, _>("is_delayed") != 0,
        features: parse_json(&row.get::<String, _>("features_json")),
        quality_overrides: parse_json_opt(row.get("quality_overrides_json")),
        assignment_rationale: parse_json_opt(row.get("assignment_rationale_json")),
        stage_history: parse_json(&row.get::<String, _>("stage_history_json")),
        phase_start_dates: parse_json(&row.get::<String, _>("phase_start_dates_json")),
        hold_reason: row.get("hold_reason"),
        needs_review_reason: row.get("needs_review_reason"),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    })
}

const PROJECT_COLUMNS: &str = "id, title, client_name, client_emails, priority, status, \
     current_stage, sales_user_id, consultant_user_id, builder_user_id, tester_user_id, \
     manager_user_id, autopilot_enabled, autopilot_mode, autopilot_failure_count, \
     autopilot_lock_until, defect_cycle_count, is_delayed, features_json, \
     quality_overrides_json, assignment_rationale_json, stage_history_json, \
     phase_start_dates_json, hold_reason, needs_review_reason, created_at, updated_at";

impl PipelineStore {
    /// Create a project in SALES with status ACTIVE and autopilot enabled.
    #[instrument(skip(self, new), err)]
    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        let id = Uuid::new_v4();
        let now = ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO projects (
                id, title, client_name, client_emails, priority, status, current_stage,
                sales_user_id, autopilot_mode, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE', 'SALES', ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(id.to_string())
        .bind(&new.title)
        .bind(&new.client_name)
        .bind(&new.client_emails)
        .bind(if new.priority.is_empty() {
            "MEDIUM"
        } else {
            new.priority.as_str()
        })
        .bind(new.sales_user_id.map(|u| u.to_string()))
        .bind(new.autopilot_mode.encode())
        .bind(&now)
        .execute(self.pool())
        .await?;
        self.get_project(id).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("project {id} vanished after insert"),
        })
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"
        ))
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    /// Projects a sweeper tick should look at: not archived/cancelled.
    pub async fn list_open_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE status NOT IN ('ARCHIVED', 'CANCELLED', 'COMPLETE') \
             ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    /// Projects currently in ONBOARDING (reminder loop input).
    pub async fn list_projects_in_stage(&self, stage: Stage) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE current_stage = ?1 AND status NOT IN ('ARCHIVED', 'CANCELLED') \
             ORDER BY created_at ASC"
        ))
        .bind(stage.encode())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn set_project_status(&self, project_id: Uuid, status: ProjectStatus) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(project_id.to_string())
            .bind(status.encode())
            .bind(ts(Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Set one of the role assignment columns.
    pub async fn set_project_role_user(
        &self,
        project_id: Uuid,
        column: &str,
        user_id: Option<Uuid>,
    ) -> Result<()> {
        // Column names come from a fixed internal list, never from input.
        debug_assert!(matches!(
            column,
            "consultant_user_id" | "builder_user_id" | "tester_user_id" | "manager_user_id"
        ));
        sqlx::query(&format!(
            "UPDATE projects SET {column} = ?2, updated_at = ?3 WHERE id = ?1"
        ))
        .bind(project_id.to_string())
        .bind(user_id.map(|u| u.to_string()))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_assignment_rationale(
        &self,
        project_id: Uuid,
        rationale: &Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET assignment_rationale_json = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(rationale.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_defect_cycle_count(&self, project_id: Uuid, count: i64) -> Result<()> {
        sqlx::query("UPDATE projects SET defect_cycle_count = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(project_id.to_string())
            .bind(count)
            .bind(ts(Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record an autopilot failure: bump the counter and push the lock out.
    #[instrument(skip(self), err)]
    pub async fn record_autopilot_failure(
        &self,
        project_id: Uuid,
        lock_until: chrono::DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query(
            "UPDATE projects SET autopilot_failure_count = autopilot_failure_count + 1, \
             autopilot_lock_until = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(ts(lock_until))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        let count: i64 =
            sqlx::query_scalar("SELECT autopilot_failure_count FROM projects WHERE id = ?1")
                .bind(project_id.to_string())
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Reset the failure counter after a successful transition.
    pub async fn reset_autopilot_failures(&self, project_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET autopilot_failure_count = 0, autopilot_lock_until = NULL, \
             updated_at = ?2 WHERE id = ?1",
        )
        .bind(project_id.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_autopilot_mode(&self, project_id: Uuid, mode: AutopilotMode) -> Result<()> {
        sqlx::query("UPDATE projects SET autopilot_mode = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(project_id.to_string())
            .bind(mode.encode())
            .bind(ts(Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Append an audit record. Audit is append-only and never read for
    /// decisions.
    pub async fn add_audit(
        &self,
        project_id: Option<Uuid>,
        actor_user_id: Option<Uuid>,
        action: &str,
        payload: Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, project_id, actor_user_id, action, payload_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.map(|p| p.to_string()))
        .bind(actor_user_id.map(|u| u.to_string()))
        .bind(action)
        .bind(payload.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Append a pipeline event (observability stream, never read for
    /// decisions).
    pub async fn add_pipeline_event(
        &self,
        project_id: Uuid,
        stage_key: Option<&str>,
        event_type: &str,
        details: Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_events (id, project_id, stage_key, event_type, details_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(stage_key)
        .bind(event_type)
        .bind(details.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Audit actions recorded for a project, oldest first (test/debug aid).
    pub async fn list_audit_actions(&self, project_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT action FROM audit_logs WHERE project_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("action")).collect())
    }
}

/// Build the history entry appended on each transition.
pub(crate) fn history_entry(
    from: Option<Stage>,
    to: Stage,
    actor_user_id: Option<Uuid>,
) -> Value {
    json!({
        "from_stage": from.map(Stage::encode),
        "to_stage": to.encode(),
        "at": ts(Utc::now()),
        "actor_user_id": actor_user_id.map(|u| u.to_string()),
    })
}
