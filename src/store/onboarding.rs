//! Onboarding rows, reminder bookkeeping, and confirmation requests.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use super::{
    PipelineStore, Result, StoreError, parse_json, parse_string_list, parse_ts, parse_ts_opt,
    parse_uuid, parse_uuid_opt, ts, ts_opt,
};
use crate::model::{ConfirmationRequest, ConfirmationStatus, OnboardingData};

fn onboarding_from_row(row: &SqliteRow) -> Result<OnboardingData> {
    let project_id: String = row.get("project_id");
    Ok(OnboardingData {
        project_id: parse_uuid(&project_id, "onboarding_data.project_id")?,
        contacts: parse_json(&row.get::<String, _>("contacts_json")),
        brand: parse_json(&row.get::<String, _>("brand_json")),
        design_preferences: parse_json(&row.get::<String, _>("design_preferences_json")),
        compliance: parse_json(&row.get::<String, _>("compliance_json")),
        fundamentals: parse_json(&row.get::<String, _>("fundamentals_json")),
        feature_tags: parse_string_list(&row.get::<String, _>("feature_tags_json")),
        completion_percent: row.get("completion_percent"),
        submitted_at: parse_ts_opt(row.get("submitted_at")),
        auto_reminder_enabled: row.get::<i64, _>("auto_reminder_enabled") != 0,
        reminder_count: row.get("reminder_count"),
        last_reminder_sent_at: parse_ts_opt(row.get("last_reminder_sent_at")),
        next_reminder_at: parse_ts_opt(row.get("next_reminder_at")),
        reminder_interval_hours: row.get("reminder_interval_hours"),
        field_sentinels: row.get("field_sentinels"),
        selected_template_id: parse_uuid_opt(row.get("selected_template_id")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    })
}

const ONBOARDING_COLUMNS: &str = "project_id, contacts_json, brand_json, design_preferences_json, \
     compliance_json, fundamentals_json, feature_tags_json, completion_percent, submitted_at, \
     auto_reminder_enabled, reminder_count, last_reminder_sent_at, next_reminder_at, \
     reminder_interval_hours, field_sentinels, selected_template_id, updated_at";

impl PipelineStore {
    /// Create the onboarding row if missing (fresh projects get one on
    /// handover).
    pub async fn ensure_onboarding(&self, project_id: Uuid) -> Result<OnboardingData> {
        sqlx::query(
            "INSERT OR IGNORE INTO onboarding_data (project_id, updated_at) VALUES (?1, ?2)",
        )
        .bind(project_id.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        self.get_onboarding(project_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt {
                what: format!("onboarding row for {project_id} vanished"),
            })
    }

    pub async fn get_onboarding(&self, project_id: Uuid) -> Result<Option<OnboardingData>> {
        let row = sqlx::query(&format!(
            "SELECT {ONBOARDING_COLUMNS} FROM onboarding_data WHERE project_id = ?1"
        ))
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(onboarding_from_row).transpose()
    }

    /// Store the client-provided sections and recompute the field sentinel
    /// fingerprint (used by approval invalidation).
    #[instrument(skip(self, contacts, brand, design_preferences, compliance, fundamentals), err)]
    pub async fn update_onboarding_fields(
        &self,
        project_id: Uuid,
        contacts: &Value,
        brand: &Value,
        design_preferences: &Value,
        compliance: &Value,
        fundamentals: &Value,
        feature_tags: &[String],
        completion_percent: i64,
    ) -> Result<()> {
        let sentinels = crate::util::canonical::hash_value(&serde_json::json!({
            "contacts": contacts,
            "brand": brand,
            "design_preferences": design_preferences,
            "compliance": compliance,
            "fundamentals": fundamentals,
        }));
        sqlx::query(
            "UPDATE onboarding_data SET contacts_json = ?2, brand_json = ?3, \
             design_preferences_json = ?4, compliance_json = ?5, fundamentals_json = ?6, \
             feature_tags_json = ?7, completion_percent = ?8, field_sentinels = ?9, \
             updated_at = ?10 WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .bind(contacts.to_string())
        .bind(brand.to_string())
        .bind(design_preferences.to_string())
        .bind(compliance.to_string())
        .bind(fundamentals.to_string())
        .bind(serde_json::to_string(feature_tags)?)
        .bind(completion_percent)
        .bind(sentinels)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_onboarding_submitted(
        &self,
        project_id: Uuid,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE onboarding_data SET submitted_at = ?2, updated_at = ?3 WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .bind(ts(submitted_at))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_selected_template(
        &self,
        project_id: Uuid,
        template_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE onboarding_data SET selected_template_id = ?2, updated_at = ?3 \
             WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .bind(template_id.map(|t| t.to_string()))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record one reminder send.
    pub async fn record_reminder_sent(
        &self,
        project_id: Uuid,
        sent_at: DateTime<Utc>,
        next_reminder_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE onboarding_data SET reminder_count = reminder_count + 1, \
             last_reminder_sent_at = ?2, next_reminder_at = ?3, updated_at = ?4 \
             WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .bind(ts(sent_at))
        .bind(ts_opt(next_reminder_at))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Test/ops helper to rewind or seed reminder bookkeeping.
    pub async fn set_reminder_state(
        &self,
        project_id: Uuid,
        reminder_count: i64,
        last_reminder_sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE onboarding_data SET reminder_count = ?2, last_reminder_sent_at = ?3, \
             updated_at = ?4 WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .bind(reminder_count)
        .bind(ts_opt(last_reminder_sent_at))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // -- Confirmation requests -------------------------------------------

    pub async fn create_confirmation_request(
        &self,
        project_id: Uuid,
        title: &str,
        kind: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO confirmation_requests (id, project_id, title, kind, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(title)
        .bind(kind)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn resolve_confirmation_request(
        &self,
        request_id: Uuid,
        status: ConfirmationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE confirmation_requests SET status = ?2, resolved_at = ?3 WHERE id = ?1",
        )
        .bind(request_id.to_string())
        .bind(status.encode())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_confirmation_requests(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<ConfirmationRequest>> {
        let rows = sqlx::query(
            "SELECT id, project_id, title, kind, status, created_at, resolved_at \
             FROM confirmation_requests WHERE project_id = ?1 ORDER BY created_at ASC",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let status_raw: String = row.get("status");
                Ok(ConfirmationRequest {
                    id: parse_uuid(&id, "confirmation_requests.id")?,
                    project_id,
                    title: row.get("title"),
                    kind: row.get("kind"),
                    status: ConfirmationStatus::decode(&status_raw).ok_or_else(|| {
                        StoreError::Corrupt {
                            what: format!("confirmation_requests.status '{status_raw}'"),
                        }
                    })?,
                    created_at: parse_ts(&row.get::<String, _>("created_at")),
                    resolved_at: parse_ts_opt(row.get("resolved_at")),
                })
            })
            .collect()
    }

    /// Whether a confirmed fallback-template request exists for the project.
    pub async fn has_confirmed_fallback(&self, project_id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM confirmation_requests \
             WHERE project_id = ?1 AND kind = 'fallback_template' AND status = 'confirmed'",
        )
        .bind(project_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }
}
