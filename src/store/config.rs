//! Keyed admin configuration with optimistic concurrency.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::{PipelineStore, Result, StoreError, parse_json, parse_ts, ts};
use crate::config::{
    KEY_DECISION_POLICIES, KEY_GLOBAL_THRESHOLDS, KEY_HITL_GATES, KEY_WORKER_CONCURRENCY,
    PolicyBundle,
};

#[derive(Clone, Debug)]
pub struct ConfigRow {
    pub key: String,
    pub value: Value,
    pub config_version: i64,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineStore {
    pub async fn get_config(&self, key: &str) -> Result<Option<ConfigRow>> {
        let row = sqlx::query(
            "SELECT key, value_json, config_version, updated_by, updated_at \
             FROM admin_config WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|row| ConfigRow {
            key: row.get("key"),
            value: parse_json(&row.get::<String, _>("value_json")),
            config_version: row.get("config_version"),
            updated_by: row.get("updated_by"),
            updated_at: parse_ts(&row.get::<String, _>("updated_at")),
        }))
    }

    pub async fn get_config_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_config(key).await?.map(|c| c.value))
    }

    /// Create or update a config key.
    ///
    /// When `expected_version` is given, the update is refused with
    /// [`StoreError::ConfigConflict`] unless it matches the stored version
    /// (0 and 1 are both accepted for a fresh key). The API boundary maps
    /// the conflict to HTTP 409.
    #[instrument(skip(self, value), err)]
    pub async fn update_config(
        &self,
        key: &str,
        value: &Value,
        updated_by: Option<Uuid>,
        expected_version: Option<i64>,
    ) -> Result<ConfigRow> {
        let existing = self.get_config(key).await?;
        let now = ts(Utc::now());
        match existing {
            Some(existing) => {
                if let Some(expected) = expected_version {
                    if existing.config_version != expected {
                        return Err(StoreError::ConfigConflict {
                            key: key.to_string(),
                            expected,
                            found: existing.config_version,
                        });
                    }
                }
                sqlx::query(
                    "UPDATE admin_config SET value_json = ?2, config_version = config_version + 1, \
                     updated_by = ?3, updated_at = ?4 WHERE key = ?1",
                )
                .bind(key)
                .bind(value.to_string())
                .bind(updated_by.map(|u| u.to_string()))
                .bind(&now)
                .execute(self.pool())
                .await?;
            }
            None => {
                if let Some(expected) = expected_version {
                    if expected > 1 {
                        return Err(StoreError::ConfigConflict {
                            key: key.to_string(),
                            expected,
                            found: 0,
                        });
                    }
                }
                sqlx::query(
                    "INSERT INTO admin_config (key, value_json, config_version, updated_by, updated_at) \
                     VALUES (?1, ?2, 1, ?3, ?4)",
                )
                .bind(key)
                .bind(value.to_string())
                .bind(updated_by.map(|u| u.to_string()))
                .bind(&now)
                .execute(self.pool())
                .await?;
            }
        }
        self.add_audit(
            None,
            updated_by,
            "CONFIG_UPDATED",
            serde_json::json!({"key": key}),
        )
        .await?;
        self.get_config(key).await?.ok_or_else(|| StoreError::Corrupt {
            what: format!("config '{key}' vanished after write"),
        })
    }

    /// Seed the well-known policy keys with their defaults when absent.
    /// Existing rows are left alone, so this is safe to run on every boot.
    #[instrument(skip(self), err)]
    pub async fn seed_default_policies(&self) -> Result<()> {
        let defaults = PolicyBundle::default();
        let now = ts(Utc::now());
        for (key, value) in [
            (
                KEY_DECISION_POLICIES,
                serde_json::to_value(&defaults.policies)?,
            ),
            (
                KEY_GLOBAL_THRESHOLDS,
                serde_json::to_value(&defaults.thresholds)?,
            ),
            (
                KEY_WORKER_CONCURRENCY,
                serde_json::to_value(&defaults.worker)?,
            ),
            (KEY_HITL_GATES, Value::Array(Vec::new())),
        ] {
            sqlx::query(
                "INSERT OR IGNORE INTO admin_config (key, value_json, config_version, updated_at) \
                 VALUES (?1, ?2, 1, ?3)",
            )
            .bind(key)
            .bind(value.to_string())
            .bind(&now)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// Assemble the typed policy bundle from the well-known config keys.
    pub async fn load_policy_bundle(&self) -> Result<PolicyBundle> {
        Ok(PolicyBundle::from_values(
            self.get_config_value(KEY_DECISION_POLICIES).await?,
            self.get_config_value(KEY_GLOBAL_THRESHOLDS).await?,
            self.get_config_value(KEY_WORKER_CONCURRENCY).await?,
            self.get_config_value(KEY_HITL_GATES).await?,
        ))
    }

    /// Per-project HITL overrides (same shape as the global rules).
    pub async fn get_project_hitl_overrides(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<crate::config::HitlGateRule>> {
        let row = sqlx::query(
            "SELECT hitl_overrides_json FROM project_configs WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row
            .map(|row| parse_json(&row.get::<String, _>("hitl_overrides_json")))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub async fn set_project_hitl_overrides(
        &self,
        project_id: Uuid,
        overrides: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_configs (project_id, hitl_overrides_json, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (project_id) DO UPDATE SET \
                 hitl_overrides_json = excluded.hitl_overrides_json, \
                 updated_at = excluded.updated_at",
        )
        .bind(project_id.to_string())
        .bind(overrides.to_string())
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Whether this project opted out of the standard onboarding minimums.
    pub async fn get_minimum_requirements_override(&self, project_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT minimum_requirements_override FROM project_configs WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row
            .map(|row| row.get::<i64, _>("minimum_requirements_override") != 0)
            .unwrap_or(false))
    }

    pub async fn set_minimum_requirements_override(
        &self,
        project_id: Uuid,
        value: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_configs (project_id, minimum_requirements_override, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (project_id) DO UPDATE SET \
                 minimum_requirements_override = excluded.minimum_requirements_override, \
                 updated_at = excluded.updated_at",
        )
        .bind(project_id.to_string())
        .bind(i64::from(value))
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
