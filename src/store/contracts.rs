//! Delivery contract rows: one versioned JSON document per project.
//! The projection that builds the document lives in [`crate::contract`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::{PipelineStore, Result, parse_json, parse_ts, ts};

/// A stored contract with its version metadata.
#[derive(Clone, Debug)]
pub struct ContractRow {
    pub project_id: Uuid,
    pub version: i64,
    pub contract: Value,
    pub content_hash: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl PipelineStore {
    pub async fn get_contract_row(&self, project_id: Uuid) -> Result<Option<ContractRow>> {
        let row = sqlx::query(
            "SELECT version, contract_json, content_hash, updated_by, updated_at \
             FROM delivery_contracts WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|row| ContractRow {
            project_id,
            version: row.get("version"),
            contract: parse_json(&row.get::<String, _>("contract_json")),
            content_hash: row.get("content_hash"),
            updated_by: row.get("updated_by"),
            updated_at: parse_ts(&row.get::<String, _>("updated_at")),
        }))
    }

    /// Insert or bump the contract row. Callers decide whether the content
    /// changed; this just writes.
    #[instrument(skip(self, contract), err)]
    pub async fn put_contract(
        &self,
        project_id: Uuid,
        version: i64,
        contract: &Value,
        content_hash: &str,
        updated_by: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO delivery_contracts \
             (project_id, version, contract_json, content_hash, updated_by, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (project_id) DO UPDATE SET \
                 version = excluded.version, \
                 contract_json = excluded.contract_json, \
                 content_hash = excluded.content_hash, \
                 updated_by = excluded.updated_by, \
                 updated_at = excluded.updated_at",
        )
        .bind(project_id.to_string())
        .bind(version)
        .bind(contract.to_string())
        .bind(content_hash)
        .bind(updated_by)
        .bind(ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
