/*!
SQLite persistence for the delivery pipeline.

`PipelineStore` wraps a shared `SqlitePool`; entity-specific operations live
in the submodules as inherent impls (`projects`, `stage_states`, `approvals`,
`contracts`, `jobs` are under [`crate::queue`], …). The database is the only
shared mutable store: all cross-task coordination happens through rows, never
process memory.

## Conventions

- Ids are UUIDs stored as TEXT.
- Timestamps are RFC 3339 TEXT (`2026-08-01T12:00:00.000Z`), written by this
  process so lexicographic ordering matches chronological ordering.
- JSON columns are TEXT serialized with `serde_json`.
- Queue claims are single-statement `UPDATE … WHERE id = (SELECT … LIMIT 1)
  RETURNING …`, the SQLite equivalent of `FOR UPDATE SKIP LOCKED`.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling the
  feature assumes external schema orchestration.
*/

pub mod approvals;
pub mod config;
pub mod contracts;
pub mod onboarding;
pub mod outputs;
pub mod projects;
pub mod stage_states;
pub mod templates;
pub mod transitions;
pub mod users;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use miette::Diagnostic;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("SQLx error: {0}")]
    #[diagnostic(
        code(siteline::store::sqlx),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    #[diagnostic(code(siteline::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Corrupt persisted value: {what}")]
    #[diagnostic(
        code(siteline::store::corrupt),
        help("A row holds a value outside the persisted vocabulary; inspect {what}.")
    )]
    Corrupt { what: String },

    #[error("Config version mismatch for key '{key}': expected {expected}, found {found}")]
    #[diagnostic(
        code(siteline::store::config_conflict),
        help("Reload the config and retry with the current version.")
    )]
    ConfigConflict {
        key: String,
        expected: i64,
        found: i64,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Shared handle to the pipeline database.
#[derive(Clone)]
pub struct PipelineStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for PipelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStore").finish()
    }
}

impl PipelineStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `"sqlite://siteline.db"`; tests use `"sqlite::memory:"`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // In-memory databases are per-connection; cap the pool at one so every
        // query sees the same schema (tests use "sqlite::memory:").
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StoreError::Corrupt {
                    what: format!("migration failure: {e}"),
                })?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wrap an existing pool (used by tests that manage their own schema).
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers shared by the submodules.
// ---------------------------------------------------------------------------

/// Canonical timestamp format written to the database (millis + `Z`, matching
/// the schema's `strftime` defaults so string ordering stays chronological).
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

pub(crate) fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StoreError::Corrupt {
        what: format!("{what}: '{raw}' is not a UUID"),
    })
}

pub(crate) fn parse_uuid_opt(raw: Option<String>) -> Option<Uuid> {
    raw.as_deref().and_then(|s| Uuid::parse_str(s).ok())
}

pub(crate) fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

pub(crate) fn parse_json_opt(raw: Option<String>) -> Option<Value> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
}

pub(crate) fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
