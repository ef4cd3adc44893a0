//! External collaborator seams.
//!
//! The core touches email, object storage, and validation runners only
//! through these traits. Production implementations live outside this crate;
//! the doubles here are deterministic and used by tests and local runs.
//! Transient collaborator failures are retried with backoff and never block
//! stage transitions.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum CollaboratorError {
    #[error("email send failed: {0}")]
    #[diagnostic(code(siteline::collaborators::email))]
    Email(String),

    #[error("storage operation failed: {0}")]
    #[diagnostic(code(siteline::collaborators::storage))]
    Storage(String),

    #[error("object too large: {size} bytes exceeds limit {limit}")]
    #[diagnostic(code(siteline::collaborators::size_limit))]
    SizeLimit { size: usize, limit: usize },

    #[error("validation runner failed: {0}")]
    #[diagnostic(code(siteline::collaborators::runner))]
    Runner(String),
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// Outbound client email. Implementations own templating and transport.
#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn send_client_reminder(
        &self,
        project_id: Uuid,
        recipients: &[String],
        message: &str,
        portal_url: &str,
    ) -> Result<(), CollaboratorError>;

    async fn send_confirmation_request(
        &self,
        recipients: &[String],
        project_title: &str,
        request_title: &str,
        portal_url: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Records every send; tests assert on the captured calls.
#[derive(Clone, Default)]
pub struct RecordingEmailNotifier {
    sent: Arc<Mutex<Vec<Value>>>,
    /// When set, every send fails with this message (failure-path tests).
    fail_with: Arc<Mutex<Option<String>>>,
}

impl RecordingEmailNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }
}

#[async_trait]
impl EmailNotifier for RecordingEmailNotifier {
    async fn send_client_reminder(
        &self,
        project_id: Uuid,
        recipients: &[String],
        message: &str,
        portal_url: &str,
    ) -> Result<(), CollaboratorError> {
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(CollaboratorError::Email(message));
        }
        self.sent.lock().push(json!({
            "kind": "client_reminder",
            "project_id": project_id.to_string(),
            "recipients": recipients,
            "message": message,
            "portal_url": portal_url,
        }));
        Ok(())
    }

    async fn send_confirmation_request(
        &self,
        recipients: &[String],
        project_title: &str,
        request_title: &str,
        portal_url: &str,
    ) -> Result<(), CollaboratorError> {
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(CollaboratorError::Email(message));
        }
        self.sent.lock().push(json!({
            "kind": "confirmation_request",
            "recipients": recipients,
            "project_title": project_title,
            "request_title": request_title,
            "portal_url": portal_url,
        }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object storage
// ---------------------------------------------------------------------------

/// Byte store with presigned-URL generation. Keys are namespaced
/// `projects/{project_id}/…` and `templates/{slug}/v{version}/…`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError>;
    async fn delete(&self, key: &str) -> Result<(), CollaboratorError>;
    /// Delete everything under a prefix (preview bundle replacement).
    async fn delete_prefix(&self, prefix: &str) -> Result<(), CollaboratorError>;
    fn presign(&self, key: &str) -> String;
}

/// Key prefix for a template's preview bundle.
#[must_use]
pub fn template_prefix(slug: &str, version: i64) -> String {
    let slug = slug.replace(' ', "-").to_lowercase();
    format!("templates/{slug}/v{version}")
}

/// Key prefix for a project's artifacts.
#[must_use]
pub fn project_prefix(project_id: Uuid) -> String {
    format!("projects/{project_id}")
}

/// In-memory object store with a per-object size limit.
#[derive(Clone)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<FxHashMap<String, Vec<u8>>>>,
    max_object_bytes: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new(max_object_bytes: usize) -> Self {
        Self {
            objects: Arc::new(Mutex::new(FxHashMap::default())),
            max_object_bytes,
        }
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError> {
        if bytes.len() > self.max_object_bytes {
            return Err(CollaboratorError::SizeLimit {
                size: bytes.len(),
                limit: self.max_object_bytes,
            });
        }
        self.objects.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), CollaboratorError> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), CollaboratorError> {
        self.objects.lock().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn presign(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

// ---------------------------------------------------------------------------
// Validation runners
// ---------------------------------------------------------------------------

/// One external check (Lighthouse, axe, HTML content, …) against a preview
/// URL. Reports are aggregated by the template validation pipeline.
#[async_trait]
pub trait ValidationRunner: Send + Sync {
    /// Runner name used as the report key (`"lighthouse"`, `"axe"`, …).
    fn name(&self) -> &'static str;

    async fn run(&self, url: &str, thresholds: &Value) -> Result<Value, CollaboratorError>;
}

/// Deterministic runner returning a fixed report; tests tune the values.
pub struct StubRunner {
    name: &'static str,
    report: Value,
}

impl StubRunner {
    #[must_use]
    pub fn new(name: &'static str, report: Value) -> Self {
        Self { name, report }
    }

    /// A passing Lighthouse report.
    #[must_use]
    pub fn lighthouse_passing() -> Self {
        Self::new(
            "lighthouse",
            json!({"performance": 95, "accessibility": 97, "best_practices": 95, "seo": 96}),
        )
    }

    /// A clean axe report.
    #[must_use]
    pub fn axe_clean() -> Self {
        Self::new("axe", json!({"critical": 0, "serious": 0, "moderate": 1}))
    }

    /// Content checks that pass.
    #[must_use]
    pub fn content_passing() -> Self {
        Self::new(
            "content",
            json!({"has_home": true, "has_cta": true, "has_contact_or_lead": true, "has_mobile_meta": true}),
        )
    }
}

#[async_trait]
impl ValidationRunner for StubRunner {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, _url: &str, _thresholds: &Value) -> Result<Value, CollaboratorError> {
        Ok(self.report.clone())
    }
}
