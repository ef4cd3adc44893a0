//! Shared fixtures for the integration tests: an in-memory pipeline with
//! deterministic collaborators.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use siteline::ai::StubAiClient;
use siteline::collaborators::{MemoryObjectStore, StubRunner, ValidationRunner};
use siteline::events::{MemorySink, NotificationBus};
use siteline::model::Role;
use siteline::queue::WorkerContext;
use siteline::store::users::NewUser;
use siteline::store::{PipelineStore, projects::NewProject};

pub struct TestHarness {
    pub ctx: WorkerContext,
    pub notifications: MemorySink,
}

impl TestHarness {
    pub fn store(&self) -> &PipelineStore {
        &self.ctx.store
    }
}

/// Fresh in-memory database with stub AI, memory object store, and passing
/// validation runners.
pub async fn harness() -> TestHarness {
    harness_with_runners(vec![
        Arc::new(StubRunner::lighthouse_passing()),
        Arc::new(StubRunner::axe_clean()),
        Arc::new(StubRunner::content_passing()),
    ])
    .await
}

pub async fn harness_with_runners(runners: Vec<Arc<dyn ValidationRunner>>) -> TestHarness {
    let store = PipelineStore::connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    let notifications = MemorySink::new();
    let bus = NotificationBus::with_sink(notifications.clone());
    TestHarness {
        ctx: WorkerContext {
            store,
            bus,
            ai: Arc::new(StubAiClient),
            objects: Arc::new(MemoryObjectStore::default()),
            runners,
        },
        notifications,
    }
}

pub async fn create_project(store: &PipelineStore, title: &str) -> Uuid {
    let project = store
        .create_project(NewProject {
            title: title.to_string(),
            client_name: "C1".to_string(),
            client_emails: "client@example.test".to_string(),
            priority: "MEDIUM".to_string(),
            ..Default::default()
        })
        .await
        .expect("create project");
    project.id
}

/// One available user per delivery role, capacity 2.
pub async fn seed_team(store: &PipelineStore) -> (Uuid, Uuid, Uuid) {
    let consultant = store
        .create_user(NewUser::new("Cora Consultant", Role::Consultant))
        .await
        .expect("consultant");
    let builder = store
        .create_user(NewUser::new("Ben Builder", Role::Builder))
        .await
        .expect("builder");
    let tester = store
        .create_user(NewUser::new("Tess Tester", Role::Tester))
        .await
        .expect("tester");
    (consultant.id, builder.id, tester.id)
}

/// A minimal schema-valid blueprint.
pub fn valid_blueprint() -> Value {
    json!({
        "schema_version": 1,
        "meta": {"name": "Harbor", "category": "property", "style": "modern"},
        "tokens": {"colors": {"primary": "#123"}, "typography": {"base": "Inter"}, "spacing": {"unit": 8}},
        "navigation": {"style": "topbar", "items": [{"label": "Home", "href": "home"}]},
        "footer": {"columns": []},
        "pages": [{"slug": "home", "title": "Home", "sections": [
            {"type": "hero", "headline": "Welcome"},
            {"type": "contact_form"},
        ]}],
        "forms": {"lead": {"enabled": true}},
        "constraints": {"mobile_first": true, "wcag_target": "AA", "seo_basics": true},
    })
}

/// A validated template ready for the build stage.
pub async fn seed_validated_template(store: &PipelineStore) -> Uuid {
    let template = store
        .create_template("harbor", "Harbor", Some("property"), Some("modern"))
        .await
        .expect("template");
    let blueprint = valid_blueprint();
    store
        .save_template_blueprint(
            template.id,
            &blueprint,
            "bp-hash-1",
            &json!({"status": "pass"}),
            &json!([]),
            "validated",
        )
        .await
        .expect("blueprint saved");
    template.id
}

/// Fill and submit onboarding with every required section present.
pub async fn complete_onboarding(store: &PipelineStore, project_id: Uuid, template_id: Uuid) {
    store.ensure_onboarding(project_id).await.expect("onboarding row");
    store
        .update_onboarding_fields(
            project_id,
            &json!({"name": "Pat Client", "email": "pat@example.test"}),
            &json!({"logo": "logo.png", "colors": ["#123"]}),
            &json!({"theme": "modern", "layout": "wide"}),
            &json!({"wcag": "AA", "privacy_policy": true}),
            &json!({"domain": "example.test"}),
            &["property_management".to_string()],
            100,
        )
        .await
        .expect("onboarding fields");
    store
        .set_selected_template(project_id, Some(template_id))
        .await
        .expect("template selected");
    store
        .mark_onboarding_submitted(project_id, chrono::Utc::now())
        .await
        .expect("submitted");
}
