//! Delivery contract: the canonical per-project JSON snapshot.
//!
//! Every gate decision and worker pipeline reads this document, never raw
//! rows. It is rebuilt as a projection over project + onboarding + artifacts
//! + stage outputs + template selection, and versioned monotonically:
//! a rebuild whose canonical content hash matches the stored one does not
//! bump the version, so re-running the orchestrator without external change
//! is free.
//!
//! Shape (schema v1): top-level keys `meta`, `onboarding`, `assignments`,
//! `template`, `artifacts`, `stages`, `quality`, `approvals`, `audit`.

use miette::Diagnostic;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::model::Project;
use crate::stages::{STAGE_KEYS, Stage};
use crate::store::{PipelineStore, StoreError};
use crate::util::canonical::hash_value;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error, Diagnostic)]
pub enum ContractError {
    #[error("project {0} not found")]
    #[diagnostic(code(siteline::contract::not_found))]
    ProjectNotFound(Uuid),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Minimal v1 contract skeleton.
#[must_use]
pub fn empty_contract(project_id: Uuid, last_updated_by: &str) -> Value {
    json!({
        "meta": {
            "schema_version": SCHEMA_VERSION,
            "project_id": project_id.to_string(),
            "last_updated_by": last_updated_by,
        },
        "onboarding": {
            "status": "draft",
            "summary": "",
            "primary_contact": {},
            "brand": {},
            "design_preferences": {},
            "compliance": {},
            "website_fundamentals": {},
        },
        "assignments": {
            "consultant_id": null,
            "builder_id": null,
            "tester_id": null,
        },
        "template": {
            "selected_template_id": null,
            "selected_template_version": null,
            "blueprint_ref": null,
        },
        "artifacts": {
            "uploads": [],
            "build_outputs": {
                "preview_url": null,
                "repo_url": null,
                "bundle_url": null,
            },
        },
        "stages": stages_skeleton(),
        "quality": {
            "lighthouse": {"perf": null, "a11y": null, "seo": null, "bp": null},
            "axe": {"critical": null, "serious": null},
        },
        "approvals": [],
        "audit": [],
    })
}

/// Default stages map: every key (including reserved) starts `not_started`.
#[must_use]
pub fn stages_skeleton() -> Value {
    let mut stages = Map::new();
    for key in STAGE_KEYS {
        stages.insert(key.to_string(), json!({"status": "not_started", "outputs": {}}));
    }
    Value::Object(stages)
}

/// Result of a contract rebuild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractVersion {
    pub version: i64,
    /// False when the projection was unchanged and the version kept.
    pub bumped: bool,
}

/// Build the projection and write it if its content changed.
///
/// Idempotent by content hash: an unchanged projection keeps the stored
/// version. Returns the (possibly unchanged) version.
#[instrument(skip(store), err)]
pub async fn create_or_update_contract(
    store: &PipelineStore,
    project_id: Uuid,
    source: &str,
) -> Result<ContractVersion, ContractError> {
    let project = store
        .get_project(project_id)
        .await?
        .ok_or(ContractError::ProjectNotFound(project_id))?;
    let projection = build_projection(store, &project, source).await?;

    // Hash over the gate-relevant content only. The approvals/audit mirrors
    // must not feed the hash: creating an approval would otherwise bump the
    // version and invalidate the approval it just created.
    let mut hashable = projection.clone();
    if let Some(meta) = hashable.get_mut("meta").and_then(Value::as_object_mut) {
        meta.remove("last_updated_by");
    }
    if let Some(root) = hashable.as_object_mut() {
        root.remove("approvals");
        root.remove("audit");
    }
    let content_hash = hash_value(&hashable);

    let existing = store.get_contract_row(project_id).await?;
    match existing {
        Some(row) if row.content_hash == content_hash => Ok(ContractVersion {
            version: row.version,
            bumped: false,
        }),
        Some(row) => {
            let version = row.version + 1;
            store
                .put_contract(project_id, version, &projection, &content_hash, source)
                .await?;
            Ok(ContractVersion { version, bumped: true })
        }
        None => {
            store
                .put_contract(project_id, 1, &projection, &content_hash, source)
                .await?;
            Ok(ContractVersion { version: 1, bumped: true })
        }
    }
}

/// Read the stored contract, if any.
pub async fn get_contract(
    store: &PipelineStore,
    project_id: Uuid,
) -> Result<Option<Value>, ContractError> {
    Ok(store.get_contract_row(project_id).await?.map(|row| row.contract))
}

async fn build_projection(
    store: &PipelineStore,
    project: &Project,
    source: &str,
) -> Result<Value, ContractError> {
    let mut contract = empty_contract(project.id, source);

    if let Some(onboarding) = store.get_onboarding(project.id).await? {
        let status = if onboarding.submitted_at.is_some() {
            "submitted"
        } else {
            "draft"
        };
        contract["onboarding"] = json!({
            "status": status,
            "summary": format!(
                "{} | {} | priority={}",
                project.title, project.client_name, project.priority
            ),
            "primary_contact": onboarding.contacts,
            "brand": onboarding.brand,
            "design_preferences": onboarding.design_preferences,
            "compliance": onboarding.compliance,
            "website_fundamentals": onboarding.fundamentals,
            "feature_tags": onboarding.feature_tags,
            "completion_percent": onboarding.completion_percent,
            "submitted_at": onboarding.submitted_at.map(|t| t.to_rfc3339()),
            "field_sentinels": onboarding.field_sentinels,
        });

        if let Some(template_id) = onboarding.selected_template_id {
            if let Some(template) = store.get_template(template_id).await? {
                contract["template"] = json!({
                    "selected_template_id": template.id.to_string(),
                    "selected_template_version": template.version,
                    "blueprint_ref": template.blueprint_hash,
                    "category": template.category,
                    "status": template.status,
                    "validation_status": template.validation_status,
                });
            }
        }
    }

    contract["assignments"] = json!({
        "consultant_id": project.consultant_user_id.map(|u| u.to_string()),
        "builder_id": project.builder_user_id.map(|u| u.to_string()),
        "tester_id": project.tester_user_id.map(|u| u.to_string()),
    });

    let artifacts = store.list_artifacts(project.id).await?;
    contract["artifacts"]["uploads"] = Value::Array(
        artifacts
            .iter()
            .map(|a| {
                json!({
                    "id": a.id.to_string(),
                    "kind": a.kind,
                    "key": a.storage_key,
                    "size_bytes": a.size_bytes,
                })
            })
            .collect(),
    );

    for output in store.latest_stage_outputs(project.id).await? {
        let key = output.stage.key();
        contract["stages"][key] = json!({
            "status": output.status,
            "outputs": output.outputs,
        });
        if output.stage == Stage::Build {
            if let Some(preview_url) = output.outputs.get("preview_url") {
                contract["artifacts"]["build_outputs"]["preview_url"] = preview_url.clone();
            }
            if let Some(bundle_url) = output.outputs.get("bundle_url") {
                contract["artifacts"]["build_outputs"]["bundle_url"] = bundle_url.clone();
            }
        }
        if output.stage == Stage::Test {
            if let Some(quality) = output.outputs.get("quality") {
                contract["quality"] = quality.clone();
            }
        }
    }

    let approvals = store.list_approvals(project.id).await?;
    contract["approvals"] = Value::Array(
        approvals
            .iter()
            .map(|a| {
                json!({
                    "stage_key": a.stage_key,
                    "status": a.status.encode(),
                    "fingerprint": a.inputs_fingerprint,
                })
            })
            .collect(),
    );

    Ok(contract)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_has_all_stage_keys() {
        let contract = empty_contract(Uuid::new_v4(), "system:test");
        let stages = contract["stages"].as_object().expect("stages object");
        assert_eq!(stages.len(), STAGE_KEYS.len());
        assert_eq!(stages["6_complete"]["status"], "not_started");
        assert_eq!(stages["12_reserved"]["status"], "not_started");
    }

    #[test]
    fn skeleton_quality_slots_are_null() {
        let contract = empty_contract(Uuid::new_v4(), "system:test");
        assert!(contract["quality"]["lighthouse"]["perf"].is_null());
        assert!(contract["quality"]["axe"]["critical"].is_null());
    }
}
