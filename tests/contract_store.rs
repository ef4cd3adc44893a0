//! Delivery contract versioning: strictly increasing on change, stable when
//! the projection is unchanged.

mod common;

use serde_json::Value;
use siteline::contract::{create_or_update_contract, get_contract};

#[tokio::test]
async fn first_build_creates_version_one() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;

    let version = create_or_update_contract(store, project_id, "test").await.unwrap();
    assert_eq!(version.version, 1);
    assert!(version.bumped);

    let contract = get_contract(store, project_id).await.unwrap().unwrap();
    assert_eq!(contract["meta"]["schema_version"], Value::from(1));
    assert_eq!(contract["stages"]["0_sales"]["status"], Value::from("not_started"));
}

#[tokio::test]
async fn unchanged_projection_keeps_the_version() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;

    let first = create_or_update_contract(store, project_id, "test").await.unwrap();
    let second = create_or_update_contract(store, project_id, "test").await.unwrap();
    assert_eq!(second.version, first.version);
    assert!(!second.bumped);
}

#[tokio::test]
async fn input_change_bumps_version_strictly() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    let template_id = common::seed_validated_template(store).await;

    let v1 = create_or_update_contract(store, project_id, "test").await.unwrap();
    common::complete_onboarding(store, project_id, template_id).await;
    let v2 = create_or_update_contract(store, project_id, "test").await.unwrap();
    assert!(v2.bumped);
    assert!(v2.version > v1.version);

    let contract = get_contract(store, project_id).await.unwrap().unwrap();
    assert_eq!(contract["onboarding"]["status"], Value::from("submitted"));
    assert_eq!(
        contract["template"]["selected_template_id"],
        Value::from(template_id.to_string())
    );
}

#[tokio::test]
async fn source_label_change_alone_does_not_bump() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;

    create_or_update_contract(store, project_id, "system:a").await.unwrap();
    let second = create_or_update_contract(store, project_id, "system:b").await.unwrap();
    assert!(!second.bumped, "updated_by is not part of the content hash");
}
