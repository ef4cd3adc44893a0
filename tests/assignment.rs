//! Auto-assignment behavior: role filling, counters, rationale, capacity
//! exhaustion, and idempotence.

mod common;

use siteline::assignment::{AssignmentOutcome, run_auto_assignment};
use siteline::model::{Availability, Role, StageStateStatus};
use siteline::store::users::NewUser;

#[tokio::test]
async fn fills_all_three_roles_with_rationale_and_counters() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    let (consultant_id, builder_id, tester_id) = common::seed_team(store).await;

    let outcome = run_auto_assignment(store, h.ctx.ai.clone(), project_id, false)
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Assigned);

    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.consultant_user_id, Some(consultant_id));
    assert_eq!(project.builder_user_id, Some(builder_id));
    assert_eq!(project.tester_user_id, Some(tester_id));

    for user_id in [consultant_id, builder_id, tester_id] {
        let user = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.active_assignments_count, 1);
    }

    let rationale = project.assignment_rationale.unwrap();
    for role in ["consultant", "builder", "tester"] {
        let entry = rationale.get(role).unwrap();
        assert!(entry["score"].as_f64().unwrap() > 0.0);
        assert!(entry["reasons"].as_array().unwrap().iter().any(|r| {
            r.as_str().unwrap().starts_with("skill_match=")
        }));
    }

    let state = store
        .get_stage_state(project_id, "2_assignment")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, StageStateStatus::Complete);
}

#[tokio::test]
async fn missing_role_blocks_with_explicit_reason() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    // Only a consultant exists; builder and tester are missing.
    store
        .create_user(NewUser::new("Cora Consultant", Role::Consultant))
        .await
        .unwrap();

    let outcome = run_auto_assignment(store, h.ctx.ai.clone(), project_id, false)
        .await
        .unwrap();
    let AssignmentOutcome::Blocked(reasons) = outcome else {
        panic!("expected blocked outcome, got {outcome:?}");
    };
    assert!(reasons.contains(&"No available builder".to_string()));
    assert!(reasons.contains(&"No available tester".to_string()));

    let state = store
        .get_stage_state(project_id, "2_assignment")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, StageStateStatus::Blocked);
    assert!(state.required_actions.iter().any(|a| a.starts_with("Assign:")));
}

#[tokio::test]
async fn candidates_at_capacity_are_passed_over() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    // Best-scoring builder is full; the second should be picked.
    let mut busy = NewUser::new("Full Builder", Role::Builder);
    busy.capacity = 1;
    busy.performance_score = Some(1.0);
    let busy = store.create_user(busy).await.unwrap();
    store.bump_assignment_count(busy.id, 1).await.unwrap();
    let fallback = store
        .create_user(NewUser::new("Free Builder", Role::Builder))
        .await
        .unwrap();
    store
        .create_user(NewUser::new("Cora Consultant", Role::Consultant))
        .await
        .unwrap();
    store
        .create_user(NewUser::new("Tess Tester", Role::Tester))
        .await
        .unwrap();

    run_auto_assignment(store, h.ctx.ai.clone(), project_id, false)
        .await
        .unwrap();
    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.builder_user_id, Some(fallback.id));
}

#[tokio::test]
async fn out_of_office_users_are_never_candidates() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    let (_, builder_id, _) = common::seed_team(store).await;
    store
        .set_user_availability(builder_id, Availability::OutOfOffice)
        .await
        .unwrap();

    let outcome = run_auto_assignment(store, h.ctx.ai.clone(), project_id, false)
        .await
        .unwrap();
    let AssignmentOutcome::Blocked(reasons) = outcome else {
        panic!("expected blocked outcome, got {outcome:?}");
    };
    assert!(reasons.contains(&"No available builder".to_string()));
}

#[tokio::test]
async fn rerun_is_idempotent_and_rate_limited() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    common::seed_team(store).await;

    assert_eq!(
        run_auto_assignment(store, h.ctx.ai.clone(), project_id, false).await.unwrap(),
        AssignmentOutcome::Assigned
    );
    // Fully assigned: the rerun skips before touching anything.
    let outcome = run_auto_assignment(store, h.ctx.ai.clone(), project_id, false)
        .await
        .unwrap();
    assert!(matches!(outcome, AssignmentOutcome::Skipped(_)));

    // Counters did not double-increment.
    let project = store.get_project(project_id).await.unwrap().unwrap();
    let builder = store
        .get_user(project.builder_user_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(builder.active_assignments_count, 1);

    // A forced rerun within the window still runs and keeps counts stable.
    run_auto_assignment(store, h.ctx.ai.clone(), project_id, true)
        .await
        .unwrap();
    let builder = store.get_user(builder.id).await.unwrap().unwrap();
    assert_eq!(builder.active_assignments_count, 1, "decrement then increment");
}

#[tokio::test]
async fn high_priority_projects_boost_sla_score() {
    let h = common::harness().await;
    let store = h.store();
    let normal_id = common::create_project(store, "P1").await;
    let urgent = store
        .create_project(siteline::store::projects::NewProject {
            title: "P2".to_string(),
            client_name: "C2".to_string(),
            priority: "CRITICAL".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let user = store
        .create_user(NewUser::new("Ben Builder", Role::Builder))
        .await
        .unwrap();
    let normal = store.get_project(normal_id).await.unwrap().unwrap();

    let (normal_score, _) = siteline::assignment::score_user_for_project(
        &user,
        &normal,
        None,
        Role::Builder,
    );
    let (urgent_score, reasons) = siteline::assignment::score_user_for_project(
        &user,
        &urgent,
        None,
        Role::Builder,
    );
    assert!(urgent_score > normal_score);
    assert!(reasons.iter().any(|r| r == "sla_urgency=0.90"), "{reasons:?}");
}
