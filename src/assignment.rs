//! Role-based auto-assignment.
//!
//! Candidates are scored deterministically from five weighted signals, with
//! an optional AI re-rank when the deterministic order is a near-tie or the
//! project is high risk. Scores and reasons are persisted as rationale so an
//! operator can always see why someone was picked.
//!
//! Weights: skill 0.35, workload 0.25, availability 0.15, performance 0.15,
//! SLA urgency 0.10. All component scores live in `[0, 1]`.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::ai::{AiClient, parse_ai_json};
use crate::contract::create_or_update_contract;
use crate::model::{Availability, Project, Role, StageStateStatus, User};
use crate::stages::Stage;
use crate::store::PipelineStore;

pub const WEIGHT_SKILL: f64 = 0.35;
pub const WEIGHT_WORKLOAD: f64 = 0.25;
pub const WEIGHT_AVAILABILITY: f64 = 0.15;
pub const WEIGHT_PERFORMANCE: f64 = 0.15;
pub const WEIGHT_SLA_URGENCY: f64 = 0.10;

/// Re-runs within this window are skipped unless forced.
pub const RATE_LIMIT_MINUTES: i64 = 5;

/// A near-tie between the top two candidates triggers the AI re-rank.
const RERANK_TIE_EPSILON: f64 = 0.05;

/// The three roles the engine fills, with their project column and rationale
/// key.
const ROLES_TO_ASSIGN: [(Role, &str, &str); 3] = [
    (Role::Consultant, "consultant", "consultant_user_id"),
    (Role::Builder, "builder", "builder_user_id"),
    (Role::Tester, "tester", "tester_user_id"),
];

/// Outcome of one auto-assignment run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssignmentOutcome {
    /// All roles filled (or already were).
    Assigned,
    /// Some roles could not be filled; stage `2_assignment` is blocked.
    Blocked(Vec<String>),
    /// Rate-limited or already fully assigned without `force`.
    Skipped(String),
}

// ---------------------------------------------------------------------------
// Deterministic scoring (pure).
// ---------------------------------------------------------------------------

/// Skills a project wants for a role, derived from project features, the
/// contract's template category, and onboarding feature tags. Falls back to
/// a per-role default set so new projects still rank sensibly.
#[must_use]
pub fn project_need_skills(project: &Project, contract: Option<&Value>, role: Role) -> Vec<String> {
    let mut needs: Vec<String> = Vec::new();
    match &project.features {
        Value::Array(items) => {
            needs.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_lowercase));
        }
        Value::Object(map) => needs.extend(map.keys().map(|k| k.to_lowercase())),
        _ => {}
    }
    if let Some(contract) = contract {
        if let Some(category) = contract
            .pointer("/template/category")
            .or_else(|| contract.pointer("/onboarding/category"))
            .and_then(Value::as_str)
        {
            needs.push(category.to_lowercase());
        }
        if let Some(tags) = contract
            .pointer("/onboarding/feature_tags")
            .and_then(Value::as_array)
        {
            needs.extend(tags.iter().filter_map(|v| v.as_str()).map(str::to_lowercase));
        }
    }
    if needs.is_empty() {
        needs = match role {
            Role::Builder => vec!["react".into(), "property_management".into(), "seo".into()],
            Role::Tester => vec!["qa".into(), "accessibility".into(), "testing".into()],
            Role::Consultant => {
                vec!["property_management".into(), "client_communication".into()]
            }
            _ => Vec::new(),
        };
    }
    let mut seen = Vec::new();
    needs.retain(|n| {
        if seen.contains(n) {
            false
        } else {
            seen.push(n.clone());
            true
        }
    });
    needs
}

/// Overlap with need skills, with a +0.2 floor to reward any match. 0.7 when
/// the project expresses no needs.
#[must_use]
pub fn skill_match_score(user_skills: &[String], need_skills: &[String]) -> f64 {
    if need_skills.is_empty() {
        return 0.7;
    }
    let user: Vec<String> = user_skills.iter().map(|s| s.trim().to_lowercase()).collect();
    let matched = need_skills
        .iter()
        .filter(|need| user.contains(&need.trim().to_lowercase()))
        .count();
    let overlap = matched as f64 / need_skills.len() as f64;
    (overlap + 0.2).min(1.0)
}

#[must_use]
pub fn workload_score(active: i64, capacity: i64) -> f64 {
    if capacity <= 0 {
        return 0.0;
    }
    (1.0 - active as f64 / capacity as f64).clamp(0.0, 1.0)
}

#[must_use]
pub fn availability_score(availability: Availability) -> f64 {
    match availability {
        Availability::Available => 1.0,
        Availability::Busy => 0.5,
        Availability::OutOfOffice => 0.0,
    }
}

#[must_use]
pub fn performance_score(score: Option<f64>) -> f64 {
    score.map_or(0.7, |s| s.clamp(0.0, 1.0))
}

/// Higher urgency favors available, capable users when the SLA is tight.
#[must_use]
pub fn sla_urgency_score(project: &Project) -> f64 {
    if project.is_high_priority() {
        0.9
    } else if project.is_delayed {
        0.85
    } else {
        0.5
    }
}

/// Score one candidate, returning the composite and the reason breakdown.
#[must_use]
pub fn score_user_for_project(
    user: &User,
    project: &Project,
    contract: Option<&Value>,
    role: Role,
) -> (f64, Vec<String>) {
    let needs = project_need_skills(project, contract, role);
    let skill = skill_match_score(&user.skills, &needs);
    let workload = workload_score(user.active_assignments_count, user.capacity.max(1));
    let availability = availability_score(user.availability);
    let performance = performance_score(user.performance_score);
    let sla = sla_urgency_score(project);
    let reasons = vec![
        format!("skill_match={skill:.2}"),
        format!(
            "workload={workload:.2}({}/{})",
            user.active_assignments_count,
            user.capacity.max(1)
        ),
        format!("availability={availability:.2}"),
        format!("performance={performance:.2}"),
        format!("sla_urgency={sla:.2}"),
    ];
    let score = WEIGHT_SKILL * skill
        + WEIGHT_WORKLOAD * workload
        + WEIGHT_AVAILABILITY * availability
        + WEIGHT_PERFORMANCE * performance
        + WEIGHT_SLA_URGENCY * sla;
    (score.clamp(0.0, 1.0), reasons)
}

/// Rank eligible candidates for a role, best first.
pub async fn rank_candidates(
    store: &PipelineStore,
    project: &Project,
    contract: Option<&Value>,
    role: Role,
) -> Result<Vec<(User, f64, Vec<String>)>, crate::store::StoreError> {
    let users = store.list_eligible_users(role).await?;
    let mut scored: Vec<(User, f64, Vec<String>)> = users
        .into_iter()
        .map(|user| {
            let (score, reasons) = score_user_for_project(&user, project, contract, role);
            (user, score, reasons)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(scored)
}

// ---------------------------------------------------------------------------
// AI re-rank (optional, never load-bearing).
// ---------------------------------------------------------------------------

/// Ask the AI collaborator to re-order a near-tie. Any failure falls back to
/// the deterministic order.
async fn rerank_with_ai(
    ai: &dyn AiClient,
    role_key: &str,
    ranked: Vec<(User, f64, Vec<String>)>,
    project_summary: &str,
) -> Vec<(User, f64, Vec<String>)> {
    let candidates: Vec<Value> = ranked
        .iter()
        .take(5)
        .map(|(user, score, reasons)| {
            json!({
                "user_id": user.id.to_string(),
                "name": user.name,
                "score": score,
                "reasons": reasons,
            })
        })
        .collect();
    let prompt = format!(
        "You are an assignment assistant. Given a list of candidates for role \"{role_key}\", \
         re-rank them best-first. Consider workload balance and skills.\n\
         Project context: {}\nCandidates (score, reasons):\n{}\n\
         Return valid JSON only: {{ \"ranked_user_ids\": [\"uuid1\", ...], \"reasoning\": \"one sentence\" }}\n\
         If order is fine as-is, return the same order.",
        &project_summary.chars().take(500).collect::<String>(),
        Value::Array(candidates),
    );
    let raw = match ai.complete("assignment.rerank", &prompt).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "assignment re-rank failed; keeping deterministic order");
            return ranked;
        }
    };
    let Ok(parsed) = parse_ai_json("assignment.rerank", &raw) else {
        warn!("assignment re-rank returned non-JSON; keeping deterministic order");
        return ranked;
    };
    let Some(ids) = parsed.get("ranked_user_ids").and_then(Value::as_array) else {
        return ranked;
    };
    let wanted: Vec<Uuid> = ids
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();
    if wanted.is_empty() {
        return ranked;
    }
    let mut reordered = Vec::with_capacity(ranked.len());
    let mut remaining = ranked;
    for id in &wanted {
        if let Some(pos) = remaining.iter().position(|(u, _, _)| u.id == *id) {
            reordered.push(remaining.remove(pos));
        }
    }
    reordered.extend(remaining);
    reordered
}

// ---------------------------------------------------------------------------
// The assignment run.
// ---------------------------------------------------------------------------

/// Fill consultant/builder/tester for a project.
///
/// Idempotent unless `force`: already-filled roles are kept, and a run
/// within the rate-limit window is skipped. On any unfillable role the
/// `2_assignment` stage-state is blocked with explicit reasons; otherwise it
/// completes and the caller re-evaluates the pipeline.
#[instrument(skip(store, ai), err)]
pub async fn run_auto_assignment(
    store: &PipelineStore,
    ai: Arc<dyn AiClient>,
    project_id: Uuid,
    force: bool,
) -> Result<AssignmentOutcome, crate::store::StoreError> {
    let Some(project) = store.get_project(project_id).await? else {
        return Ok(AssignmentOutcome::Skipped("Project not found".to_string()));
    };
    let contract = match crate::contract::get_contract(store, project_id).await {
        Ok(contract) => contract,
        Err(_) => None,
    };

    if !force
        && project.consultant_user_id.is_some()
        && project.builder_user_id.is_some()
        && project.tester_user_id.is_some()
    {
        return Ok(AssignmentOutcome::Skipped("Already fully assigned".to_string()));
    }

    let mut rationale = project
        .assignment_rationale
        .clone()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let now = Utc::now();
    if !force {
        if let Some(last) = rationale
            .get("run_at")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        {
            if (now - last.with_timezone(&Utc)).num_seconds() < RATE_LIMIT_MINUTES * 60 {
                return Ok(AssignmentOutcome::Skipped("Rate limited".to_string()));
            }
        }
    }
    rationale.insert("run_at".to_string(), json!(now.to_rfc3339()));

    let project_summary = format!(
        "{} | {} | priority={}",
        project.title, project.client_name, project.priority
    );
    let high_risk = project.is_high_priority() || project.is_delayed;
    let mut blocked: Vec<String> = Vec::new();

    for (role, role_key, column) in ROLES_TO_ASSIGN {
        let current = match column {
            "consultant_user_id" => project.consultant_user_id,
            "builder_user_id" => project.builder_user_id,
            _ => project.tester_user_id,
        };
        if !force && current.is_some() {
            continue;
        }
        let mut ranked = rank_candidates(store, &project, contract.as_ref(), role).await?;
        if ranked.is_empty() {
            blocked.push(format!("No available {role_key}"));
            rationale.insert(
                role_key.to_string(),
                json!({"user_id": null, "reasons": [format!("No eligible {role_key}")], "score": 0.0}),
            );
            continue;
        }
        let near_tie =
            ranked.len() >= 2 && (ranked[0].1 - ranked[1].1).abs() < RERANK_TIE_EPSILON;
        if high_risk || near_tie {
            ranked = rerank_with_ai(ai.as_ref(), role_key, ranked, &project_summary).await;
        }
        let chosen = ranked.iter().find(|(user, _, _)| user.has_capacity());
        let Some((user, score, reasons)) = chosen else {
            blocked.push(format!("No {role_key} with capacity"));
            rationale.insert(
                role_key.to_string(),
                json!({"user_id": null, "reasons": ["All at capacity"], "score": 0.0}),
            );
            continue;
        };
        if let Some(previous) = current {
            store.bump_assignment_count(previous, -1).await?;
        }
        store
            .set_project_role_user(project_id, column, Some(user.id))
            .await?;
        store.bump_assignment_count(user.id, 1).await?;
        rationale.insert(
            role_key.to_string(),
            json!({
                "user_id": user.id.to_string(),
                "reasons": reasons,
                "score": (score * 100.0).round() / 100.0,
                "auto_assigned": true,
            }),
        );
    }

    let rationale_value = Value::Object(rationale);
    store.set_assignment_rationale(project_id, &rationale_value).await?;
    store
        .add_pipeline_event(
            project_id,
            Some(Stage::Assignment.key()),
            "AUTO_ASSIGNED",
            json!({"rationale": rationale_value}),
        )
        .await?;

    if !blocked.is_empty() {
        let actions: Vec<String> = blocked.iter().map(|b| format!("Assign: {b}")).collect();
        store
            .set_stage_state(
                project_id,
                Stage::Assignment.key(),
                StageStateStatus::Blocked,
                &blocked,
                &actions,
            )
            .await?;
        return Ok(AssignmentOutcome::Blocked(blocked));
    }

    if let Err(err) = create_or_update_contract(store, project_id, "system:auto_assigned").await {
        warn!(%err, "contract rebuild after auto-assignment failed");
    }
    store
        .set_stage_state(
            project_id,
            Stage::Assignment.key(),
            StageStateStatus::Complete,
            &[],
            &[],
        )
        .await?;
    Ok(AssignmentOutcome::Assigned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_score_floor_and_cap() {
        let needs: Vec<String> = vec!["seo".into(), "react".into()];
        let none: Vec<String> = vec![];
        assert!((skill_match_score(&none, &needs) - 0.2).abs() < 1e-9);
        let one: Vec<String> = vec!["SEO ".into()];
        assert!((skill_match_score(&one, &needs) - 0.7).abs() < 1e-9);
        let both: Vec<String> = vec!["seo".into(), "react".into()];
        assert!((skill_match_score(&both, &needs) - 1.0).abs() < 1e-9);
        assert!((skill_match_score(&none, &[]) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn workload_score_bounds() {
        assert!((workload_score(0, 2) - 1.0).abs() < 1e-9);
        assert!((workload_score(1, 2) - 0.5).abs() < 1e-9);
        assert!((workload_score(3, 2) - 0.0).abs() < 1e-9);
        assert!((workload_score(1, 0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn availability_and_performance_scores() {
        assert!((availability_score(Availability::Available) - 1.0).abs() < 1e-9);
        assert!((availability_score(Availability::Busy) - 0.5).abs() < 1e-9);
        assert!((availability_score(Availability::OutOfOffice) - 0.0).abs() < 1e-9);
        assert!((performance_score(None) - 0.7).abs() < 1e-9);
        assert!((performance_score(Some(1.5)) - 1.0).abs() < 1e-9);
        assert!((performance_score(Some(-0.2)) - 0.0).abs() < 1e-9);
    }
}
