//! Escalating client reminders during onboarding, ending in HOLD.
//!
//! Each scan tick walks projects sitting in ONBOARDING with auto reminders
//! enabled and no submission yet. Within the cadence window nothing happens;
//! past the reminder cap the project goes to HOLD; otherwise one reminder is
//! sent and the counters advance. Email failures are retried with backoff
//! and, if still failing, skipped until the next tick — they never block
//! stage transitions or put the project on HOLD by themselves.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::collaborators::EmailNotifier;
use crate::config::DecisionPolicies;
use crate::events::NotificationBus;
use crate::stages::Stage;
use crate::store::{PipelineStore, StoreError};
use crate::util::retry::with_retry;

/// What one tick did for one project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReminderAction {
    /// Within the cadence window, or onboarding already submitted.
    Skipped,
    /// One reminder sent; counter now at the contained value.
    Sent(i64),
    /// Reminder cap reached; project moved to HOLD.
    Held,
    /// Email collaborator kept failing; will retry next tick.
    SendFailed,
}

/// Run one reminder tick for every project currently in ONBOARDING.
#[instrument(skip(store, email, bus, policies), err)]
pub async fn run_reminder_scan(
    store: &PipelineStore,
    email: Arc<dyn EmailNotifier>,
    bus: &NotificationBus,
    policies: &DecisionPolicies,
    portal_base_url: &str,
) -> Result<Vec<(Uuid, ReminderAction)>, StoreError> {
    let mut actions = Vec::new();
    for project in store.list_projects_in_stage(Stage::Onboarding).await? {
        let action = run_reminder_tick(
            store,
            email.clone(),
            bus,
            policies,
            portal_base_url,
            project.id,
        )
        .await?;
        actions.push((project.id, action));
    }
    Ok(actions)
}

/// Run the reminder policy for one project.
#[instrument(skip(store, email, bus, policies), err)]
pub async fn run_reminder_tick(
    store: &PipelineStore,
    email: Arc<dyn EmailNotifier>,
    bus: &NotificationBus,
    policies: &DecisionPolicies,
    portal_base_url: &str,
    project_id: Uuid,
) -> Result<ReminderAction, StoreError> {
    let Some(project) = store.get_project(project_id).await? else {
        return Ok(ReminderAction::Skipped);
    };
    if project.current_stage != Stage::Onboarding {
        return Ok(ReminderAction::Skipped);
    }
    let Some(onboarding) = store.get_onboarding(project_id).await? else {
        return Ok(ReminderAction::Skipped);
    };
    if !onboarding.auto_reminder_enabled || onboarding.submitted_at.is_some() {
        return Ok(ReminderAction::Skipped);
    }

    let now = Utc::now();
    let cadence_hours = onboarding
        .reminder_interval_hours
        .unwrap_or(policies.reminder_cadence_hours)
        .max(1);
    if let Some(last) = onboarding.last_reminder_sent_at {
        if now - last < ChronoDuration::hours(cadence_hours) {
            return Ok(ReminderAction::Skipped);
        }
    }

    if onboarding.reminder_count >= policies.max_reminders {
        let reason = format!(
            "Awaiting client response. We attempted to contact you {} times.",
            onboarding.reminder_count
        );
        store.set_project_hold(project_id, &reason, None).await?;
        bus.emit(
            "PROJECT_HOLD",
            project_id,
            Some(Stage::Onboarding.key()),
            json!({"reason": reason}),
        );
        return Ok(ReminderAction::Held);
    }

    let recipients: Vec<String> = project
        .client_emails
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let portal_url = format!("{portal_base_url}/client-onboarding/{project_id}");
    let message = format!(
        "Hi {}, your onboarding form for \"{}\" is still waiting. \
         Completing it lets our team start building right away.",
        project.client_name, project.title
    );

    let send = with_retry(3, Duration::from_secs(1), Duration::from_secs(4), || {
        let email = email.clone();
        let recipients = recipients.clone();
        let message = message.clone();
        let portal_url = portal_url.clone();
        async move {
            email
                .send_client_reminder(project_id, &recipients, &message, &portal_url)
                .await
        }
    })
    .await;
    if let Err(err) = send {
        warn!(%project_id, %err, "reminder email failed after retries; will retry next tick");
        return Ok(ReminderAction::SendFailed);
    }

    let next = now + ChronoDuration::hours(cadence_hours);
    store.record_reminder_sent(project_id, now, Some(next)).await?;
    let count = onboarding.reminder_count + 1;
    bus.emit(
        "CLIENT_REMINDER_SENT",
        project_id,
        Some(Stage::Onboarding.key()),
        json!({"reminder_count": count, "next_reminder_at": next.to_rfc3339()}),
    );

    // Reaching the cap on this send exhausts the policy immediately.
    if count >= policies.max_reminders {
        let reason = format!(
            "Awaiting client response. We attempted to contact you {count} times."
        );
        store.set_project_hold(project_id, &reason, None).await?;
        bus.emit(
            "PROJECT_HOLD",
            project_id,
            Some(Stage::Onboarding.key()),
            json!({"reason": reason}),
        );
        return Ok(ReminderAction::Held);
    }
    Ok(ReminderAction::Sent(count))
}
