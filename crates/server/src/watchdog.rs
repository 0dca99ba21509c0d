//! Periodic SLA sweep over open work items and in-review approvals.
//!
//! An item escalates at most once per breach episode. The flag is set with a conditional write
//! before the event is appended and the parent notified, so a concurrent sweep that loses the
//! flag race never records a second event. When the event cannot be written the flag is cleared
//! again and the item is retried on the next sweep. Resolution, reassignment and level entry end
//! the episode.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagehand_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use stagehand_core::domain::escalation::{EscalationEvent, EscalationEventId, SlaStatus};
use stagehand_core::domain::instance::{ApprovalInstance, InstanceId};
use stagehand_core::domain::work_item::{WorkItem, WorkItemId};
use stagehand_core::domain::WorkspaceId;
use stagehand_core::errors::ApplicationError;
use stagehand_core::hierarchy::HierarchyResolver;
use stagehand_core::notify::{NotificationIntent, NotificationTarget};

use crate::workflow::{new_correlation_id, ApprovalWorkflowService};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EscalationStats {
    pub processed: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EscalationSweep {
    pub events: Vec<EscalationEvent>,
    pub stats: EscalationStats,
}

enum ItemOutcome {
    NotDue,
    Escalated(EscalationEvent),
    Skipped,
}

pub struct EscalationWatchdog {
    service: Arc<ApprovalWorkflowService>,
    batch_size: u32,
}

impl EscalationWatchdog {
    pub fn new(service: Arc<ApprovalWorkflowService>, batch_size: u32) -> Self {
        Self { service, batch_size: batch_size.max(1) }
    }

    /// One pass over everything open, one page of `batch_size` at a time. A failure on one item
    /// is logged and counted; the sweep carries on with the rest.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<EscalationSweep, ApplicationError> {
        let repositories = self.service.repositories();
        let threshold = i64::from(self.service.planner.breach_threshold_hours());
        let due_before = now - Duration::hours(threshold);
        let mut sweep = EscalationSweep::default();

        let mut after_item: Option<WorkItemId> = None;
        loop {
            let page = repositories
                .work_items
                .list_escalation_candidates(due_before, after_item.as_ref(), self.batch_size)
                .await?;
            let exhausted = page.len() < self.batch_size as usize;
            after_item = page.last().map(|item| item.id.clone());

            for item in page {
                let item_id = item.id.clone();
                let outcome = self.check_work_item(item, now).await;
                record(&mut sweep, &item_id.0, outcome);
            }
            if exhausted {
                break;
            }
        }

        let mut after_instance: Option<InstanceId> = None;
        loop {
            let page =
                repositories.instances.list_active(after_instance.as_ref(), self.batch_size).await?;
            let exhausted = page.len() < self.batch_size as usize;
            after_instance = page.last().map(|instance| instance.id.clone());

            for instance in page {
                if !instance.current_stage.is_review() {
                    continue;
                }
                let instance_id = instance.id.clone();
                let outcome = self.check_instance(instance, now).await;
                record(&mut sweep, &instance_id.0, outcome);
            }
            if exhausted {
                break;
            }
        }

        if sweep.stats.processed > 0 {
            info!(
                event_name = "watchdog.sweep_completed",
                processed = sweep.stats.processed,
                escalated = sweep.stats.escalated,
                skipped = sweep.stats.skipped,
                failed = sweep.stats.failed,
                "escalation sweep completed"
            );
        } else {
            debug!(event_name = "watchdog.sweep_idle", "nothing breached");
        }

        Ok(sweep)
    }

    async fn check_work_item(
        &self,
        mut item: WorkItem,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, ApplicationError> {
        if item.escalated {
            return Ok(ItemOutcome::NotDue);
        }
        match self.service.planner.assess(&item, now) {
            Some(assessment) if assessment.status == SlaStatus::Breached => {}
            _ => return Ok(ItemOutcome::NotDue),
        }
        if item.parent_workspace_id.is_none() {
            match self.parent_of(&item.workspace_id, &item.id.0) {
                Some(parent) => item.parent_workspace_id = parent,
                None => return Ok(ItemOutcome::Skipped),
            }
        }
        let Some(event) = self.service.planner.plan(&item, new_event_id(), now) else {
            return Ok(ItemOutcome::NotDue);
        };

        let work_items = &self.service.repositories().work_items;
        let marked = work_items.mark_escalated(&item.id, &event.escalated_to, now).await?;
        if !marked {
            debug!(
                event_name = "watchdog.already_escalated",
                work_item_id = %item.id,
                "item escalated by a concurrent sweep"
            );
            return Ok(ItemOutcome::Skipped);
        }

        if let Err(error) = self.service.repositories().escalations.append(event.clone()).await {
            match work_items.revert_escalation(&item.id, &item.owner_workspace_id, now).await {
                Ok(true) => {}
                Ok(false) => warn_revert_failed(&item.id.0, "item changed before the revert"),
                Err(revert) => warn_revert_failed(&item.id.0, &revert.to_string()),
            }
            return Err(error.into());
        }

        Ok(self.announce(event, now))
    }

    async fn check_instance(
        &self,
        instance: ApprovalInstance,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, ApplicationError> {
        if instance.escalated {
            return Ok(ItemOutcome::NotDue);
        }
        let projected = instance.as_work_item(self.service.approval_sla_hours, None);
        match self.service.planner.assess(&projected, now) {
            Some(assessment) if assessment.status == SlaStatus::Breached => {}
            _ => return Ok(ItemOutcome::NotDue),
        }

        let parent = match self.parent_of(&instance.workspace_id, &instance.id.0) {
            Some(parent) => parent,
            None => return Ok(ItemOutcome::Skipped),
        };
        let projected = instance.as_work_item(self.service.approval_sla_hours, parent);
        let Some(event) = self.service.planner.plan(&projected, new_event_id(), now) else {
            return Ok(ItemOutcome::NotDue);
        };

        let mut next = instance.clone();
        next.escalated = true;
        next.escalated_at = Some(now);
        next.version = instance.version.saturating_add(1);
        next.updated_at = now;
        let instances = &self.service.repositories().instances;
        if !instances.compare_and_swap(instance.version, next.clone()).await? {
            debug!(
                event_name = "watchdog.instance_changed",
                instance_id = %instance.id,
                "instance changed during the sweep; re-checked next cycle"
            );
            return Ok(ItemOutcome::Skipped);
        }

        if let Err(error) = self.service.repositories().escalations.append(event.clone()).await {
            let mut reverted = next.clone();
            reverted.escalated = false;
            reverted.escalated_at = None;
            reverted.version = next.version.saturating_add(1);
            match instances.compare_and_swap(next.version, reverted).await {
                Ok(true) => {}
                Ok(false) => {
                    warn_revert_failed(&instance.id.0, "instance changed before the revert")
                }
                Err(revert) => warn_revert_failed(&instance.id.0, &revert.to_string()),
            }
            return Err(error.into());
        }

        Ok(self.announce(event, now))
    }

    /// `None` means the lookup failed and the item should be retried on a later sweep;
    /// `Some(None)` means the workspace is a root and there is nowhere to escalate to.
    fn parent_of(&self, workspace_id: &WorkspaceId, item_id: &str) -> Option<Option<WorkspaceId>> {
        match self.service.resolver.parent_workspace(workspace_id) {
            Ok(parent) => Some(parent),
            Err(error) => {
                warn!(
                    event_name = "watchdog.hierarchy_unavailable",
                    item_id,
                    workspace_id = %workspace_id,
                    error = %error,
                    "parent workspace lookup failed; item retried next sweep"
                );
                None
            }
        }
    }

    /// Notifies the parent workspace of a recorded escalation.
    fn announce(&self, event: EscalationEvent, now: DateTime<Utc>) -> ItemOutcome {
        self.service.send(
            NotificationTarget::Workspace(event.escalated_to.clone()),
            NotificationIntent::from_escalation(&event),
            now,
        );

        let correlation_id = new_correlation_id();
        self.service.audit.emit(
            AuditContext::new(None, Some(event.item_id.clone()), &correlation_id, "watchdog")
                .event("watchdog.item_escalated", AuditCategory::Escalation, AuditOutcome::Success)
                .with_metadata("escalated_from", event.escalated_from.0.clone())
                .with_metadata("escalated_to", event.escalated_to.0.clone())
                .with_metadata("overdue_hours", event.overdue_hours_at_escalation.to_string()),
        );
        info!(
            event_name = "watchdog.item_escalated",
            correlation_id = %correlation_id,
            item_id = %event.item_id,
            item_type = event.item_type.as_str(),
            escalated_from = %event.escalated_from,
            escalated_to = %event.escalated_to,
            overdue_hours = %event.overdue_hours_at_escalation,
            "breached item escalated to parent workspace"
        );

        ItemOutcome::Escalated(event)
    }
}

/// The flag stays set without an event; the episode is not retried automatically.
fn warn_revert_failed(item_id: &str, reason: &str) {
    warn!(
        event_name = "watchdog.revert_failed",
        item_id,
        reason,
        "escalation flag could not be cleared after the event write failed"
    );
}

fn new_event_id() -> EscalationEventId {
    EscalationEventId(Uuid::new_v4().to_string())
}

fn record(
    sweep: &mut EscalationSweep,
    item_id: &str,
    outcome: Result<ItemOutcome, ApplicationError>,
) {
    match outcome {
        Ok(ItemOutcome::NotDue) => {}
        Ok(ItemOutcome::Escalated(event)) => {
            sweep.stats.processed += 1;
            sweep.stats.escalated += 1;
            sweep.events.push(event);
        }
        Ok(ItemOutcome::Skipped) => {
            sweep.stats.processed += 1;
            sweep.stats.skipped += 1;
        }
        Err(error) => {
            warn!(
                event_name = "watchdog.item_failed",
                item_id,
                error = %error,
                "escalation check failed"
            );
            sweep.stats.processed += 1;
            sweep.stats.failed += 1;
        }
    }
}
