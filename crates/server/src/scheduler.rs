use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use stagehand_core::approvals::ApprovalError;
use stagehand_core::domain::instance::{ApprovalInstance, InstanceId};
use stagehand_core::errors::{ApplicationError, DomainError};
use stagehand_core::scheduler::plan_auto_approval;

use crate::workflow::{ApprovalWorkflowService, ReceiptStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AutoApprovalStats {
    pub processed: usize,
    pub advanced: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AutoApprovalSweep {
    pub advanced: Vec<InstanceId>,
    pub stats: AutoApprovalStats,
}

/// Advances levels whose policy auto-approval window has elapsed, acting as the system actor.
///
/// Auto-approvals go through the same commit path as human approvals, so a human decision that
/// lands first simply turns the system action into an `already_decided` no-op.
pub struct AutoApprovalScheduler {
    service: Arc<ApprovalWorkflowService>,
    batch_size: u32,
}

impl AutoApprovalScheduler {
    pub fn new(service: Arc<ApprovalWorkflowService>, batch_size: u32) -> Self {
        Self { service, batch_size: batch_size.max(1) }
    }

    /// Walks every active instance, one page of `batch_size` at a time.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<AutoApprovalSweep, ApplicationError> {
        let repositories = self.service.repositories();
        let mut sweep = AutoApprovalSweep::default();
        let mut after: Option<InstanceId> = None;

        loop {
            let page = repositories.instances.list_active(after.as_ref(), self.batch_size).await?;
            let exhausted = page.len() < self.batch_size as usize;
            after = page.last().map(|instance| instance.id.clone());

            for instance in page {
                self.check_instance(instance, now, &mut sweep).await;
            }
            if exhausted {
                break;
            }
        }

        if sweep.stats.processed > 0 || sweep.stats.failed > 0 {
            info!(
                event_name = "scheduler.sweep_completed",
                processed = sweep.stats.processed,
                advanced = sweep.stats.advanced,
                skipped = sweep.stats.skipped,
                failed = sweep.stats.failed,
                "auto-approval sweep completed"
            );
        } else {
            debug!(event_name = "scheduler.sweep_idle", "no levels due for auto-approval");
        }

        Ok(sweep)
    }

    async fn check_instance(
        &self,
        instance: ApprovalInstance,
        now: DateTime<Utc>,
        sweep: &mut AutoApprovalSweep,
    ) {
        let policy = match self.service.find_policy(&instance.policy_id).await {
            Ok(policy) => policy,
            Err(error) => {
                warn!(
                    event_name = "scheduler.policy_missing",
                    instance_id = %instance.id,
                    policy_id = %instance.policy_id,
                    error = %error,
                    "active instance references an unknown policy"
                );
                sweep.stats.failed += 1;
                return;
            }
        };
        let Some(due) = plan_auto_approval(&instance, &policy, now) else {
            return;
        };
        sweep.stats.processed += 1;

        match self.service.auto_approve(due, now).await {
            Ok(receipt) if receipt.status == ReceiptStatus::Committed => {
                info!(
                    event_name = "scheduler.auto_approved",
                    instance_id = %instance.id,
                    level = instance.current_level,
                    stage = receipt.instance.current_stage.as_str(),
                    "level auto-approved after policy timeout"
                );
                sweep.stats.advanced += 1;
                sweep.advanced.push(instance.id);
            }
            Ok(_) => sweep.stats.skipped += 1,
            Err(ApplicationError::Domain(DomainError::Approval(
                ApprovalError::HierarchyResolutionFailed { reason },
            ))) => {
                warn!(
                    event_name = "scheduler.hierarchy_unavailable",
                    instance_id = %instance.id,
                    reason = %reason,
                    "auto-approval postponed until the hierarchy resolves"
                );
                sweep.stats.skipped += 1;
            }
            Err(error) => {
                warn!(
                    event_name = "scheduler.auto_approval_failed",
                    instance_id = %instance.id,
                    error = %error,
                    "auto-approval failed"
                );
                sweep.stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use stagehand_core::approvals::ApproverActionRequest;
    use stagehand_core::domain::instance::{
        ApprovalStage, ApproverAction, HistoryAction, SYSTEM_ACTOR,
    };
    use stagehand_core::domain::WorkspaceId;

    use super::AutoApprovalScheduler;
    use crate::testing::{
        default_policy, directory, finance_policy, role_level, submitted, ts, Harness,
    };

    async fn harness_with_auto_approval() -> Harness {
        let harness = Harness::new(directory());
        let mut policy = default_policy();
        policy.chain = vec![role_level(1, "finance_lead"), role_level(2, "director")];
        policy.auto_approve_after_hours = Some(48);
        harness.save_policy(policy).await;
        harness
    }

    #[tokio::test]
    async fn timed_out_level_is_approved_by_the_system_actor() {
        let harness = harness_with_auto_approval().await;
        let submitted_at = ts("2026-03-02T09:00:00Z");
        let instance = submitted(&harness, "task-1", None, submitted_at).await;
        let scheduler = AutoApprovalScheduler::new(Arc::clone(&harness.service), 50);

        let early = scheduler.sweep(submitted_at + Duration::hours(47)).await.expect("sweep");
        assert!(early.advanced.is_empty());

        let sweep = scheduler.sweep(submitted_at + Duration::hours(49)).await.expect("sweep");
        assert_eq!(sweep.advanced, vec![instance.id.clone()]);
        assert_eq!(sweep.stats.advanced, 1);

        let stored = harness.service.find_instance(&instance.id).await.expect("instance");
        assert_eq!(stored.current_level, 2);
        assert_eq!(stored.current_stage, ApprovalStage::FinalApproval);
        let auto_entry = stored
            .history
            .iter()
            .find(|entry| entry.action == HistoryAction::Approve)
            .expect("approval recorded");
        assert_eq!(auto_entry.actor_id, SYSTEM_ACTOR);
        assert_eq!(stored.level_entered_at, submitted_at + Duration::hours(49));
    }

    #[tokio::test]
    async fn human_decision_before_the_sweep_wins() {
        let harness = harness_with_auto_approval().await;
        let submitted_at = ts("2026-03-02T09:00:00Z");
        let instance = submitted(&harness, "task-1", None, submitted_at).await;
        harness
            .service
            .record_approver_action(
                ApproverActionRequest {
                    instance_id: instance.id.clone(),
                    level: 1,
                    actor_id: "u-fin-1".to_string(),
                    action: ApproverAction::Approve,
                    notes: None,
                },
                submitted_at + Duration::hours(10),
            )
            .await
            .expect("human approval");
        let scheduler = AutoApprovalScheduler::new(Arc::clone(&harness.service), 50);

        let sweep = scheduler.sweep(submitted_at + Duration::hours(49)).await.expect("sweep");

        assert!(sweep.advanced.is_empty(), "level 2 entered at +10h is not due yet");
        let stored = harness.service.find_instance(&instance.id).await.expect("instance");
        assert!(stored.history.iter().all(|entry| entry.actor_id != SYSTEM_ACTOR));
    }

    #[tokio::test]
    async fn policy_without_timeout_is_never_auto_approved() {
        let harness = Harness::new(directory());
        harness.save_policy(default_policy()).await;
        let submitted_at = ts("2026-03-02T09:00:00Z");
        submitted(&harness, "task-1", None, submitted_at).await;
        let scheduler = AutoApprovalScheduler::new(Arc::clone(&harness.service), 50);

        let sweep = scheduler.sweep(submitted_at + Duration::days(30)).await.expect("sweep");

        assert_eq!(sweep.stats.processed, 0);
    }

    #[tokio::test]
    async fn hierarchy_outage_postpones_the_advance() {
        let harness = harness_with_auto_approval().await;
        let submitted_at = ts("2026-03-02T09:00:00Z");
        let instance = submitted(&harness, "task-1", None, submitted_at).await;
        let scheduler = AutoApprovalScheduler::new(Arc::clone(&harness.service), 50);
        let gala = WorkspaceId("ws-gala".to_string());

        harness.directory.set_unavailable(&gala, true);
        let blocked = scheduler.sweep(submitted_at + Duration::hours(49)).await.expect("sweep");
        assert_eq!(blocked.stats.skipped, 1);
        let stored = harness.service.find_instance(&instance.id).await.expect("instance");
        assert_eq!(stored.current_level, 1);

        harness.directory.set_unavailable(&gala, false);
        let recovered = scheduler.sweep(submitted_at + Duration::hours(50)).await.expect("sweep");
        assert_eq!(recovered.stats.advanced, 1);
    }

    #[tokio::test]
    async fn due_instances_are_reached_past_the_first_page() {
        let harness = harness_with_auto_approval().await;
        harness.save_policy(finance_policy()).await;
        let submitted_at = ts("2026-03-02T09:00:00Z");
        let mut waiting = Vec::new();
        for index in 0..3 {
            let id = format!("task-finance-{index}");
            waiting.push(submitted(&harness, &id, Some("finance"), submitted_at).await);
        }
        let due = submitted(&harness, "task-1", None, submitted_at + Duration::hours(1)).await;
        let scheduler = AutoApprovalScheduler::new(Arc::clone(&harness.service), 1);

        let sweep = scheduler.sweep(submitted_at + Duration::hours(50)).await.expect("sweep");

        assert_eq!(sweep.advanced, vec![due.id.clone()]);
        let stored = harness.service.find_instance(&due.id).await.expect("instance");
        assert_eq!(stored.current_stage, ApprovalStage::FinalApproval);
        for instance in waiting {
            let untouched = harness.service.find_instance(&instance.id).await.expect("instance");
            assert_eq!(untouched.current_level, 1);
        }

        let repeat = scheduler.sweep(submitted_at + Duration::hours(51)).await.expect("sweep");
        assert!(repeat.advanced.is_empty());
    }
}
