//! Inbound service owning every mutation of approval instances and escalation state.
//!
//! Instance changes go through a reload, evaluate, compare-and-swap loop: the pure executor in
//! `stagehand-core` computes the next snapshot and the repository commits it only if nobody else
//! committed in between. A writer that loses the race re-evaluates against fresh state, which is
//! how the second of two concurrent approvers ends up with an `already_decided` receipt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stagehand_core::approvals::{
    ActionDecision, ApprovalChainExecutor, ApprovalError, ApproverActionRequest, StageTransition,
};
use stagehand_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use stagehand_core::config::WorkflowConfig;
use stagehand_core::domain::escalation::SlaStatus;
use stagehand_core::domain::instance::{
    ApprovalInstance, ApprovalStage, ApproverAction, InstanceId, SYSTEM_ACTOR,
};
use stagehand_core::domain::policy::{ApprovalPolicy, PolicyId};
use stagehand_core::domain::work_item::{WorkItem, WorkItemId};
use stagehand_core::domain::WorkspaceId;
use stagehand_core::errors::ApplicationError;
use stagehand_core::escalation::{EscalationPlanner, SlaAssessment};
use stagehand_core::hierarchy::HierarchyResolver;
use stagehand_core::notify::{Notification, NotificationIntent, NotificationTarget, Notifier};
use stagehand_core::policy::{validate_policy_set, MatchReason, PolicyMatcher, PolicySelection};
use stagehand_core::scheduler::AutoApproval;
use stagehand_db::repositories::{
    ApprovalInstanceRepository, EscalationEventRepository, InMemoryApprovalInstanceRepository,
    InMemoryEscalationEventRepository, InMemoryPolicyRepository, InMemoryWorkItemRepository,
    PolicyRepository, RepositoryError, SqlApprovalInstanceRepository,
    SqlEscalationEventRepository, SqlPolicyRepository, SqlWorkItemRepository, WorkItemRepository,
};
use stagehand_db::DbPool;

use crate::telemetry::{TracingAuditSink, TracingNotifier};

const MAX_COMMIT_ATTEMPTS: usize = 8;

#[derive(Clone, Copy)]
enum ActingAs {
    Approver,
    System,
}

/// The four stores the engine works against, behind their repository traits.
#[derive(Clone)]
pub struct Repositories {
    pub policies: Arc<dyn PolicyRepository>,
    pub instances: Arc<dyn ApprovalInstanceRepository>,
    pub work_items: Arc<dyn WorkItemRepository>,
    pub escalations: Arc<dyn EscalationEventRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            policies: Arc::new(InMemoryPolicyRepository::default()),
            instances: Arc::new(InMemoryApprovalInstanceRepository::default()),
            work_items: Arc::new(InMemoryWorkItemRepository::default()),
            escalations: Arc::new(InMemoryEscalationEventRepository::default()),
        }
    }

    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            policies: Arc::new(SqlPolicyRepository::new(pool.clone())),
            instances: Arc::new(SqlApprovalInstanceRepository::new(pool.clone())),
            work_items: Arc::new(SqlWorkItemRepository::new(pool.clone())),
            escalations: Arc::new(SqlEscalationEventRepository::new(pool)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// No enabled policy applies; the item passes without approval.
    NotRequired { work_item_id: WorkItemId },
    Submitted { instance: Box<ApprovalInstance>, reason: MatchReason, specificity: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Committed,
    AlreadyDecided,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionReceipt {
    pub status: ReceiptStatus,
    pub instance: ApprovalInstance,
    pub decision: Option<ActionDecision>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OverdueWorkItem {
    pub item: WorkItem,
    pub assessment: SlaAssessment,
}

enum Commit<T> {
    Applied { instance: ApprovalInstance, output: T },
    AlreadyDecided(ApprovalInstance),
}

pub struct ApprovalWorkflowService {
    pub(crate) repositories: Repositories,
    pub(crate) resolver: Arc<dyn HierarchyResolver>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) planner: EscalationPlanner,
    pub(crate) approval_sla_hours: u32,
    executor: ApprovalChainExecutor<Arc<dyn HierarchyResolver>>,
    matcher: PolicyMatcher,
}

impl ApprovalWorkflowService {
    pub fn new(
        repositories: Repositories,
        resolver: Arc<dyn HierarchyResolver>,
        workflow: &WorkflowConfig,
    ) -> Self {
        Self {
            repositories,
            executor: ApprovalChainExecutor::new(Arc::clone(&resolver))
                .with_default_revision_target(workflow.default_revision_target),
            resolver,
            notifier: Arc::new(TracingNotifier),
            audit: Arc::new(TracingAuditSink),
            planner: EscalationPlanner::new(workflow.breach_threshold_hours),
            approval_sla_hours: workflow.approval_sla_hours.max(1),
            matcher: PolicyMatcher::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// Registers or updates a work item the watchdog should keep an eye on.
    pub async fn track_work_item(&self, item: WorkItem) -> Result<(), ApplicationError> {
        self.repositories.work_items.save(item).await?;
        Ok(())
    }

    pub async fn submit_for_approval(
        &self,
        item: &WorkItem,
        submitter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, ApplicationError> {
        let correlation_id = new_correlation_id();
        let audit = AuditContext::new(None, Some(item.id.clone()), &correlation_id, submitter_id);

        if let Some(active) =
            self.repositories.instances.find_active_for_work_item(&item.id).await?
        {
            return Err(ApprovalError::ActiveInstanceExists {
                work_item_id: item.id.clone(),
                instance_id: active.id,
            }
            .into());
        }

        let policies = self.repositories.policies.list_for_workspace(&item.workspace_id).await?;
        let selected = match self.matcher.select_policy(item, &policies) {
            PolicySelection::NotRequired => {
                info!(
                    event_name = "approval.not_required",
                    correlation_id = %correlation_id,
                    work_item_id = %item.id,
                    workspace_id = %item.workspace_id,
                    "no approval policy applies; item passes without approval"
                );
                self.audit.emit(audit.event(
                    "policy.not_required",
                    AuditCategory::Policy,
                    AuditOutcome::Success,
                ));
                return Ok(SubmissionOutcome::NotRequired { work_item_id: item.id.clone() });
            }
            PolicySelection::Selected(selected) => selected,
        };

        let instance_id = InstanceId(Uuid::new_v4().to_string());
        let instance =
            match self.executor.start(instance_id, item, &selected.policy, submitter_id, now) {
                Ok(instance) => instance,
                Err(error) => {
                    self.audit_failure(&audit, "approval.submission_failed", &error);
                    return Err(error.into());
                }
            };

        match self.repositories.instances.insert(instance.clone()).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                let active =
                    self.repositories.instances.find_active_for_work_item(&item.id).await?;
                let instance_id = active.map(|active| active.id).unwrap_or(instance.id);
                return Err(ApprovalError::ActiveInstanceExists {
                    work_item_id: item.id.clone(),
                    instance_id,
                }
                .into());
            }
            Err(error) => return Err(error.into()),
        }

        info!(
            event_name = "approval.submitted",
            correlation_id = %correlation_id,
            instance_id = %instance.id,
            work_item_id = %item.id,
            policy_id = %selected.policy.id,
            specificity = selected.specificity,
            stage = instance.current_stage.as_str(),
            "work item submitted for approval"
        );
        self.audit.emit(
            audit
                .event("approval.submitted", AuditCategory::Ingress, AuditOutcome::Success)
                .with_metadata("instance_id", instance.id.0.clone())
                .with_metadata("policy_id", selected.policy.id.0.clone()),
        );
        self.publish_transition(
            &instance,
            &StageTransition {
                from: ApprovalStage::Submitted,
                to: instance.current_stage,
                level: instance.current_level,
                actor_id: submitter_id.to_string(),
                at: now,
            },
        );

        Ok(SubmissionOutcome::Submitted {
            instance: Box::new(instance),
            reason: selected.reason,
            specificity: selected.specificity,
        })
    }

    /// Applies an approver action. Losing a commit race is reported as `already_decided`, not as
    /// an error. The reserved system actor id is refused as an unauthorized approver.
    pub async fn record_approver_action(
        &self,
        request: ApproverActionRequest,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, ApplicationError> {
        self.apply_action(request, ActingAs::Approver, now).await
    }

    /// Commits a timed-out level as the system actor through the same reload and CAS path as a
    /// human decision.
    pub(crate) async fn auto_approve(
        &self,
        due: AutoApproval,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, ApplicationError> {
        let request = ApproverActionRequest {
            instance_id: due.instance_id,
            level: due.level,
            actor_id: SYSTEM_ACTOR.to_string(),
            action: ApproverAction::Approve,
            notes: Some(due.notes),
        };
        self.apply_action(request, ActingAs::System, now).await
    }

    async fn apply_action(
        &self,
        request: ApproverActionRequest,
        acting_as: ActingAs,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, ApplicationError> {
        let correlation_id = new_correlation_id();
        let audit = AuditContext::new(
            Some(request.instance_id.clone()),
            None,
            &correlation_id,
            &request.actor_id,
        );

        let committed = self
            .commit_with_retry(&request.instance_id, |instance, policy| {
                let outcome = match acting_as {
                    ActingAs::Approver => self.executor.act(instance, policy, &request, now),
                    ActingAs::System => self.executor.auto_approve(
                        instance,
                        policy,
                        request.level,
                        request.notes.clone(),
                        now,
                    ),
                };
                outcome.map(|outcome| (outcome.instance, (outcome.decision, outcome.transition)))
            })
            .await;

        match committed {
            Ok(Commit::Applied { instance, output: (decision, transition) }) => {
                info!(
                    event_name = "approval.action_committed",
                    correlation_id = %correlation_id,
                    instance_id = %instance.id,
                    actor_id = %request.actor_id,
                    action = request.action.as_str(),
                    decision = decision_label(&decision),
                    stage = instance.current_stage.as_str(),
                    level = instance.current_level,
                    "approver action committed"
                );
                self.audit.emit(
                    audit
                        .event(
                            "approval.action_committed",
                            AuditCategory::Approval,
                            AuditOutcome::Success,
                        )
                        .with_metadata("action", request.action.as_str())
                        .with_metadata("decision", decision_label(&decision))
                        .with_metadata("level", request.level.to_string()),
                );
                if let Some(transition) = &transition {
                    self.publish_transition(&instance, transition);
                }
                Ok(ActionReceipt {
                    status: ReceiptStatus::Committed,
                    instance,
                    decision: Some(decision),
                })
            }
            Ok(Commit::AlreadyDecided(instance)) => {
                info!(
                    event_name = "approval.already_decided",
                    correlation_id = %correlation_id,
                    instance_id = %instance.id,
                    actor_id = %request.actor_id,
                    level = request.level,
                    "level already decided; action treated as a no-op"
                );
                self.audit.emit(
                    audit
                        .event(
                            "approval.already_decided",
                            AuditCategory::Approval,
                            AuditOutcome::Success,
                        )
                        .with_metadata("level", request.level.to_string()),
                );
                Ok(ActionReceipt {
                    status: ReceiptStatus::AlreadyDecided,
                    instance,
                    decision: None,
                })
            }
            Err(error) => {
                warn!(
                    event_name = "approval.action_rejected",
                    correlation_id = %correlation_id,
                    instance_id = %request.instance_id,
                    actor_id = %request.actor_id,
                    action = request.action.as_str(),
                    error = %error,
                    "approver action refused"
                );
                self.audit_failure(&audit, "approval.action_rejected", &error);
                Err(error)
            }
        }
    }

    /// Sends a revised item back into review at the level recorded by the revision request.
    pub async fn resubmit(
        &self,
        instance_id: &InstanceId,
        submitter_id: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionReceipt, ApplicationError> {
        let correlation_id = new_correlation_id();
        let audit =
            AuditContext::new(Some(instance_id.clone()), None, &correlation_id, submitter_id);

        let committed = self
            .commit_with_retry(instance_id, |instance, policy| {
                self.executor
                    .resubmit(instance, policy, submitter_id, notes.clone(), now)
                    .map(|outcome| (outcome.instance, (outcome.decision, outcome.transition)))
            })
            .await;

        match committed {
            Ok(Commit::Applied { instance, output: (decision, transition) }) => {
                info!(
                    event_name = "approval.resubmitted",
                    correlation_id = %correlation_id,
                    instance_id = %instance.id,
                    stage = instance.current_stage.as_str(),
                    level = instance.current_level,
                    "instance resubmitted after revision"
                );
                self.audit.emit(audit.event(
                    "approval.resubmitted",
                    AuditCategory::Approval,
                    AuditOutcome::Success,
                ));
                if let Some(transition) = &transition {
                    self.publish_transition(&instance, transition);
                }
                Ok(ActionReceipt {
                    status: ReceiptStatus::Committed,
                    instance,
                    decision: Some(decision),
                })
            }
            Ok(Commit::AlreadyDecided(instance)) => {
                Ok(ActionReceipt {
                    status: ReceiptStatus::AlreadyDecided,
                    instance,
                    decision: None,
                })
            }
            Err(error) => {
                self.audit_failure(&audit, "approval.resubmit_rejected", &error);
                Err(error)
            }
        }
    }

    pub async fn withdraw(
        &self,
        instance_id: &InstanceId,
        submitter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalInstance, ApplicationError> {
        let correlation_id = new_correlation_id();
        let audit =
            AuditContext::new(Some(instance_id.clone()), None, &correlation_id, submitter_id);

        let committed = self
            .commit_with_retry(instance_id, |instance, _policy| {
                let from = instance.current_stage;
                self.executor.withdraw(instance, submitter_id, now).map(|next| (next, from))
            })
            .await;

        match committed {
            Ok(Commit::Applied { instance, output: from }) => {
                info!(
                    event_name = "approval.withdrawn",
                    correlation_id = %correlation_id,
                    instance_id = %instance.id,
                    "instance withdrawn by submitter"
                );
                self.audit.emit(audit.event(
                    "approval.withdrawn",
                    AuditCategory::Approval,
                    AuditOutcome::Success,
                ));
                self.publish_transition(
                    &instance,
                    &StageTransition {
                        from,
                        to: instance.current_stage,
                        level: instance.current_level,
                        actor_id: submitter_id.to_string(),
                        at: now,
                    },
                );
                Ok(instance)
            }
            Ok(Commit::AlreadyDecided(instance)) => Ok(instance),
            Err(error) => {
                self.audit_failure(&audit, "approval.withdraw_rejected", &error);
                Err(error)
            }
        }
    }

    /// Validates `policy` against the rest of its workspace and stores it. The creation time of
    /// an existing policy is kept so tie-breaking between policies stays stable.
    pub async fn create_or_update_policy(
        &self,
        mut policy: ApprovalPolicy,
        now: DateTime<Utc>,
    ) -> Result<ApprovalPolicy, ApplicationError> {
        let correlation_id = new_correlation_id();
        let mut existing =
            self.repositories.policies.list_for_workspace(&policy.workspace_id).await?;
        let stored = self.repositories.policies.find_by_id(&policy.id).await?;
        if let Some(stored) = &stored {
            if stored.workspace_id != policy.workspace_id {
                existing.push(stored.clone());
            }
        }

        if let Err(error) = validate_policy_set(&policy, &existing) {
            warn!(
                event_name = "policy.validation_failed",
                correlation_id = %correlation_id,
                policy_id = %policy.id,
                error = %error,
                "approval policy rejected"
            );
            return Err(error.into());
        }

        if let Some(stored) = stored {
            policy.created_at = stored.created_at;
        }
        policy.updated_at = now;
        self.repositories.policies.save(policy.clone()).await?;

        info!(
            event_name = "policy.saved",
            correlation_id = %correlation_id,
            policy_id = %policy.id,
            workspace_id = %policy.workspace_id,
            is_default = policy.is_default,
            is_enabled = policy.is_enabled,
            levels = policy.chain.len(),
            "approval policy saved"
        );
        self.audit.emit(
            AuditContext::new(None, None, &correlation_id, "admin")
                .event("policy.saved", AuditCategory::Policy, AuditOutcome::Success)
                .with_metadata("policy_id", policy.id.0.clone()),
        );
        Ok(policy)
    }

    pub async fn find_policy(
        &self,
        policy_id: &PolicyId,
    ) -> Result<ApprovalPolicy, ApplicationError> {
        self.repositories
            .policies
            .find_by_id(policy_id)
            .await?
            .ok_or_else(|| ApprovalError::PolicyNotFound { policy_id: policy_id.clone() }.into())
    }

    pub async fn find_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<ApprovalInstance, ApplicationError> {
        self.repositories
            .instances
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| {
                ApprovalError::InstanceNotFound { instance_id: instance_id.clone() }.into()
            })
    }

    /// Work items and in-review approvals visible to `workspace_id` that are at risk or
    /// breached, most overdue first.
    pub async fn list_overdue_work_items(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverdueWorkItem>, ApplicationError> {
        let mut candidates = self.repositories.work_items.list_for_workspace(workspace_id).await?;

        // Escalated approvals are visible to the parent, so every active instance is scanned.
        for instance in self.repositories.instances.list_active(None, u32::MAX).await? {
            if !instance.current_stage.is_review() {
                continue;
            }
            let parent = if instance.escalated {
                match self.resolver.parent_workspace(&instance.workspace_id) {
                    Ok(parent) => parent,
                    Err(error) => {
                        warn!(
                            event_name = "watchdog.hierarchy_unavailable",
                            instance_id = %instance.id,
                            error = %error,
                            "parent workspace lookup failed while listing overdue items"
                        );
                        None
                    }
                }
            } else {
                None
            };
            let item = instance.as_work_item(self.approval_sla_hours, parent);
            if item.is_visible_to(workspace_id) {
                candidates.push(item);
            }
        }

        let mut overdue: Vec<OverdueWorkItem> = candidates
            .into_iter()
            .filter_map(|item| {
                let assessment = self.planner.assess(&item, now)?;
                (assessment.status != SlaStatus::OnTrack)
                    .then_some(OverdueWorkItem { item, assessment })
            })
            .collect();
        overdue.sort_by(|left, right| {
            right
                .assessment
                .overdue_hours
                .cmp(&left.assessment.overdue_hours)
                .then_with(|| left.item.id.cmp(&right.item.id))
        });
        Ok(overdue)
    }

    /// Completing an item ends its breach episode.
    pub async fn resolve_work_item(
        &self,
        work_item_id: &WorkItemId,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, ApplicationError> {
        let mut item = self.load_work_item(work_item_id).await?;
        item.resolve(now);
        self.repositories.work_items.save(item.clone()).await?;
        info!(
            event_name = "watchdog.item_resolved",
            work_item_id = %item.id,
            "work item resolved; escalation flag cleared"
        );
        Ok(item)
    }

    /// Reassignment ends the breach episode and restarts a relative SLA window.
    pub async fn reassign_work_item(
        &self,
        work_item_id: &WorkItemId,
        assignee_id: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, ApplicationError> {
        let mut item = self.load_work_item(work_item_id).await?;
        item.reassign(assignee_id, now);
        self.repositories.work_items.save(item.clone()).await?;
        info!(
            event_name = "watchdog.item_reassigned",
            work_item_id = %item.id,
            assignee_id,
            "work item reassigned; escalation flag cleared"
        );
        Ok(item)
    }

    pub(crate) fn send(
        &self,
        target: NotificationTarget,
        intent: NotificationIntent,
        now: DateTime<Utc>,
    ) {
        let name = intent.name();
        if let Err(error) = self.notifier.notify(Notification { target, intent, created_at: now }) {
            warn!(
                event_name = "notify.delivery_failed",
                intent = name,
                error = %error,
                "notification delivery failed; not retried"
            );
        }
    }

    async fn commit_with_retry<T, F>(
        &self,
        instance_id: &InstanceId,
        mut evaluate: F,
    ) -> Result<Commit<T>, ApplicationError>
    where
        F: FnMut(
            &ApprovalInstance,
            &ApprovalPolicy,
        ) -> Result<(ApprovalInstance, T), ApprovalError>,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.find_instance(instance_id).await?;
            let policy = self.find_policy(&current.policy_id).await?;

            let (next, output) = match evaluate(&current, &policy) {
                Ok(evaluated) => evaluated,
                Err(error) if error.is_benign() => return Ok(Commit::AlreadyDecided(current)),
                Err(error) => return Err(error.into()),
            };

            if self.repositories.instances.compare_and_swap(current.version, next.clone()).await? {
                return Ok(Commit::Applied { instance: next, output });
            }
            debug!(
                event_name = "approval.commit_conflict",
                instance_id = %instance_id,
                attempt,
                "instance changed concurrently; re-evaluating against fresh state"
            );
        }

        Err(ApplicationError::Persistence(format!(
            "instance `{instance_id}` kept changing; gave up after {MAX_COMMIT_ATTEMPTS} attempts"
        )))
    }

    async fn load_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<WorkItem, ApplicationError> {
        self.repositories
            .work_items
            .find_by_id(work_item_id)
            .await?
            .ok_or_else(|| {
                ApprovalError::WorkItemNotFound { work_item_id: work_item_id.clone() }.into()
            })
    }

    fn publish_transition(&self, instance: &ApprovalInstance, transition: &StageTransition) {
        self.send(
            NotificationTarget::User(instance.submitter_id.clone()),
            NotificationIntent::StageChanged {
                instance_id: instance.id.clone(),
                work_item_id: instance.work_item_id.clone(),
                from: transition.from,
                to: transition.to,
                level: transition.level,
                actor_id: transition.actor_id.clone(),
            },
            transition.at,
        );
    }

    fn audit_failure(
        &self,
        audit: &AuditContext,
        event_type: &str,
        error: &impl std::fmt::Display,
    ) {
        self.audit.emit(
            audit
                .event(event_type, AuditCategory::Approval, AuditOutcome::Rejected)
                .with_metadata("error", error.to_string()),
        );
    }
}

fn decision_label(decision: &ActionDecision) -> &'static str {
    match decision {
        ActionDecision::VoteRecorded { .. } => "vote_recorded",
        ActionDecision::LevelCommitted { .. } => "level_committed",
        ActionDecision::Approved { .. } => "approved",
        ActionDecision::Rejected { .. } => "rejected",
        ActionDecision::RevisionRequested { .. } => "revision_requested",
        ActionDecision::Resubmitted { .. } => "resubmitted",
    }
}

pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
