//! Multi-level approval state machine.
//!
//! The executor is pure: it takes the current instance snapshot and returns the next one with
//! `version` bumped. Callers persist the result with a compare-and-set on the version they
//! loaded, so at most one action can commit a given level.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::instance::{
    ApprovalInstance, ApprovalStage, ApproverAction, HistoryAction, HistoryEntry, InstanceId,
    LevelState, SYSTEM_ACTOR,
};
use crate::domain::policy::{ApprovalPolicy, PolicyId};
use crate::domain::work_item::{WorkItem, WorkItemId};
use crate::hierarchy::HierarchyResolver;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval policy `{policy_id}` not found")]
    PolicyNotFound { policy_id: PolicyId },
    #[error("approval instance `{instance_id}` not found")]
    InstanceNotFound { instance_id: InstanceId },
    #[error("work item `{work_item_id}` not found")]
    WorkItemNotFound { work_item_id: WorkItemId },
    #[error("level {level} of instance `{instance_id}` was already decided")]
    AlreadyDecided { instance_id: InstanceId, level: u32 },
    #[error("submitter `{actor_id}` may not approve their own request `{instance_id}`")]
    SelfApprovalForbidden { instance_id: InstanceId, actor_id: String },
    #[error("`{actor_id}` is not an eligible approver at level {level}")]
    UnauthorizedApprover { actor_id: String, level: u32 },
    #[error("`{action}` is not allowed while instance is in stage `{stage}`")]
    InvalidTransition { stage: ApprovalStage, action: String },
    #[error("hierarchy resolution failed: {reason}")]
    HierarchyResolutionFailed { reason: String },
    #[error("level {level} resolves to no eligible approvers")]
    NoEligibleApprovers { level: u32 },
    #[error("instance `{instance_id}` has a committed level and can no longer be withdrawn")]
    WithdrawNotAllowed { instance_id: InstanceId },
    #[error("only the submitter may {operation} instance `{instance_id}`")]
    NotSubmitter { instance_id: InstanceId, operation: &'static str },
    #[error("work item `{work_item_id}` already has active approval `{instance_id}`")]
    ActiveInstanceExists { work_item_id: WorkItemId, instance_id: InstanceId },
}

impl ApprovalError {
    /// A benign outcome is a no-op confirmation rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyDecided { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverActionRequest {
    pub instance_id: InstanceId,
    /// Level the actor is deciding on. An action for a level that has already moved on is
    /// reported as already decided.
    pub level: u32,
    pub actor_id: String,
    pub action: ApproverAction,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: ApprovalStage,
    pub to: ApprovalStage,
    pub level: u32,
    pub actor_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ActionDecision {
    VoteRecorded { level: u32, outstanding: usize },
    LevelCommitted { level: u32, next_level: u32 },
    Approved { level: u32 },
    Rejected { level: u32 },
    RevisionRequested { level: u32, return_level: u32 },
    Resubmitted { level: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub instance: ApprovalInstance,
    pub decision: ActionDecision,
    pub transition: Option<StageTransition>,
}

/// Who is behind a decision. Only [`ApprovalChainExecutor::auto_approve`] acts as the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Authority {
    Approver,
    System,
}

pub struct ApprovalChainExecutor<R> {
    resolver: R,
    default_revision_target: ApprovalStage,
}

impl<R> ApprovalChainExecutor<R>
where
    R: HierarchyResolver,
{
    pub fn new(resolver: R) -> Self {
        Self { resolver, default_revision_target: ApprovalStage::ContentReview }
    }

    pub fn with_default_revision_target(mut self, stage: ApprovalStage) -> Self {
        if stage.is_review() {
            self.default_revision_target = stage;
        }
        self
    }

    /// Opens a new instance for `item` on level 1 of `policy`.
    pub fn start(
        &self,
        instance_id: InstanceId,
        item: &WorkItem,
        policy: &ApprovalPolicy,
        submitter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        let mut instance = ApprovalInstance {
            id: instance_id,
            work_item_id: item.id.clone(),
            workspace_id: item.workspace_id.clone(),
            policy_id: policy.id.clone(),
            submitter_id: submitter_id.to_string(),
            title: item.title.clone(),
            priority: item.priority,
            current_level: 1,
            current_stage: ApprovalStage::Submitted,
            level_state: LevelState::Suspended,
            level_entered_at: now,
            history: vec![HistoryEntry {
                level: 0,
                actor_id: submitter_id.to_string(),
                action: HistoryAction::Submit,
                notes: None,
                timestamp: now,
            }],
            escalated: false,
            escalated_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.enter_level(&mut instance, policy, 1, now)?;
        Ok(instance)
    }

    /// Applies a human approver's action. The reserved system actor id is never accepted here.
    pub fn act(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        request: &ApproverActionRequest,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, ApprovalError> {
        if request.actor_id == SYSTEM_ACTOR {
            return Err(ApprovalError::UnauthorizedApprover {
                actor_id: request.actor_id.clone(),
                level: request.level,
            });
        }
        self.check_open_level(instance, request)?;

        if !policy.allow_self_approval && request.actor_id == instance.submitter_id {
            return Err(ApprovalError::SelfApprovalForbidden {
                instance_id: instance.id.clone(),
                actor_id: request.actor_id.clone(),
            });
        }
        self.check_eligibility(instance, policy, request)?;

        self.decide(instance, policy, request, Authority::Approver, now)
    }

    /// Approves `level` on behalf of the system once the policy timeout has elapsed. Commits the
    /// level outright, voting levels included, and otherwise follows the rules of [`Self::act`].
    pub fn auto_approve(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        level: u32,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, ApprovalError> {
        let request = ApproverActionRequest {
            instance_id: instance.id.clone(),
            level,
            actor_id: SYSTEM_ACTOR.to_string(),
            action: ApproverAction::Approve,
            notes,
        };
        self.check_open_level(instance, &request)?;
        self.decide(instance, policy, &request, Authority::System, now)
    }

    fn decide(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        request: &ApproverActionRequest,
        authority: Authority,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, ApprovalError> {

        let mut next = instance.clone();
        let level = instance.current_level;
        let from = instance.current_stage;

        let decision = match request.action {
            ApproverAction::Reject => {
                next.current_stage = ApprovalStage::Rejected;
                next.level_state = committed(request, now);
                push_history(&mut next, request, HistoryAction::Reject, now);
                ActionDecision::Rejected { level }
            }
            ApproverAction::RequestRevision => {
                let target = policy.revision_target.unwrap_or(self.default_revision_target);
                let return_level = target.entry_level(policy.chain_len()).min(level);
                push_history(&mut next, request, HistoryAction::RequestRevision, now);
                next.current_stage = ApprovalStage::RevisionRequested;
                next.current_level = return_level;
                next.level_state = LevelState::Suspended;
                next.escalated = false;
                ActionDecision::RevisionRequested { level, return_level }
            }
            ApproverAction::Approve => {
                self.apply_approve(&mut next, policy, request, authority, now)?
            }
        };

        next.version = instance.version.saturating_add(1);
        next.updated_at = now;

        let transition = (next.current_stage != from).then(|| StageTransition {
            from,
            to: next.current_stage,
            level,
            actor_id: request.actor_id.clone(),
            at: now,
        });

        Ok(ActionOutcome { instance: next, decision, transition })
    }

    /// Re-enters the loop-back level after a revision was requested. The level clock restarts.
    pub fn resubmit(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        submitter_id: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, ApprovalError> {
        if instance.current_stage != ApprovalStage::RevisionRequested {
            return Err(ApprovalError::InvalidTransition {
                stage: instance.current_stage,
                action: "resubmit".to_string(),
            });
        }
        if instance.submitter_id != submitter_id {
            return Err(ApprovalError::NotSubmitter {
                instance_id: instance.id.clone(),
                operation: "resubmit",
            });
        }

        let mut next = instance.clone();
        let level = instance.current_level;
        next.history.push(HistoryEntry {
            level,
            actor_id: submitter_id.to_string(),
            action: HistoryAction::Resubmit,
            notes,
            timestamp: now,
        });
        self.enter_level(&mut next, policy, level, now)?;
        next.version = instance.version.saturating_add(1);
        next.updated_at = now;

        Ok(ActionOutcome {
            transition: Some(StageTransition {
                from: instance.current_stage,
                to: next.current_stage,
                level,
                actor_id: submitter_id.to_string(),
                at: now,
            }),
            decision: ActionDecision::Resubmitted { level },
            instance: next,
        })
    }

    /// Withdrawal is only possible before any level has been committed.
    pub fn withdraw(
        &self,
        instance: &ApprovalInstance,
        submitter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalInstance, ApprovalError> {
        if instance.current_stage.is_terminal() {
            return Err(ApprovalError::InvalidTransition {
                stage: instance.current_stage,
                action: "withdraw".to_string(),
            });
        }
        if instance.submitter_id != submitter_id {
            return Err(ApprovalError::NotSubmitter {
                instance_id: instance.id.clone(),
                operation: "withdraw",
            });
        }
        if instance.has_committed_level() {
            return Err(ApprovalError::WithdrawNotAllowed { instance_id: instance.id.clone() });
        }

        let mut next = instance.clone();
        next.current_stage = ApprovalStage::Withdrawn;
        next.level_state = LevelState::Suspended;
        next.escalated = false;
        next.history.push(HistoryEntry {
            level: instance.current_level,
            actor_id: submitter_id.to_string(),
            action: HistoryAction::Withdraw,
            notes: None,
            timestamp: now,
        });
        next.version = instance.version.saturating_add(1);
        next.updated_at = now;
        Ok(next)
    }

    fn check_open_level(
        &self,
        instance: &ApprovalInstance,
        request: &ApproverActionRequest,
    ) -> Result<(), ApprovalError> {
        let invalid = || ApprovalError::InvalidTransition {
            stage: instance.current_stage,
            action: request.action.as_str().to_string(),
        };
        let already_decided = || ApprovalError::AlreadyDecided {
            instance_id: instance.id.clone(),
            level: request.level,
        };

        if instance.current_stage.is_terminal() {
            return match instance.deciding_level() {
                Some(deciding) if request.level <= deciding => Err(already_decided()),
                _ => Err(invalid()),
            };
        }
        if !instance.current_stage.is_review() {
            return Err(invalid());
        }
        if request.level < instance.current_level {
            return Err(already_decided());
        }
        if request.level > instance.current_level {
            return Err(invalid());
        }
        if matches!(instance.level_state, LevelState::Committed { .. }) {
            return Err(already_decided());
        }
        Ok(())
    }

    fn check_eligibility(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        request: &ApproverActionRequest,
    ) -> Result<(), ApprovalError> {
        let level = instance.current_level;
        let unauthorized =
            || ApprovalError::UnauthorizedApprover { actor_id: request.actor_id.clone(), level };

        match &instance.level_state {
            LevelState::Voting { eligible, votes } => {
                if !eligible.contains(&request.actor_id) {
                    return Err(unauthorized());
                }
                if votes.contains(&request.actor_id) {
                    return Err(ApprovalError::AlreadyDecided {
                        instance_id: instance.id.clone(),
                        level,
                    });
                }
                Ok(())
            }
            _ => {
                let eligible = self.resolve_level(instance, policy, level)?;
                if eligible.contains(&request.actor_id) {
                    Ok(())
                } else {
                    Err(unauthorized())
                }
            }
        }
    }

    fn apply_approve(
        &self,
        next: &mut ApprovalInstance,
        policy: &ApprovalPolicy,
        request: &ApproverActionRequest,
        authority: Authority,
        now: DateTime<Utc>,
    ) -> Result<ActionDecision, ApprovalError> {
        let level = next.current_level;

        if policy.require_all_levels && authority == Authority::Approver {
            if let LevelState::Voting { votes, eligible } = &mut next.level_state {
                votes.insert(request.actor_id.clone());
                let outstanding = eligible.difference(votes).count();
                if outstanding > 0 {
                    push_history(next, request, HistoryAction::Vote, now);
                    return Ok(ActionDecision::VoteRecorded { level, outstanding });
                }
            }
        }

        push_history(next, request, HistoryAction::Approve, now);

        if !policy.require_all_levels || level >= policy.chain_len() {
            next.current_stage = ApprovalStage::Approved;
            next.level_state = committed(request, now);
            return Ok(ActionDecision::Approved { level });
        }

        let next_level = level + 1;
        self.enter_level(next, policy, next_level, now)?;
        Ok(ActionDecision::LevelCommitted { level, next_level })
    }

    /// Moves the instance onto `level`, freezing the voter set for all-must-vote levels.
    fn enter_level(
        &self,
        instance: &mut ApprovalInstance,
        policy: &ApprovalPolicy,
        level: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ApprovalError> {
        let Some(definition) = policy.level(level) else {
            return Err(ApprovalError::InvalidTransition {
                stage: instance.current_stage,
                action: format!("enter level {level}"),
            });
        };

        let eligible = self.resolve_level(instance, policy, level)?;
        instance.level_state = if definition.anyone_at_level {
            if eligible.is_empty() {
                return Err(ApprovalError::NoEligibleApprovers { level });
            }
            LevelState::Awaiting
        } else {
            let mut eligible = eligible;
            if !policy.allow_self_approval {
                eligible.remove(&instance.submitter_id);
            }
            if eligible.is_empty() {
                return Err(ApprovalError::NoEligibleApprovers { level });
            }
            LevelState::Voting { eligible, votes: BTreeSet::new() }
        };

        instance.current_level = level;
        instance.current_stage = ApprovalStage::for_level(level, policy.chain_len());
        instance.level_entered_at = now;
        instance.escalated = false;
        instance.escalated_at = None;
        Ok(())
    }

    fn resolve_level(
        &self,
        instance: &ApprovalInstance,
        policy: &ApprovalPolicy,
        level: u32,
    ) -> Result<BTreeSet<String>, ApprovalError> {
        let Some(definition) = policy.level(level) else {
            return Ok(BTreeSet::new());
        };
        self.resolver
            .resolve_approvers(&instance.workspace_id, &definition.approver)
            .map_err(|error| ApprovalError::HierarchyResolutionFailed { reason: error.to_string() })
    }
}

fn committed(request: &ApproverActionRequest, now: DateTime<Utc>) -> LevelState {
    LevelState::Committed { by: request.actor_id.clone(), at: now }
}

fn push_history(
    instance: &mut ApprovalInstance,
    request: &ApproverActionRequest,
    action: HistoryAction,
    now: DateTime<Utc>,
) {
    instance.history.push(HistoryEntry {
        level: instance.current_level,
        actor_id: request.actor_id.clone(),
        action,
        notes: request.notes.clone(),
        timestamp: now,
    });
}
