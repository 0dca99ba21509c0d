use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::policy::PolicyId;
use crate::domain::work_item::{
    Deadline, Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
use crate::domain::WorkspaceId;

/// Actor id recorded for decisions the engine takes on its own (auto-approval).
pub const SYSTEM_ACTOR: &str = "SYSTEM";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStage {
    Submitted,
    ContentReview,
    DesignReview,
    FinalApproval,
    Approved,
    Rejected,
    RevisionRequested,
    Withdrawn,
}

impl ApprovalStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::ContentReview => "content_review",
            Self::DesignReview => "design_review",
            Self::FinalApproval => "final_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RevisionRequested => "revision_requested",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submitted" => Some(Self::Submitted),
            "content_review" => Some(Self::ContentReview),
            "design_review" => Some(Self::DesignReview),
            "final_approval" => Some(Self::FinalApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "revision_requested" => Some(Self::RevisionRequested),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Withdrawn)
    }

    /// Stages during which a chain level is open for approver actions.
    pub fn is_review(&self) -> bool {
        matches!(self, Self::ContentReview | Self::DesignReview | Self::FinalApproval)
    }

    /// The last level of a chain is always final approval, the first is content review and
    /// everything in between is design review.
    pub fn for_level(level: u32, chain_len: u32) -> Self {
        if level >= chain_len {
            Self::FinalApproval
        } else if level <= 1 {
            Self::ContentReview
        } else {
            Self::DesignReview
        }
    }

    /// Inverse of [`ApprovalStage::for_level`], used to place a revision loop-back.
    pub fn entry_level(&self, chain_len: u32) -> u32 {
        match self {
            Self::DesignReview => 2.min(chain_len.max(1)),
            Self::FinalApproval => chain_len.max(1),
            _ => 1,
        }
    }
}

impl fmt::Display for ApprovalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| format!("unknown approval stage `{value}`"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverAction {
    Approve,
    Reject,
    RequestRevision,
}

impl ApproverAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestRevision => "request_revision",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "request_revision" => Some(Self::RequestRevision),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Submit,
    /// Approve vote that did not yet satisfy an all-must-vote level.
    Vote,
    /// Approval that committed the level.
    Approve,
    Reject,
    RequestRevision,
    Resubmit,
    Withdraw,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub level: u32,
    pub actor_id: String,
    pub action: HistoryAction,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Decision state of the level the instance currently sits on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LevelState {
    /// Anyone-at-level: the first qualifying action commits.
    Awaiting,
    /// All-must-vote: the eligible set is frozen at level entry.
    Voting { eligible: BTreeSet<String>, votes: BTreeSet<String> },
    Committed { by: String, at: DateTime<Utc> },
    /// No level is open (revision requested, withdrawn).
    Suspended,
}

impl LevelState {
    pub fn outstanding_voters(&self) -> BTreeSet<String> {
        match self {
            Self::Voting { eligible, votes } => eligible.difference(votes).cloned().collect(),
            _ => BTreeSet::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: InstanceId,
    pub work_item_id: WorkItemId,
    pub workspace_id: WorkspaceId,
    pub policy_id: PolicyId,
    pub submitter_id: String,
    pub title: String,
    pub priority: Priority,
    pub current_level: u32,
    pub current_stage: ApprovalStage,
    pub level_state: LevelState,
    pub level_entered_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    /// Bumped on every committed change; the persistence layer compares-and-sets on it.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalInstance {
    pub fn is_active(&self) -> bool {
        !self.current_stage.is_terminal()
    }

    pub fn has_committed_level(&self) -> bool {
        self.history.iter().any(|entry| entry.action == HistoryAction::Approve)
    }

    /// Level of the decision that made the instance terminal, if any.
    pub fn deciding_level(&self) -> Option<u32> {
        if !matches!(self.current_stage, ApprovalStage::Approved | ApprovalStage::Rejected) {
            return None;
        }
        self.history
            .iter()
            .rev()
            .find(|entry| matches!(entry.action, HistoryAction::Approve | HistoryAction::Reject))
            .map(|entry| entry.level)
    }

    /// Projects an in-review instance onto the generic work item shape the watchdog scans.
    /// The SLA clock restarts at every level entry.
    pub fn as_work_item(
        &self,
        approval_sla_hours: u32,
        parent_workspace_id: Option<WorkspaceId>,
    ) -> WorkItem {
        let owner_workspace_id = if self.escalated {
            parent_workspace_id.clone().unwrap_or_else(|| self.workspace_id.clone())
        } else {
            self.workspace_id.clone()
        };
        let assignee_id = match &self.level_state {
            LevelState::Voting { .. } => self.level_state.outstanding_voters().into_iter().next(),
            _ => None,
        };

        WorkItem {
            id: WorkItemId(self.id.0.clone()),
            item_type: WorkItemType::Approval,
            title: self.title.clone(),
            category: None,
            priority: self.priority,
            estimated_hours: None,
            assignee_id,
            deadline: Some(Deadline::DueAt {
                at: self.level_entered_at + Duration::hours(i64::from(approval_sla_hours)),
            }),
            workspace_id: self.workspace_id.clone(),
            owner_workspace_id,
            parent_workspace_id,
            status: if self.is_active() { WorkItemStatus::Open } else { WorkItemStatus::Resolved },
            escalated: self.escalated,
            escalated_at: self.escalated_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
