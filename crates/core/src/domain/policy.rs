use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::instance::ApprovalStage;
use crate::domain::work_item::Priority;
use crate::domain::WorkspaceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of matching dimensions. An absent dimension does not take part in scoring.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCriteria {
    #[serde(default)]
    pub categories: Option<BTreeSet<String>>,
    #[serde(default)]
    pub priorities: Option<BTreeSet<Priority>>,
    #[serde(default)]
    pub min_estimated_hours: Option<Decimal>,
}

impl PolicyCriteria {
    pub fn is_empty(&self) -> bool {
        self.categories.is_none() && self.priorities.is_none() && self.min_estimated_hours.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "approver_type", rename_all = "snake_case")]
pub enum ApproverRule {
    Role { required_role: String },
    Hierarchy { hierarchy_level: String },
}

impl ApproverRule {
    pub fn target(&self) -> &str {
        match self {
            Self::Role { required_role } => required_role,
            Self::Hierarchy { hierarchy_level } => hierarchy_level,
        }
    }
}

impl fmt::Display for ApproverRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role { required_role } => write!(f, "role `{required_role}`"),
            Self::Hierarchy { hierarchy_level } => write!(f, "hierarchy level `{hierarchy_level}`"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level: u32,
    pub approver: ApproverRule,
    /// When false every approver eligible at level entry must vote.
    #[serde(default = "default_anyone_at_level")]
    pub anyone_at_level: bool,
}

fn default_anyone_at_level() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: PolicyId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub criteria: PolicyCriteria,
    pub chain: Vec<ApprovalLevel>,
    #[serde(default = "default_true")]
    pub require_all_levels: bool,
    #[serde(default)]
    pub allow_self_approval: bool,
    #[serde(default)]
    pub auto_approve_after_hours: Option<u32>,
    /// Stage a `request_revision` loops back to. Falls back to the configured default.
    #[serde(default)]
    pub revision_target: Option<ApprovalStage>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ApprovalPolicy {
    pub fn chain_len(&self) -> u32 {
        u32::try_from(self.chain.len()).unwrap_or(u32::MAX)
    }

    pub fn level(&self, level: u32) -> Option<&ApprovalLevel> {
        self.chain.iter().find(|candidate| candidate.level == level)
    }

    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.name.trim().is_empty() {
            return Err(PolicyValidationError::MissingName { policy_id: self.id.clone() });
        }

        if self.chain.is_empty() {
            return Err(PolicyValidationError::EmptyChain { policy_id: self.id.clone() });
        }

        for (index, level) in self.chain.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if level.level != expected {
                return Err(PolicyValidationError::NonContiguousLevels {
                    policy_id: self.id.clone(),
                    expected,
                    found: level.level,
                });
            }

            if level.approver.target().trim().is_empty() {
                return Err(PolicyValidationError::MissingApproverTarget {
                    policy_id: self.id.clone(),
                    level: level.level,
                });
            }
        }

        if self.auto_approve_after_hours == Some(0) {
            return Err(PolicyValidationError::ZeroAutoApproveHours { policy_id: self.id.clone() });
        }

        if let Some(target) = self.revision_target {
            if !target.is_review() {
                return Err(PolicyValidationError::InvalidRevisionTarget {
                    policy_id: self.id.clone(),
                    stage: target,
                });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyValidationError {
    #[error("policy `{policy_id}` has no name")]
    MissingName { policy_id: PolicyId },
    #[error("policy `{policy_id}` must declare at least one approval level")]
    EmptyChain { policy_id: PolicyId },
    #[error("policy `{policy_id}` levels must be numbered 1..N: expected {expected}, found {found}")]
    NonContiguousLevels { policy_id: PolicyId, expected: u32, found: u32 },
    #[error("policy `{policy_id}` level {level} names no role or hierarchy level")]
    MissingApproverTarget { policy_id: PolicyId, level: u32 },
    #[error("policy `{policy_id}` auto_approve_after_hours must be greater than zero")]
    ZeroAutoApproveHours { policy_id: PolicyId },
    #[error("policy `{policy_id}` revision target `{stage}` is not a review stage")]
    InvalidRevisionTarget { policy_id: PolicyId, stage: ApprovalStage },
    #[error(
        "workspace `{workspace_id}` already has enabled default policy `{existing_policy_id}`"
    )]
    DuplicateDefault { workspace_id: WorkspaceId, existing_policy_id: PolicyId },
    #[error("policy `{policy_id}` cannot move from workspace `{from}` to `{to}`")]
    WorkspaceChanged { policy_id: PolicyId, from: WorkspaceId, to: WorkspaceId },
}
