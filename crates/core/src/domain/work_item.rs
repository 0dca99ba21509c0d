use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::WorkspaceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    Task,
    Approval,
    Ticket,
    Issue,
}

impl WorkItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Approval => "approval",
            Self::Ticket => "ticket",
            Self::Issue => "issue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "approval" => Some(Self::Approval),
            "ticket" => Some(Self::Ticket),
            "issue" => Some(Self::Issue),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Open,
    Resolved,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// When a work item is due: either a fixed instant or an SLA window measured from a start time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Deadline {
    DueAt { at: DateTime<Utc> },
    SlaHours { hours: u32, started_at: DateTime<Utc> },
}

impl Deadline {
    pub fn effective_due_at(&self) -> DateTime<Utc> {
        match self {
            Self::DueAt { at } => *at,
            Self::SlaHours { hours, started_at } => {
                *started_at + Duration::hours(i64::from(*hours))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub item_type: WorkItemType,
    pub title: String,
    pub category: Option<String>,
    pub priority: Priority,
    pub estimated_hours: Option<Decimal>,
    pub assignee_id: Option<String>,
    pub deadline: Option<Deadline>,
    /// Workspace the item was created in. Never changes.
    pub workspace_id: WorkspaceId,
    /// Workspace that currently sees and owns the item; moves upward on escalation.
    pub owner_workspace_id: WorkspaceId,
    pub parent_workspace_id: Option<WorkspaceId>,
    pub status: WorkItemStatus,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn is_open(&self) -> bool {
        self.status == WorkItemStatus::Open
    }

    pub fn effective_due_at(&self) -> Option<DateTime<Utc>> {
        self.deadline.as_ref().map(Deadline::effective_due_at)
    }

    pub fn is_visible_to(&self, workspace_id: &WorkspaceId) -> bool {
        &self.workspace_id == workspace_id || &self.owner_workspace_id == workspace_id
    }

    /// Hands the item to `parent` while keeping the originating workspace association.
    pub fn escalate_to(&mut self, parent: WorkspaceId, now: DateTime<Utc>) {
        self.escalated = true;
        self.escalated_at = Some(now);
        self.owner_workspace_id = parent;
        self.updated_at = now;
    }

    /// Completion ends the current breach episode.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = WorkItemStatus::Resolved;
        self.escalated = false;
        self.updated_at = now;
    }

    /// Reassignment ends the current breach episode and restarts a relative SLA window.
    pub fn reassign(&mut self, assignee_id: impl Into<String>, now: DateTime<Utc>) {
        self.assignee_id = Some(assignee_id.into());
        self.escalated = false;
        if let Some(Deadline::SlaHours { started_at, .. }) = &mut self.deadline {
            *started_at = now;
        }
        self.updated_at = now;
    }
}
