use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::escalation::{EscalationEvent, EscalationEventId};
use crate::domain::instance::{ApprovalStage, InstanceId};
use crate::domain::work_item::{WorkItemId, WorkItemType};
use crate::domain::WorkspaceId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NotificationTarget {
    User(String),
    Workspace(WorkspaceId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum NotificationIntent {
    StageChanged {
        instance_id: InstanceId,
        work_item_id: WorkItemId,
        from: ApprovalStage,
        to: ApprovalStage,
        level: u32,
        actor_id: String,
    },
    ItemEscalated {
        event_id: EscalationEventId,
        item_id: WorkItemId,
        item_type: WorkItemType,
        from_workspace: WorkspaceId,
        overdue_hours: Decimal,
    },
}

impl NotificationIntent {
    pub fn from_escalation(event: &EscalationEvent) -> Self {
        Self::ItemEscalated {
            event_id: event.id.clone(),
            item_id: event.item_id.clone(),
            item_type: event.item_type,
            from_workspace: event.escalated_from.clone(),
            overdue_hours: event.overdue_hours_at_escalation,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StageChanged { .. } => "approval.stage_changed",
            Self::ItemEscalated { .. } => "watchdog.item_escalated",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub target: NotificationTarget,
    pub intent: NotificationIntent,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivery is fire-and-forget: callers log a returned error and move on.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl InMemoryNotifier {
    /// A notifier whose every delivery fails, for exercising the logging path.
    pub fn failing() -> Self {
        Self { sent: Arc::default(), failing: true }
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.failing {
            return Err(NotifyError("delivery channel offline".to_string()));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}
