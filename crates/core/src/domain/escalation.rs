use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::work_item::{WorkItemId, WorkItemType};
use crate::domain::WorkspaceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationEventId(pub String);

impl fmt::Display for EscalationEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Breached,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTrack => "on_track",
            Self::AtRisk => "at_risk",
            Self::Breached => "breached",
        }
    }
}

/// Append-only record of one breach episode being pushed to the parent workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: EscalationEventId,
    pub item_id: WorkItemId,
    pub item_type: WorkItemType,
    pub escalated_from: WorkspaceId,
    pub escalated_to: WorkspaceId,
    pub overdue_hours_at_escalation: Decimal,
    pub created_at: DateTime<Utc>,
}
