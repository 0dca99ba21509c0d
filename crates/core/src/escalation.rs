use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::escalation::{EscalationEvent, EscalationEventId, SlaStatus};
use crate::domain::work_item::{WorkItem, WorkItemId, WorkItemType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaAssessment {
    pub item_id: WorkItemId,
    pub item_type: WorkItemType,
    pub due_at: DateTime<Utc>,
    pub overdue_hours: Decimal,
    pub status: SlaStatus,
}

/// Hours past `due_at`, floored at zero and rounded to two decimals.
pub fn overdue_hours(due_at: DateTime<Utc>, now: DateTime<Utc>) -> Decimal {
    let minutes = (now - due_at).num_minutes().max(0);
    (Decimal::from(minutes) / Decimal::from(60)).round_dp(2)
}

pub fn classify(overdue_hours: Decimal, breach_threshold_hours: u32) -> SlaStatus {
    if overdue_hours <= Decimal::ZERO {
        SlaStatus::OnTrack
    } else if overdue_hours < Decimal::from(breach_threshold_hours) {
        SlaStatus::AtRisk
    } else {
        SlaStatus::Breached
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EscalationPlanner {
    breach_threshold_hours: u32,
}

impl EscalationPlanner {
    pub fn new(breach_threshold_hours: u32) -> Self {
        Self { breach_threshold_hours: breach_threshold_hours.max(1) }
    }

    pub fn breach_threshold_hours(&self) -> u32 {
        self.breach_threshold_hours
    }

    /// `None` for closed items and items without a deadline.
    pub fn assess(&self, item: &WorkItem, now: DateTime<Utc>) -> Option<SlaAssessment> {
        if !item.is_open() {
            return None;
        }
        let due_at = item.effective_due_at()?;
        let overdue_hours = overdue_hours(due_at, now);
        Some(SlaAssessment {
            item_id: item.id.clone(),
            item_type: item.item_type,
            due_at,
            overdue_hours,
            status: classify(overdue_hours, self.breach_threshold_hours),
        })
    }

    /// Builds the event for an item that is breached, not yet escalated in this episode and has
    /// somewhere to escalate to.
    pub fn plan(
        &self,
        item: &WorkItem,
        event_id: EscalationEventId,
        now: DateTime<Utc>,
    ) -> Option<EscalationEvent> {
        if item.escalated {
            return None;
        }
        let parent = item.parent_workspace_id.as_ref()?;
        let assessment = self.assess(item, now)?;
        if assessment.status != SlaStatus::Breached {
            return None;
        }

        Some(EscalationEvent {
            id: event_id,
            item_id: item.id.clone(),
            item_type: item.item_type,
            escalated_from: item.owner_workspace_id.clone(),
            escalated_to: parent.clone(),
            overdue_hours_at_escalation: assessment.overdue_hours,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use super::{classify, overdue_hours, EscalationPlanner};
    use crate::domain::escalation::{EscalationEventId, SlaStatus};
    use crate::domain::work_item::{
        Deadline, Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
    };
    use crate::domain::WorkspaceId;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn ticket(due_at: DateTime<Utc>, parent: Option<&str>) -> WorkItem {
        WorkItem {
            id: WorkItemId("ticket-9".to_string()),
            item_type: WorkItemType::Ticket,
            title: "Badge printer offline".to_string(),
            category: None,
            priority: Priority::Urgent,
            estimated_hours: None,
            assignee_id: Some("u-ops".to_string()),
            deadline: Some(Deadline::DueAt { at: due_at }),
            workspace_id: WorkspaceId("ws-expo".to_string()),
            owner_workspace_id: WorkspaceId("ws-expo".to_string()),
            parent_workspace_id: parent.map(|parent| WorkspaceId(parent.to_string())),
            status: WorkItemStatus::Open,
            escalated: false,
            escalated_at: None,
            created_at: due_at - Duration::days(2),
            updated_at: due_at - Duration::days(2),
        }
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(classify(Decimal::ZERO, 24), SlaStatus::OnTrack);
        assert_eq!(classify(Decimal::new(1, 2), 24), SlaStatus::AtRisk);
        assert_eq!(classify(Decimal::new(2399, 2), 24), SlaStatus::AtRisk);
        assert_eq!(classify(Decimal::from(24), 24), SlaStatus::Breached);
    }

    #[test]
    fn overdue_hours_never_go_negative() {
        let now = ts("2026-07-01T12:00:00Z");
        assert_eq!(overdue_hours(now + Duration::hours(3), now), Decimal::ZERO);
        assert_eq!(overdue_hours(now - Duration::minutes(90), now), Decimal::new(150, 2));
    }

    #[test]
    fn thirty_hours_overdue_is_breached_and_planned_for_parent() {
        let now = ts("2026-07-01T12:00:00Z");
        let item = ticket(now - Duration::hours(30), Some("ws-org"));
        let planner = EscalationPlanner::new(24);

        let assessment = planner.assess(&item, now).expect("item has a deadline");
        assert_eq!(assessment.status, SlaStatus::Breached);
        assert_eq!(assessment.overdue_hours, Decimal::from(30));

        let event = planner
            .plan(&item, EscalationEventId("esc-1".to_string()), now)
            .expect("breached item escalates");
        assert_eq!(event.escalated_from.0, "ws-expo");
        assert_eq!(event.escalated_to.0, "ws-org");
        assert_eq!(event.overdue_hours_at_escalation, Decimal::from(30));
    }

    #[test]
    fn escalated_orphaned_or_at_risk_items_are_not_planned() {
        let now = ts("2026-07-01T12:00:00Z");
        let planner = EscalationPlanner::new(24);
        let id = || EscalationEventId("esc-1".to_string());

        let mut escalated = ticket(now - Duration::hours(30), Some("ws-org"));
        escalated.escalated = true;
        assert_eq!(planner.plan(&escalated, id(), now), None);

        let orphan = ticket(now - Duration::hours(30), None);
        assert_eq!(planner.plan(&orphan, id(), now), None);

        let at_risk = ticket(now - Duration::hours(5), Some("ws-org"));
        assert_eq!(planner.assess(&at_risk, now).map(|a| a.status), Some(SlaStatus::AtRisk));
        assert_eq!(planner.plan(&at_risk, id(), now), None);
    }

    #[test]
    fn resolved_items_are_not_assessed() {
        let now = ts("2026-07-01T12:00:00Z");
        let mut item = ticket(now - Duration::hours(30), Some("ws-org"));
        item.resolve(now);

        assert_eq!(EscalationPlanner::new(24).assess(&item, now), None);
    }
}
