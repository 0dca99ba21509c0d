use chrono::{DateTime, Duration, Utc};

use crate::domain::instance::{ApprovalInstance, InstanceId};
use crate::domain::policy::ApprovalPolicy;

/// A level whose auto-approval window has elapsed. Applied through
/// [`ApprovalChainExecutor::auto_approve`](crate::approvals::ApprovalChainExecutor::auto_approve).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoApproval {
    pub instance_id: InstanceId,
    pub level: u32,
    pub notes: String,
}

/// Instant at which the instance's current level becomes eligible for auto-approval.
pub fn auto_approve_due_at(
    instance: &ApprovalInstance,
    policy: &ApprovalPolicy,
) -> Option<DateTime<Utc>> {
    let hours = policy.auto_approve_after_hours?;
    Some(instance.level_entered_at + Duration::hours(i64::from(hours)))
}

/// The system approval due for an instance whose level timed out, or `None` when the instance is
/// not waiting on an open level or its deadline has not been reached.
pub fn plan_auto_approval(
    instance: &ApprovalInstance,
    policy: &ApprovalPolicy,
    now: DateTime<Utc>,
) -> Option<AutoApproval> {
    if !instance.is_active() || !instance.current_stage.is_review() {
        return None;
    }
    let due_at = auto_approve_due_at(instance, policy)?;
    if now < due_at {
        return None;
    }

    let hours = policy.auto_approve_after_hours.unwrap_or_default();
    Some(AutoApproval {
        instance_id: instance.id.clone(),
        level: instance.current_level,
        notes: format!("auto-approved after {hours}h without a decision"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::plan_auto_approval;
    use crate::domain::instance::{ApprovalInstance, ApprovalStage, InstanceId, LevelState};
    use crate::domain::policy::{
        ApprovalLevel, ApprovalPolicy, ApproverRule, PolicyCriteria, PolicyId,
    };
    use crate::domain::work_item::{Priority, WorkItemId};
    use crate::domain::WorkspaceId;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn policy(auto_approve_after_hours: Option<u32>) -> ApprovalPolicy {
        let created = ts("2026-01-01T00:00:00Z");
        ApprovalPolicy {
            id: PolicyId("pol-1".to_string()),
            workspace_id: WorkspaceId("ws-gala".to_string()),
            name: "Vendor sign-off".to_string(),
            is_default: true,
            criteria: PolicyCriteria::default(),
            chain: vec![ApprovalLevel {
                level: 1,
                approver: ApproverRule::Hierarchy { hierarchy_level: "manager".to_string() },
                anyone_at_level: true,
            }],
            require_all_levels: true,
            allow_self_approval: false,
            auto_approve_after_hours,
            revision_target: None,
            is_enabled: true,
            created_at: created,
            updated_at: created,
        }
    }

    fn instance(entered: DateTime<Utc>, stage: ApprovalStage) -> ApprovalInstance {
        ApprovalInstance {
            id: InstanceId("inst-1".to_string()),
            work_item_id: WorkItemId("task-1".to_string()),
            workspace_id: WorkspaceId("ws-gala".to_string()),
            policy_id: PolicyId("pol-1".to_string()),
            submitter_id: "u-sam".to_string(),
            title: "Stage rental".to_string(),
            priority: Priority::Medium,
            current_level: 1,
            current_stage: stage,
            level_state: LevelState::Awaiting,
            level_entered_at: entered,
            history: Vec::new(),
            escalated: false,
            escalated_at: None,
            version: 3,
            created_at: entered,
            updated_at: entered,
        }
    }

    #[test]
    fn plans_system_approval_once_the_level_has_waited_long_enough() {
        let entered = ts("2026-06-01T08:00:00Z");
        let instance = instance(entered, ApprovalStage::FinalApproval);
        let policy = policy(Some(48));

        assert_eq!(plan_auto_approval(&instance, &policy, entered + Duration::hours(47)), None);

        let due = plan_auto_approval(&instance, &policy, entered + Duration::hours(49))
            .expect("auto approval due");
        assert_eq!(due.instance_id, instance.id);
        assert_eq!(due.level, 1);
        assert!(due.notes.contains("48h"));
    }

    #[test]
    fn skips_policies_without_auto_approval_and_suspended_instances() {
        let entered = ts("2026-06-01T08:00:00Z");
        let late = entered + Duration::days(30);

        assert_eq!(
            plan_auto_approval(
                &instance(entered, ApprovalStage::FinalApproval),
                &policy(None),
                late
            ),
            None
        );
        assert_eq!(
            plan_auto_approval(
                &instance(entered, ApprovalStage::RevisionRequested),
                &policy(Some(1)),
                late
            ),
            None
        );
        assert_eq!(
            plan_auto_approval(&instance(entered, ApprovalStage::Approved), &policy(Some(1)), late),
            None
        );
    }
}
