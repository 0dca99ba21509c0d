use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::normalize_key;
use crate::domain::policy::{ApprovalPolicy, PolicyCriteria, PolicyValidationError};
use crate::domain::work_item::WorkItem;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Criteria,
    WorkspaceDefault,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub policy: ApprovalPolicy,
    pub specificity: usize,
    pub reason: MatchReason,
}

/// Outcome of policy selection. `NotRequired` is a valid auto-pass, not a failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicySelection {
    Selected(PolicyMatch),
    NotRequired,
}

impl PolicySelection {
    pub fn policy(&self) -> Option<&ApprovalPolicy> {
        match self {
            Self::Selected(selected) => Some(&selected.policy),
            Self::NotRequired => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PolicyMatcher;

impl PolicyMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn select_policy(&self, item: &WorkItem, policies: &[ApprovalPolicy]) -> PolicySelection {
        let candidates: Vec<&ApprovalPolicy> = policies
            .iter()
            .filter(|policy| policy.is_enabled && policy.workspace_id == item.workspace_id)
            .collect();

        let best_specific = candidates
            .iter()
            .filter(|policy| !policy.is_default)
            .filter_map(|policy| {
                let score = specificity_score(&policy.criteria, item);
                (score > 0).then_some((*policy, score))
            })
            .min_by(|(left, left_score), (right, right_score)| {
                right_score.cmp(left_score).then_with(|| oldest_first(left, right))
            });

        if let Some((policy, specificity)) = best_specific {
            return PolicySelection::Selected(PolicyMatch {
                policy: policy.clone(),
                specificity,
                reason: MatchReason::Criteria,
            });
        }

        candidates
            .into_iter()
            .filter(|policy| policy.is_default)
            .min_by(|left, right| oldest_first(left, right))
            .map(|policy| {
                PolicySelection::Selected(PolicyMatch {
                    policy: policy.clone(),
                    specificity: 0,
                    reason: MatchReason::WorkspaceDefault,
                })
            })
            .unwrap_or(PolicySelection::NotRequired)
    }
}

/// Number of criteria dimensions that are both declared by the policy and satisfied by the item.
pub fn specificity_score(criteria: &PolicyCriteria, item: &WorkItem) -> usize {
    let category_match = criteria.categories.as_ref().is_some_and(|categories| {
        item.category.as_deref().is_some_and(|category| {
            let category = normalize_key(category);
            categories.iter().any(|candidate| normalize_key(candidate) == category)
        })
    });

    let priority_match =
        criteria.priorities.as_ref().is_some_and(|priorities| priorities.contains(&item.priority));

    let hours_match = criteria.min_estimated_hours.is_some_and(|minimum| {
        item.estimated_hours.is_some_and(|estimated| estimated >= minimum)
    });

    usize::from(category_match) + usize::from(priority_match) + usize::from(hours_match)
}

/// Checks `candidate` on its own and against the workspace's stored policies.
pub fn validate_policy_set(
    candidate: &ApprovalPolicy,
    existing: &[ApprovalPolicy],
) -> Result<(), PolicyValidationError> {
    candidate.validate()?;

    if let Some(previous) = existing.iter().find(|policy| policy.id == candidate.id) {
        if previous.workspace_id != candidate.workspace_id {
            return Err(PolicyValidationError::WorkspaceChanged {
                policy_id: candidate.id.clone(),
                from: previous.workspace_id.clone(),
                to: candidate.workspace_id.clone(),
            });
        }
    }

    if candidate.is_default && candidate.is_enabled {
        if let Some(conflict) = existing.iter().find(|policy| {
            policy.id != candidate.id
                && policy.workspace_id == candidate.workspace_id
                && policy.is_default
                && policy.is_enabled
        }) {
            return Err(PolicyValidationError::DuplicateDefault {
                workspace_id: candidate.workspace_id.clone(),
                existing_policy_id: conflict.id.clone(),
            });
        }
    }

    Ok(())
}

fn oldest_first(left: &ApprovalPolicy, right: &ApprovalPolicy) -> Ordering {
    left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use super::{
        specificity_score, validate_policy_set, MatchReason, PolicyMatcher, PolicySelection,
    };
    use crate::domain::policy::{
        ApprovalLevel, ApprovalPolicy, ApproverRule, PolicyCriteria, PolicyId,
        PolicyValidationError,
    };
    use crate::domain::work_item::{Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType};
    use crate::domain::WorkspaceId;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    fn policy(
        id: &str,
        is_default: bool,
        criteria: PolicyCriteria,
        age_days: i64,
    ) -> ApprovalPolicy {
        let created = base_time() - Duration::days(age_days);
        ApprovalPolicy {
            id: PolicyId(id.to_string()),
            workspace_id: WorkspaceId("ws-gala".to_string()),
            name: id.to_string(),
            is_default,
            criteria,
            chain: vec![ApprovalLevel {
                level: 1,
                approver: ApproverRule::Role { required_role: "finance_lead".to_string() },
                anyone_at_level: true,
            }],
            require_all_levels: true,
            allow_self_approval: false,
            auto_approve_after_hours: None,
            revision_target: None,
            is_enabled: true,
            created_at: created,
            updated_at: created,
        }
    }

    fn categories(values: &[&str]) -> Option<BTreeSet<String>> {
        Some(values.iter().map(|value| value.to_string()).collect())
    }

    fn item(category: &str, priority: Priority, hours: Option<i64>) -> WorkItem {
        WorkItem {
            id: WorkItemId("item-1".to_string()),
            item_type: WorkItemType::Task,
            title: "Catering contract".to_string(),
            category: Some(category.to_string()),
            priority,
            estimated_hours: hours.map(Decimal::from),
            assignee_id: None,
            deadline: None,
            workspace_id: WorkspaceId("ws-gala".to_string()),
            owner_workspace_id: WorkspaceId("ws-gala".to_string()),
            parent_workspace_id: None,
            status: WorkItemStatus::Open,
            escalated: false,
            escalated_at: None,
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    #[test]
    fn finance_item_selects_criteria_policy_and_general_item_falls_back_to_default() {
        let finance = policy(
            "P1",
            false,
            PolicyCriteria { categories: categories(&["FINANCE"]), ..PolicyCriteria::default() },
            1,
        );
        let mut default = policy("P2", true, PolicyCriteria::default(), 10);
        default.chain[0].approver =
            ApproverRule::Hierarchy { hierarchy_level: "MANAGER".to_string() };
        let policies = vec![finance, default];
        let matcher = PolicyMatcher::new();

        let selected = matcher.select_policy(&item("finance", Priority::Medium, None), &policies);
        assert_eq!(selected.policy().map(|policy| policy.id.0.as_str()), Some("P1"));

        let fallback = matcher.select_policy(&item("general", Priority::Medium, None), &policies);
        match fallback {
            PolicySelection::Selected(selected) => {
                assert_eq!(selected.policy.id.0, "P2");
                assert_eq!(selected.reason, MatchReason::WorkspaceDefault);
            }
            PolicySelection::NotRequired => panic!("default policy should apply"),
        }
    }

    #[test]
    fn higher_specificity_wins_over_older_policy() {
        let broad = policy(
            "broad",
            false,
            PolicyCriteria { categories: categories(&["finance"]), ..PolicyCriteria::default() },
            30,
        );
        let narrow = policy(
            "narrow",
            false,
            PolicyCriteria {
                categories: categories(&["finance"]),
                priorities: Some([Priority::Urgent].into_iter().collect()),
                min_estimated_hours: Some(Decimal::from(10)),
            },
            1,
        );

        let selection = PolicyMatcher::new()
            .select_policy(&item("finance", Priority::Urgent, Some(12)), &[broad, narrow]);

        match selection {
            PolicySelection::Selected(selected) => {
                assert_eq!(selected.policy.id.0, "narrow");
                assert_eq!(selected.specificity, 3);
            }
            PolicySelection::NotRequired => panic!("narrow policy should match"),
        }
    }

    #[test]
    fn ties_go_to_the_oldest_policy_and_selection_is_stable() {
        let criteria =
            PolicyCriteria { categories: categories(&["finance"]), ..PolicyCriteria::default() };
        let newer = policy("newer", false, criteria.clone(), 1);
        let older = policy("older", false, criteria, 5);
        let policies = vec![newer, older];
        let finance_item = item("finance", Priority::Low, None);

        let first = PolicyMatcher::new().select_policy(&finance_item, &policies);
        for _ in 0..5 {
            assert_eq!(PolicyMatcher::new().select_policy(&finance_item, &policies), first);
        }
        assert_eq!(first.policy().map(|policy| policy.id.0.as_str()), Some("older"));
    }

    #[test]
    fn partially_satisfied_policy_scores_its_satisfied_dimensions() {
        let criteria = PolicyCriteria {
            categories: categories(&["finance"]),
            priorities: Some([Priority::Urgent].into_iter().collect()),
            min_estimated_hours: None,
        };

        assert_eq!(specificity_score(&criteria, &item("finance", Priority::Low, None)), 1);
        assert_eq!(specificity_score(&criteria, &item("general", Priority::Low, None)), 0);
    }

    #[test]
    fn disabled_and_foreign_policies_are_ignored() {
        let criteria =
            PolicyCriteria { categories: categories(&["finance"]), ..PolicyCriteria::default() };
        let mut disabled = policy("disabled", false, criteria.clone(), 3);
        disabled.is_enabled = false;
        let mut foreign = policy("foreign", false, criteria, 3);
        foreign.workspace_id = WorkspaceId("ws-other".to_string());
        let mut disabled_default = policy("disabled-default", true, PolicyCriteria::default(), 3);
        disabled_default.is_enabled = false;

        let selection = PolicyMatcher::new().select_policy(
            &item("finance", Priority::High, None),
            &[disabled, foreign, disabled_default],
        );

        assert_eq!(selection, PolicySelection::NotRequired);
    }

    #[test]
    fn criteria_less_non_default_policy_never_matches() {
        let selection = PolicyMatcher::new().select_policy(
            &item("finance", Priority::High, Some(40)),
            &[policy("empty", false, PolicyCriteria::default(), 1)],
        );

        assert_eq!(selection, PolicySelection::NotRequired);
    }

    #[test]
    fn second_enabled_default_is_rejected() {
        let existing = vec![policy("default-a", true, PolicyCriteria::default(), 5)];
        let candidate = policy("default-b", true, PolicyCriteria::default(), 0);

        let error =
            validate_policy_set(&candidate, &existing).expect_err("duplicate default should fail");
        assert_eq!(
            error,
            PolicyValidationError::DuplicateDefault {
                workspace_id: WorkspaceId("ws-gala".to_string()),
                existing_policy_id: PolicyId("default-a".to_string()),
            }
        );

        let mut disabled_candidate = candidate;
        disabled_candidate.is_enabled = false;
        assert_eq!(validate_policy_set(&disabled_candidate, &existing), Ok(()));
    }
}
