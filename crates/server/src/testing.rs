use std::sync::Arc;

use chrono::{DateTime, Utc};

use stagehand_core::audit::InMemoryAuditSink;
use stagehand_core::config::AppConfig;
use stagehand_core::domain::instance::ApprovalInstance;
use stagehand_core::domain::policy::{
    ApprovalLevel, ApprovalPolicy, ApproverRule, PolicyCriteria, PolicyId,
};
use stagehand_core::domain::work_item::{
    Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
use stagehand_core::domain::WorkspaceId;
use stagehand_core::hierarchy::InMemoryHierarchyDirectory;
use stagehand_core::notify::InMemoryNotifier;

use crate::workflow::{ApprovalWorkflowService, Repositories, SubmissionOutcome};

pub fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}

/// `ws-gala` reports to `ws-org`.
pub fn directory() -> InMemoryHierarchyDirectory {
    InMemoryHierarchyDirectory::with_levels(["member", "manager", "director"])
        .with_member("ws-gala", "u-sam", "member", ["finance_lead"])
        .with_member("ws-gala", "u-fin-1", "member", ["finance_lead"])
        .with_member("ws-gala", "u-fin-2", "member", ["finance_lead"])
        .with_member("ws-gala", "u-manager", "manager", Vec::<String>::new())
        .with_member("ws-gala", "u-dir", "director", ["director"])
        .with_parent("ws-gala", "ws-org")
}

pub fn role_level(level: u32, role: &str) -> ApprovalLevel {
    ApprovalLevel {
        level,
        approver: ApproverRule::Role { required_role: role.to_string() },
        anyone_at_level: true,
    }
}

fn policy(id: &str, is_default: bool, criteria: PolicyCriteria) -> ApprovalPolicy {
    let created = ts("2026-01-01T00:00:00Z");
    ApprovalPolicy {
        id: PolicyId(id.to_string()),
        workspace_id: WorkspaceId("ws-gala".to_string()),
        name: format!("policy {id}"),
        is_default,
        criteria,
        chain: vec![role_level(1, "finance_lead")],
        require_all_levels: true,
        allow_self_approval: false,
        auto_approve_after_hours: None,
        revision_target: None,
        is_enabled: true,
        created_at: created,
        updated_at: created,
    }
}

/// `P1`: category `finance`, single finance-lead level.
pub fn finance_policy() -> ApprovalPolicy {
    policy(
        "P1",
        false,
        PolicyCriteria {
            categories: Some(["finance".to_string()].into()),
            ..PolicyCriteria::default()
        },
    )
}

/// `P2`: workspace default, single finance-lead level.
pub fn default_policy() -> ApprovalPolicy {
    policy("P2", true, PolicyCriteria::default())
}

pub fn item(id: &str, category: Option<&str>) -> WorkItem {
    let created = ts("2026-03-01T09:00:00Z");
    WorkItem {
        id: WorkItemId(id.to_string()),
        item_type: WorkItemType::Task,
        title: format!("Task {id}"),
        category: category.map(str::to_string),
        priority: Priority::Medium,
        estimated_hours: None,
        assignee_id: Some("u-sam".to_string()),
        deadline: None,
        workspace_id: WorkspaceId("ws-gala".to_string()),
        owner_workspace_id: WorkspaceId("ws-gala".to_string()),
        parent_workspace_id: None,
        status: WorkItemStatus::Open,
        escalated: false,
        escalated_at: None,
        created_at: created,
        updated_at: created,
    }
}

pub struct Harness {
    pub service: Arc<ApprovalWorkflowService>,
    pub directory: InMemoryHierarchyDirectory,
    pub audit: InMemoryAuditSink,
    pub notifier: InMemoryNotifier,
}

impl Harness {
    pub fn new(directory: InMemoryHierarchyDirectory) -> Self {
        Self::with_notifier(directory, InMemoryNotifier::default())
    }

    pub fn with_notifier(
        directory: InMemoryHierarchyDirectory,
        notifier: InMemoryNotifier,
    ) -> Self {
        Self::build(directory, notifier, Repositories::in_memory())
    }

    pub fn with_repositories(
        directory: InMemoryHierarchyDirectory,
        repositories: Repositories,
    ) -> Self {
        Self::build(directory, InMemoryNotifier::default(), repositories)
    }

    fn build(
        directory: InMemoryHierarchyDirectory,
        notifier: InMemoryNotifier,
        repositories: Repositories,
    ) -> Self {
        let audit = InMemoryAuditSink::default();
        let service = ApprovalWorkflowService::new(
            repositories,
            Arc::new(directory.clone()),
            &AppConfig::default().workflow,
        )
        .with_notifier(Arc::new(notifier.clone()))
        .with_audit_sink(Arc::new(audit.clone()));

        Self { service: Arc::new(service), directory, audit, notifier }
    }

    pub async fn save_policy(&self, policy: ApprovalPolicy) {
        let created_at = policy.created_at;
        self.service.create_or_update_policy(policy, created_at).await.expect("policy saved");
    }
}

pub async fn submitted(
    harness: &Harness,
    id: &str,
    category: Option<&str>,
    now: DateTime<Utc>,
) -> ApprovalInstance {
    let outcome = harness
        .service
        .submit_for_approval(&item(id, category), "u-sam", now)
        .await
        .expect("submission succeeds");
    match outcome {
        SubmissionOutcome::Submitted { instance, .. } => *instance,
        other => panic!("expected an approval instance, got {other:?}"),
    }
}
