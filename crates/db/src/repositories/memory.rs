use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use stagehand_core::domain::escalation::EscalationEvent;
use stagehand_core::domain::instance::{ApprovalInstance, InstanceId};
use stagehand_core::domain::policy::{ApprovalPolicy, PolicyId};
use stagehand_core::domain::work_item::{WorkItem, WorkItemId};
use stagehand_core::domain::WorkspaceId;

use super::{
    ApprovalInstanceRepository, EscalationEventRepository, PolicyRepository, RepositoryError,
    WorkItemRepository,
};

#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, ApprovalPolicy>>,
}

#[async_trait::async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, RepositoryError> {
        let policies = self.policies.read().await;
        Ok(policies.get(&id.0).cloned())
    }

    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ApprovalPolicy>, RepositoryError> {
        let policies = self.policies.read().await;
        let mut matching: Vec<ApprovalPolicy> = policies
            .values()
            .filter(|policy| &policy.workspace_id == workspace_id)
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(matching)
    }

    async fn save(&self, policy: ApprovalPolicy) -> Result<(), RepositoryError> {
        let mut policies = self.policies.write().await;
        policies.insert(policy.id.0.clone(), policy);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalInstanceRepository {
    instances: RwLock<HashMap<String, ApprovalInstance>>,
}

#[async_trait::async_trait]
impl ApprovalInstanceRepository for InMemoryApprovalInstanceRepository {
    async fn find_by_id(
        &self,
        id: &InstanceId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn find_active_for_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|instance| &instance.work_item_id == work_item_id && instance.is_active())
            .cloned())
    }

    async fn list_active(
        &self,
        after: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        let mut active: Vec<ApprovalInstance> = instances
            .values()
            .filter(|instance| instance.is_active())
            .filter(|instance| after.map_or(true, |after| &instance.id > after))
            .cloned()
            .collect();
        active.sort_by(|left, right| left.id.cmp(&right.id));
        active.truncate(limit as usize);
        Ok(active)
    }

    async fn insert(&self, instance: ApprovalInstance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id.0) {
            return Err(RepositoryError::Conflict(format!(
                "approval instance `{}` already exists",
                instance.id
            )));
        }
        if instance.is_active() {
            if let Some(existing) = instances.values().find(|existing| {
                existing.work_item_id == instance.work_item_id && existing.is_active()
            }) {
                return Err(RepositoryError::Conflict(format!(
                    "work item `{}` already has active approval `{}`",
                    instance.work_item_id, existing.id
                )));
            }
        }
        instances.insert(instance.id.0.clone(), instance);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        instance: ApprovalInstance,
    ) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write().await;
        match instances.get(&instance.id.0) {
            Some(current) if current.version == expected_version => {
                instances.insert(instance.id.0.clone(), instance);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryWorkItemRepository {
    items: RwLock<HashMap<String, WorkItem>>,
}

#[async_trait::async_trait]
impl WorkItemRepository for InMemoryWorkItemRepository {
    async fn find_by_id(&self, id: &WorkItemId) -> Result<Option<WorkItem>, RepositoryError> {
        let items = self.items.read().await;
        Ok(items.get(&id.0).cloned())
    }

    async fn save(&self, item: WorkItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        items.insert(item.id.0.clone(), item);
        Ok(())
    }

    async fn list_escalation_candidates(
        &self,
        due_before: DateTime<Utc>,
        after: Option<&WorkItemId>,
        limit: u32,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut due: Vec<WorkItem> = items
            .values()
            .filter(|item| item.is_open() && !item.escalated)
            .filter(|item| item.effective_due_at().is_some_and(|due_at| due_at <= due_before))
            .filter(|item| after.map_or(true, |after| &item.id > after))
            .cloned()
            .collect();
        due.sort_by(|left, right| left.id.cmp(&right.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut visible: Vec<WorkItem> =
            items.values().filter(|item| item.is_visible_to(workspace_id)).cloned().collect();
        visible.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(visible)
    }

    async fn mark_escalated(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(item) if item.is_open() && !item.escalated => {
                item.escalate_to(owner.clone(), at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_escalation(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(item) if item.escalated && item.escalated_at == Some(at) => {
                item.escalated = false;
                item.escalated_at = None;
                item.owner_workspace_id = owner.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryEscalationEventRepository {
    events: RwLock<Vec<EscalationEvent>>,
}

#[async_trait::async_trait]
impl EscalationEventRepository for InMemoryEscalationEventRepository {
    async fn append(&self, event: EscalationEvent) -> Result<(), RepositoryError> {
        let mut events = self.events.write().await;
        if events.iter().any(|existing| existing.id == event.id) {
            return Err(RepositoryError::Conflict(format!(
                "escalation event `{}` already recorded",
                event.id
            )));
        }
        events.push(event);
        Ok(())
    }

    async fn list_for_item(
        &self,
        item_id: &WorkItemId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|event| &event.item_id == item_id).cloned().collect())
    }

    async fn list_all(&self) -> Result<Vec<EscalationEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.clone())
    }
}
