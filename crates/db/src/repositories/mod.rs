use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use stagehand_core::domain::escalation::EscalationEvent;
use stagehand_core::domain::instance::{ApprovalInstance, InstanceId};
use stagehand_core::domain::policy::{ApprovalPolicy, PolicyId};
use stagehand_core::domain::work_item::{WorkItem, WorkItemId};
use stagehand_core::domain::WorkspaceId;
use stagehand_core::errors::ApplicationError;

pub mod escalation;
pub mod instance;
pub mod memory;
pub mod policy;
pub mod work_item;

pub use escalation::SqlEscalationEventRepository;
pub use instance::SqlApprovalInstanceRepository;
pub use memory::{
    InMemoryApprovalInstanceRepository, InMemoryEscalationEventRepository,
    InMemoryPolicyRepository, InMemoryWorkItemRepository,
};
pub use policy::SqlPolicyRepository;
pub use work_item::SqlWorkItemRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        Self::Persistence(value.to_string())
    }
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, RepositoryError>;

    /// All policies of the workspace, enabled or not, oldest first.
    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ApprovalPolicy>, RepositoryError>;

    async fn save(&self, policy: ApprovalPolicy) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ApprovalInstanceRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &InstanceId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError>;

    async fn find_active_for_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError>;

    /// Active instances ordered by id, starting after `after`. Callers page through the whole set
    /// by passing the last id of the previous page.
    async fn list_active(
        &self,
        after: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError>;

    /// Fails with [`RepositoryError::Conflict`] when the work item already has an active instance.
    async fn insert(&self, instance: ApprovalInstance) -> Result<(), RepositoryError>;

    /// Replaces the stored instance only if its version still equals `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        instance: ApprovalInstance,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    async fn find_by_id(&self, id: &WorkItemId) -> Result<Option<WorkItem>, RepositoryError>;

    async fn save(&self, item: WorkItem) -> Result<(), RepositoryError>;

    /// Open, unflagged items whose deadline fell on or before `due_before`, ordered by id and
    /// starting after `after`.
    async fn list_escalation_candidates(
        &self,
        due_before: DateTime<Utc>,
        after: Option<&WorkItemId>,
        limit: u32,
    ) -> Result<Vec<WorkItem>, RepositoryError>;

    /// Items created in or currently owned by the workspace.
    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<WorkItem>, RepositoryError>;

    /// Flags an open item as escalated and hands it to `owner`, only if it is not flagged yet.
    async fn mark_escalated(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Undoes the [`mark_escalated`](Self::mark_escalated) made at `at` and hands the item back to
    /// `owner`. A no-op when the item was changed since.
    async fn revert_escalation(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait EscalationEventRepository: Send + Sync {
    async fn append(&self, event: EscalationEvent) -> Result<(), RepositoryError>;

    async fn list_for_item(
        &self,
        item_id: &WorkItemId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<EscalationEvent>, RepositoryError>;
}

pub(crate) fn decode_err(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(decode_err)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}
