pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod hierarchy;
pub mod notify;
pub mod policy;
pub mod scheduler;

pub use approvals::{
    ActionDecision, ActionOutcome, ApprovalChainExecutor, ApprovalError, ApproverActionRequest,
    StageTransition,
};
pub use domain::escalation::{EscalationEvent, EscalationEventId, SlaStatus};
pub use domain::instance::{
    ApprovalInstance, ApprovalStage, ApproverAction, HistoryAction, HistoryEntry, InstanceId,
    LevelState, SYSTEM_ACTOR,
};
pub use domain::policy::{
    ApprovalLevel, ApprovalPolicy, ApproverRule, PolicyCriteria, PolicyId, PolicyValidationError,
};
pub use domain::work_item::{
    Deadline, Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
pub use domain::WorkspaceId;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use escalation::{EscalationPlanner, SlaAssessment};
pub use hierarchy::{HierarchyError, HierarchyResolver, InMemoryHierarchyDirectory};
pub use notify::{InMemoryNotifier, Notification, NotificationIntent, NotificationTarget, Notifier};
pub use policy::{PolicyMatcher, PolicySelection};
