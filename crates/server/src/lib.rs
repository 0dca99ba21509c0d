pub mod bootstrap;
pub mod health;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod watchdog;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use scheduler::{AutoApprovalScheduler, AutoApprovalSweep};
pub use watchdog::{EscalationSweep, EscalationWatchdog};
pub use workflow::{
    ActionReceipt, ApprovalWorkflowService, OverdueWorkItem, ReceiptStatus, Repositories,
    SubmissionOutcome,
};
