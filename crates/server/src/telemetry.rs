use stagehand_core::audit::{AuditEvent, AuditSink};
use stagehand_core::config::{LogFormat, LoggingConfig};
use stagehand_core::notify::{Notification, NotificationTarget, Notifier, NotifyError};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &LoggingConfig) {
    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));

    match config.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

/// Writes audit events into the structured log stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        info!(
            event_name = "audit.event",
            audit_event_type = %event.event_type,
            audit_category = ?event.category,
            audit_outcome = ?event.outcome,
            correlation_id = %event.correlation_id,
            instance_id = event.instance_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            work_item_id = event.work_item_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            actor = %event.actor,
            metadata = %metadata,
            "audit event"
        );
    }
}

/// Default delivery channel for deployments without a chat or mail integration.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let target = match &notification.target {
            NotificationTarget::User(user_id) => format!("user:{user_id}"),
            NotificationTarget::Workspace(workspace_id) => format!("workspace:{workspace_id}"),
        };
        let payload = serde_json::to_string(&notification.intent)
            .map_err(|error| NotifyError(error.to_string()))?;
        info!(
            event_name = "notify.dispatched",
            intent = notification.intent.name(),
            target = %target,
            payload = %payload,
            "notification dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use stagehand_core::domain::instance::{ApprovalStage, InstanceId};
    use stagehand_core::domain::work_item::WorkItemId;
    use stagehand_core::notify::{Notification, NotificationIntent, NotificationTarget, Notifier};

    use super::TracingNotifier;

    #[test]
    fn tracing_notifier_accepts_every_intent() {
        let notification = Notification {
            target: NotificationTarget::User("u-sam".to_string()),
            intent: NotificationIntent::StageChanged {
                instance_id: InstanceId("inst-1".to_string()),
                work_item_id: WorkItemId("task-1".to_string()),
                from: ApprovalStage::ContentReview,
                to: ApprovalStage::Approved,
                level: 1,
                actor_id: "u-fin-1".to_string(),
            },
            created_at: Utc::now(),
        };

        assert!(TracingNotifier.notify(notification).is_ok());
    }
}
