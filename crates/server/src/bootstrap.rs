use std::sync::Arc;

use stagehand_core::config::{AppConfig, ConfigError, LoadOptions};
use stagehand_core::hierarchy::HierarchyResolver;
use stagehand_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::scheduler::AutoApprovalScheduler;
use crate::watchdog::EscalationWatchdog;
use crate::workflow::{ApprovalWorkflowService, Repositories};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<ApprovalWorkflowService>,
    pub scheduler: Arc<AutoApprovalScheduler>,
    pub watchdog: Arc<EscalationWatchdog>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(
    options: LoadOptions,
    resolver: Arc<dyn HierarchyResolver>,
) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config, resolver).await
}

pub async fn bootstrap_with_config(
    config: AppConfig,
    resolver: Arc<dyn HierarchyResolver>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let service = Arc::new(ApprovalWorkflowService::new(
        Repositories::sqlite(db_pool.clone()),
        resolver,
        &config.workflow,
    ));
    let batch_size = config.workflow.sweep_batch_size;
    let scheduler = Arc::new(AutoApprovalScheduler::new(Arc::clone(&service), batch_size));
    let watchdog = Arc::new(EscalationWatchdog::new(Arc::clone(&service), batch_size));

    Ok(Application { config, db_pool, service, scheduler, watchdog })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use stagehand_core::approvals::ApproverActionRequest;
    use stagehand_core::config::{ConfigOverrides, LoadOptions};
    use stagehand_core::domain::instance::{ApprovalStage, ApproverAction};

    use crate::bootstrap::bootstrap;
    use crate::testing::{directory, finance_policy, item, ts};
    use crate::workflow::{ReceiptStatus, SubmissionOutcome};

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_a_terminal_revision_target() {
        let result = bootstrap(
            LoadOptions {
                overrides: ConfigOverrides {
                    database_url: Some("sqlite::memory:".to_string()),
                    default_revision_target: Some(ApprovalStage::Approved),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            },
            Arc::new(directory()),
        )
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("workflow.default_revision_target"));
    }

    #[tokio::test]
    async fn bootstrapped_service_runs_an_approval_against_sqlite() {
        let app = bootstrap(options("sqlite::memory:?cache=shared"), Arc::new(directory()))
            .await
            .expect("bootstrap should succeed");
        let now = ts("2026-03-02T09:00:00Z");

        app.service.create_or_update_policy(finance_policy(), now).await.expect("policy");
        let instance = match app
            .service
            .submit_for_approval(&item("task-1", Some("finance")), "u-sam", now)
            .await
            .expect("submit")
        {
            SubmissionOutcome::Submitted { instance, .. } => *instance,
            other => panic!("expected submission, got {other:?}"),
        };

        let receipt = app
            .service
            .record_approver_action(
                ApproverActionRequest {
                    instance_id: instance.id.clone(),
                    level: 1,
                    actor_id: "u-fin-1".to_string(),
                    action: ApproverAction::Approve,
                    notes: None,
                },
                now + Duration::hours(1),
            )
            .await
            .expect("approve");
        assert_eq!(receipt.status, ReceiptStatus::Committed);

        let stored = app.service.find_instance(&instance.id).await.expect("stored");
        assert_eq!(stored.current_stage, ApprovalStage::Approved);
        assert_eq!(stored.version, 1);

        let swept = app.watchdog.sweep(now + Duration::days(10)).await.expect("sweep");
        assert!(swept.events.is_empty(), "terminal instances are never escalated");

        app.db_pool.close().await;
    }
}
