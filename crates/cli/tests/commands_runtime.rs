use std::env;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use stagehand_cli::commands::{config, doctor, migrate};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("STAGEHAND_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_is_idempotent_against_a_file_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("stagehand.db").display());

    with_env(&[("STAGEHAND_DATABASE_URL", url.as_str())], || {
        let first = parse_payload(&migrate::run().output);
        let second = parse_payload(&migrate::run().output);

        assert_eq!(first["status"], "ok");
        assert_eq!(second["status"], "ok");
        assert_eq!(second["data"]["applied_now"], 0);
        assert_eq!(second["data"]["applied_total"], first["data"]["applied_total"]);
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("STAGEHAND_DATABASE_URL", "postgres://localhost/stagehand")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_passes_after_migrations_have_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("stagehand.db").display());

    with_env(&[("STAGEHAND_DATABASE_URL", url.as_str())], || {
        let before = parse_payload(&doctor::run(true));
        assert_eq!(before["overall_status"], "fail");
        assert_eq!(check_status(&before, "schema_migrations"), "fail");

        assert_eq!(migrate::run().exit_code, 0);

        let after = parse_payload(&doctor::run(true));
        assert_eq!(after["overall_status"], "pass");
        assert_eq!(check_status(&after, "database_connectivity"), "pass");
        assert_eq!(check_status(&after, "schema_migrations"), "pass");
    });
}

#[test]
fn doctor_skips_database_checks_when_config_is_invalid() {
    with_env(&[("STAGEHAND_WORKFLOW_DEFAULT_REVISION_TARGET", "approved")], || {
        let report = parse_payload(&doctor::run(true));

        assert_eq!(report["overall_status"], "fail");
        assert_eq!(check_status(&report, "config_validation"), "fail");
        assert_eq!(check_status(&report, "database_connectivity"), "skipped");
    });
}

#[test]
fn config_reports_env_sources() {
    with_env(
        &[
            ("STAGEHAND_DATABASE_URL", "sqlite::memory:"),
            ("STAGEHAND_WORKFLOW_BREACH_THRESHOLD_HOURS", "12"),
            ("STAGEHAND_LOG_LEVEL", "debug"),
        ],
        || {
            let output = config::run();

            assert!(output.contains(
                "- workflow.breach_threshold_hours = 12 (source: env (STAGEHAND_WORKFLOW_BREACH_THRESHOLD_HOURS))"
            ));
            assert!(output.contains("- logging.level = debug (source: env (STAGEHAND_LOG_LEVEL))"));
            assert!(output.contains("- workflow.approval_sla_hours = 48 (source: default)"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn check_status(report: &Value, name: &str) -> String {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "STAGEHAND_DATABASE_URL",
        "STAGEHAND_DATABASE_MAX_CONNECTIONS",
        "STAGEHAND_DATABASE_TIMEOUT_SECS",
        "STAGEHAND_WORKFLOW_BREACH_THRESHOLD_HOURS",
        "STAGEHAND_WORKFLOW_APPROVAL_SLA_HOURS",
        "STAGEHAND_WORKFLOW_AUTO_APPROVAL_SWEEP_SECS",
        "STAGEHAND_WORKFLOW_ESCALATION_SWEEP_SECS",
        "STAGEHAND_WORKFLOW_DEFAULT_REVISION_TARGET",
        "STAGEHAND_WORKFLOW_SWEEP_BATCH_SIZE",
        "STAGEHAND_SERVER_BIND_ADDRESS",
        "STAGEHAND_SERVER_HEALTH_CHECK_PORT",
        "STAGEHAND_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "STAGEHAND_LOGGING_LEVEL",
        "STAGEHAND_LOGGING_FORMAT",
        "STAGEHAND_LOG_LEVEL",
        "STAGEHAND_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
