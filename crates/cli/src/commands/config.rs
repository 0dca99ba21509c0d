use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use stagehand_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One effective setting with every environment variable that can set it.
struct Setting {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(
            setting.key,
            setting.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }

    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let workflow = &config.workflow;
    vec![
        Setting {
            key: "database.url",
            value: config.database.url.clone(),
            env_keys: &["STAGEHAND_DATABASE_URL"],
        },
        Setting {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_keys: &["STAGEHAND_DATABASE_MAX_CONNECTIONS"],
        },
        Setting {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_keys: &["STAGEHAND_DATABASE_TIMEOUT_SECS"],
        },
        Setting {
            key: "workflow.breach_threshold_hours",
            value: workflow.breach_threshold_hours.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_BREACH_THRESHOLD_HOURS"],
        },
        Setting {
            key: "workflow.approval_sla_hours",
            value: workflow.approval_sla_hours.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_APPROVAL_SLA_HOURS"],
        },
        Setting {
            key: "workflow.auto_approval_sweep_secs",
            value: workflow.auto_approval_sweep_secs.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_AUTO_APPROVAL_SWEEP_SECS"],
        },
        Setting {
            key: "workflow.escalation_sweep_secs",
            value: workflow.escalation_sweep_secs.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_ESCALATION_SWEEP_SECS"],
        },
        Setting {
            key: "workflow.default_revision_target",
            value: workflow.default_revision_target.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_DEFAULT_REVISION_TARGET"],
        },
        Setting {
            key: "workflow.sweep_batch_size",
            value: workflow.sweep_batch_size.to_string(),
            env_keys: &["STAGEHAND_WORKFLOW_SWEEP_BATCH_SIZE"],
        },
        Setting {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_keys: &["STAGEHAND_SERVER_BIND_ADDRESS"],
        },
        Setting {
            key: "server.health_check_port",
            value: config.server.health_check_port.to_string(),
            env_keys: &["STAGEHAND_SERVER_HEALTH_CHECK_PORT"],
        },
        Setting {
            key: "server.graceful_shutdown_secs",
            value: config.server.graceful_shutdown_secs.to_string(),
            env_keys: &["STAGEHAND_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        },
        Setting {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["STAGEHAND_LOGGING_LEVEL", "STAGEHAND_LOG_LEVEL"],
        },
        Setting {
            key: "logging.format",
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
            env_keys: &["STAGEHAND_LOGGING_FORMAT", "STAGEHAND_LOG_FORMAT"],
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("stagehand.toml"), PathBuf::from("config/stagehand.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
