//! Offline policy tooling: check a policy file before loading it, and preview which policy a work
//! item would be routed to.
//!
//! Policy files list entries under `[[policies]]`. Entries earlier in the file count as older
//! when two policies tie on specificity.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use stagehand_core::domain::instance::ApprovalStage;
use stagehand_core::domain::policy::{ApprovalLevel, ApprovalPolicy, PolicyCriteria, PolicyId};
use stagehand_core::domain::work_item::{
    Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
use stagehand_core::domain::WorkspaceId;
use stagehand_core::policy::{validate_policy_set, PolicyMatcher, PolicySelection};

use crate::commands::CommandResult;

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyEntry>,
}

#[derive(Debug, Deserialize)]
struct PolicyEntry {
    id: String,
    workspace_id: String,
    name: String,
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    criteria: PolicyCriteria,
    chain: Vec<ApprovalLevel>,
    #[serde(default = "enabled")]
    require_all_levels: bool,
    #[serde(default)]
    allow_self_approval: bool,
    #[serde(default)]
    auto_approve_after_hours: Option<u32>,
    #[serde(default)]
    revision_target: Option<ApprovalStage>,
    #[serde(default = "enabled")]
    is_enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ItemFile {
    id: String,
    workspace_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "medium")]
    priority: Priority,
    #[serde(default)]
    estimated_hours: Option<Decimal>,
}

fn medium() -> Priority {
    Priority::Medium
}

pub fn validate(path: &Path) -> CommandResult {
    let policies = match load_policies(path) {
        Ok(policies) => policies,
        Err(message) => return CommandResult::failure("policy validate", "policy_file", message, 2),
    };

    let mut accepted: Vec<ApprovalPolicy> = Vec::with_capacity(policies.len());
    for policy in policies {
        if let Err(error) = validate_policy_set(&policy, &accepted) {
            return CommandResult::failure(
                "policy validate",
                "policy_validation",
                error.to_string(),
                3,
            );
        }
        accepted.retain(|existing| existing.id != policy.id);
        accepted.push(policy);
    }

    let ids: Vec<&str> = accepted.iter().map(|policy| policy.id.0.as_str()).collect();
    CommandResult::success_with_data(
        "policy validate",
        format!("{} policies valid", accepted.len()),
        Some(json!({ "policies": ids })),
    )
}

pub fn matches(policies_path: &Path, item_path: &Path) -> CommandResult {
    let policies = match load_policies(policies_path) {
        Ok(policies) => policies,
        Err(message) => return CommandResult::failure("policy match", "policy_file", message, 2),
    };
    let item = match load_item(item_path) {
        Ok(item) => item,
        Err(message) => return CommandResult::failure("policy match", "item_file", message, 2),
    };

    match PolicyMatcher::new().select_policy(&item, &policies) {
        PolicySelection::NotRequired => CommandResult::success_with_data(
            "policy match",
            format!("no approval required for `{}`", item.id),
            Some(json!({ "outcome": "not_required", "work_item_id": item.id.0 })),
        ),
        PolicySelection::Selected(selected) => CommandResult::success_with_data(
            "policy match",
            format!("`{}` routes to policy `{}`", item.id, selected.policy.id),
            Some(json!({
                "outcome": "selected",
                "work_item_id": item.id.0,
                "policy_id": selected.policy.id.0,
                "reason": selected.reason,
                "specificity": selected.specificity,
                "levels": selected.policy.chain.len(),
            })),
        ),
    }
}

fn load_policies(path: &Path) -> Result<Vec<ApprovalPolicy>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read `{}`: {error}", path.display()))?;
    let file: PolicyFile = toml::from_str(&raw)
        .map_err(|error| format!("could not parse `{}`: {error}", path.display()))?;

    Ok(file
        .policies
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let offset = i64::try_from(index).unwrap_or(i64::MAX);
            let created_at = file_epoch() + Duration::seconds(offset);
            ApprovalPolicy {
                id: PolicyId(entry.id),
                workspace_id: WorkspaceId(entry.workspace_id),
                name: entry.name,
                is_default: entry.is_default,
                criteria: entry.criteria,
                chain: entry.chain,
                require_all_levels: entry.require_all_levels,
                allow_self_approval: entry.allow_self_approval,
                auto_approve_after_hours: entry.auto_approve_after_hours,
                revision_target: entry.revision_target,
                is_enabled: entry.is_enabled,
                created_at,
                updated_at: created_at,
            }
        })
        .collect())
}

fn load_item(path: &Path) -> Result<WorkItem, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("could not read `{}`: {error}", path.display()))?;
    let file: ItemFile = toml::from_str(&raw)
        .map_err(|error| format!("could not parse `{}`: {error}", path.display()))?;

    let now = Utc::now();
    let workspace_id = WorkspaceId(file.workspace_id);
    Ok(WorkItem {
        title: file.title.unwrap_or_else(|| file.id.clone()),
        id: WorkItemId(file.id),
        item_type: WorkItemType::Task,
        category: file.category,
        priority: file.priority,
        estimated_hours: file.estimated_hours,
        assignee_id: None,
        deadline: None,
        owner_workspace_id: workspace_id.clone(),
        workspace_id,
        parent_workspace_id: None,
        status: WorkItemStatus::Open,
        escalated: false,
        escalated_at: None,
        created_at: now,
        updated_at: now,
    })
}

fn file_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}
