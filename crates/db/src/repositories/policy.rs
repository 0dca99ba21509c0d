use sqlx::Row;

use stagehand_core::domain::instance::ApprovalStage;
use stagehand_core::domain::policy::{ApprovalPolicy, PolicyId};
use stagehand_core::domain::WorkspaceId;

use super::{decode_err, from_json, parse_timestamp, to_json, PolicyRepository, RepositoryError};
use crate::DbPool;

const POLICY_COLUMNS: &str = "id, workspace_id, name, is_default, criteria_json, chain_json,
    require_all_levels, allow_self_approval, auto_approve_after_hours, revision_target,
    is_enabled, created_at, updated_at";

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalPolicy, RepositoryError> {
    let criteria_json: String = row.try_get("criteria_json").map_err(decode_err)?;
    let chain_json: String = row.try_get("chain_json").map_err(decode_err)?;
    let auto_approve_after_hours: Option<i64> =
        row.try_get("auto_approve_after_hours").map_err(decode_err)?;
    let revision_target: Option<String> = row.try_get("revision_target").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_err)?;

    let revision_target = revision_target
        .map(|raw| {
            ApprovalStage::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown revision target `{raw}`"))
            })
        })
        .transpose()?;
    let auto_approve_after_hours = auto_approve_after_hours
        .map(|hours| u32::try_from(hours).map_err(decode_err))
        .transpose()?;

    Ok(ApprovalPolicy {
        id: PolicyId(row.try_get("id").map_err(decode_err)?),
        workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(decode_err)?),
        name: row.try_get("name").map_err(decode_err)?,
        is_default: row.try_get("is_default").map_err(decode_err)?,
        criteria: from_json("criteria_json", &criteria_json)?,
        chain: from_json("chain_json", &chain_json)?,
        require_all_levels: row.try_get("require_all_levels").map_err(decode_err)?,
        allow_self_approval: row.try_get("allow_self_approval").map_err(decode_err)?,
        auto_approve_after_hours,
        revision_target,
        is_enabled: row.try_get("is_enabled").map_err(decode_err)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM approval_policy WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_policy).transpose()
    }

    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<ApprovalPolicy>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM approval_policy
             WHERE workspace_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&workspace_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_policy).collect()
    }

    async fn save(&self, policy: ApprovalPolicy) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_policy (id, workspace_id, name, is_default, criteria_json,
                                          chain_json, require_all_levels, allow_self_approval,
                                          auto_approve_after_hours, revision_target, is_enabled,
                                          created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 is_default = excluded.is_default,
                 criteria_json = excluded.criteria_json,
                 chain_json = excluded.chain_json,
                 require_all_levels = excluded.require_all_levels,
                 allow_self_approval = excluded.allow_self_approval,
                 auto_approve_after_hours = excluded.auto_approve_after_hours,
                 revision_target = excluded.revision_target,
                 is_enabled = excluded.is_enabled,
                 updated_at = excluded.updated_at",
        )
        .bind(&policy.id.0)
        .bind(&policy.workspace_id.0)
        .bind(&policy.name)
        .bind(policy.is_default)
        .bind(to_json(&policy.criteria)?)
        .bind(to_json(&policy.chain)?)
        .bind(policy.require_all_levels)
        .bind(policy.allow_self_approval)
        .bind(policy.auto_approve_after_hours.map(i64::from))
        .bind(policy.revision_target.map(|stage| stage.as_str()))
        .bind(policy.is_enabled)
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
