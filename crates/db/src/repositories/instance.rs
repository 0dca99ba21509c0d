use sqlx::Row;

use stagehand_core::domain::instance::{ApprovalInstance, ApprovalStage, InstanceId};
use stagehand_core::domain::policy::PolicyId;
use stagehand_core::domain::work_item::{Priority, WorkItemId};
use stagehand_core::domain::WorkspaceId;

use super::{
    decode_err, from_json, is_unique_violation, parse_optional_timestamp, parse_timestamp, to_json,
    ApprovalInstanceRepository, RepositoryError,
};
use crate::DbPool;

const INSTANCE_COLUMNS: &str = "id, work_item_id, workspace_id, policy_id, submitter_id, title,
    priority, current_level, current_stage, level_state_json, level_entered_at, history_json,
    escalated, escalated_at, version, created_at, updated_at";

const ACTIVE_FILTER: &str = "current_stage NOT IN ('approved', 'rejected', 'withdrawn')";

pub struct SqlApprovalInstanceRepository {
    pool: DbPool,
}

impl SqlApprovalInstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalInstance, RepositoryError> {
    let priority: String = row.try_get("priority").map_err(decode_err)?;
    let stage: String = row.try_get("current_stage").map_err(decode_err)?;
    let current_level: i64 = row.try_get("current_level").map_err(decode_err)?;
    let level_state_json: String = row.try_get("level_state_json").map_err(decode_err)?;
    let history_json: String = row.try_get("history_json").map_err(decode_err)?;
    let level_entered_at: String = row.try_get("level_entered_at").map_err(decode_err)?;
    let escalated_at: Option<String> = row.try_get("escalated_at").map_err(decode_err)?;
    let version: i64 = row.try_get("version").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_err)?;

    Ok(ApprovalInstance {
        id: InstanceId(row.try_get("id").map_err(decode_err)?),
        work_item_id: WorkItemId(row.try_get("work_item_id").map_err(decode_err)?),
        workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(decode_err)?),
        policy_id: PolicyId(row.try_get("policy_id").map_err(decode_err)?),
        submitter_id: row.try_get("submitter_id").map_err(decode_err)?,
        title: row.try_get("title").map_err(decode_err)?,
        priority: Priority::parse(&priority)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority}`")))?,
        current_level: u32::try_from(current_level).map_err(decode_err)?,
        current_stage: ApprovalStage::parse(&stage)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown stage `{stage}`")))?,
        level_state: from_json("level_state_json", &level_state_json)?,
        level_entered_at: parse_timestamp(&level_entered_at)?,
        history: from_json("history_json", &history_json)?,
        escalated: row.try_get("escalated").map_err(decode_err)?,
        escalated_at: parse_optional_timestamp(escalated_at)?,
        version: u64::try_from(version).map_err(decode_err)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn version_param(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(decode_err)
}

#[async_trait::async_trait]
impl ApprovalInstanceRepository for SqlApprovalInstanceRepository {
    async fn find_by_id(
        &self,
        id: &InstanceId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM approval_instance WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn find_active_for_work_item(
        &self,
        work_item_id: &WorkItemId,
    ) -> Result<Option<ApprovalInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instance
             WHERE work_item_id = ? AND {ACTIVE_FILTER}"
        ))
        .bind(&work_item_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn list_active(
        &self,
        after: Option<&InstanceId>,
        limit: u32,
    ) -> Result<Vec<ApprovalInstance>, RepositoryError> {
        let after = after.map(|id| id.0.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instance
             WHERE {ACTIVE_FILTER} AND (? IS NULL OR id > ?)
             ORDER BY id ASC
             LIMIT ?"
        ))
        .bind(after)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn insert(&self, instance: ApprovalInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO approval_instance (id, work_item_id, workspace_id, policy_id,
                                            submitter_id, title, priority, current_level,
                                            current_stage, level_state_json, level_entered_at,
                                            history_json, escalated, escalated_at, version,
                                            created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(&instance.work_item_id.0)
        .bind(&instance.workspace_id.0)
        .bind(&instance.policy_id.0)
        .bind(&instance.submitter_id)
        .bind(&instance.title)
        .bind(instance.priority.as_str())
        .bind(i64::from(instance.current_level))
        .bind(instance.current_stage.as_str())
        .bind(to_json(&instance.level_state)?)
        .bind(instance.level_entered_at.to_rfc3339())
        .bind(to_json(&instance.history)?)
        .bind(instance.escalated)
        .bind(instance.escalated_at.map(|at| at.to_rfc3339()))
        .bind(version_param(instance.version)?)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(RepositoryError::Conflict(format!(
                "work item `{}` already has an active approval instance",
                instance.work_item_id
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        instance: ApprovalInstance,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval_instance SET
                 current_level = ?,
                 current_stage = ?,
                 level_state_json = ?,
                 level_entered_at = ?,
                 history_json = ?,
                 escalated = ?,
                 escalated_at = ?,
                 version = ?,
                 updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(i64::from(instance.current_level))
        .bind(instance.current_stage.as_str())
        .bind(to_json(&instance.level_state)?)
        .bind(instance.level_entered_at.to_rfc3339())
        .bind(to_json(&instance.history)?)
        .bind(instance.escalated)
        .bind(instance.escalated_at.map(|at| at.to_rfc3339()))
        .bind(version_param(instance.version)?)
        .bind(instance.updated_at.to_rfc3339())
        .bind(&instance.id.0)
        .bind(version_param(expected_version)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
