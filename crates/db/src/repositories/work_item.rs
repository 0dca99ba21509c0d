use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use stagehand_core::domain::work_item::{
    Deadline, Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
use stagehand_core::domain::WorkspaceId;

use super::{
    decode_err, from_json, parse_optional_timestamp, parse_timestamp, to_json, RepositoryError,
    WorkItemRepository,
};
use crate::DbPool;

const WORK_ITEM_COLUMNS: &str = "id, item_type, title, category, priority, estimated_hours,
    assignee_id, deadline_json, workspace_id, owner_workspace_id, parent_workspace_id, status,
    escalated, escalated_at, created_at, updated_at";

pub struct SqlWorkItemRepository {
    pool: DbPool,
}

impl SqlWorkItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_work_item(row: &sqlx::sqlite::SqliteRow) -> Result<WorkItem, RepositoryError> {
    let item_type: String = row.try_get("item_type").map_err(decode_err)?;
    let priority: String = row.try_get("priority").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    let estimated_hours: Option<String> = row.try_get("estimated_hours").map_err(decode_err)?;
    let deadline_json: Option<String> = row.try_get("deadline_json").map_err(decode_err)?;
    let parent_workspace_id: Option<String> =
        row.try_get("parent_workspace_id").map_err(decode_err)?;
    let escalated_at: Option<String> = row.try_get("escalated_at").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_err)?;

    let deadline = deadline_json
        .as_deref()
        .map(|raw| from_json::<Deadline>("deadline_json", raw))
        .transpose()?;
    let estimated_hours =
        estimated_hours.as_deref().map(Decimal::from_str).transpose().map_err(decode_err)?;

    Ok(WorkItem {
        id: WorkItemId(row.try_get("id").map_err(decode_err)?),
        item_type: WorkItemType::parse(&item_type)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown item type `{item_type}`")))?,
        title: row.try_get("title").map_err(decode_err)?,
        category: row.try_get("category").map_err(decode_err)?,
        priority: Priority::parse(&priority)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority}`")))?,
        estimated_hours,
        assignee_id: row.try_get("assignee_id").map_err(decode_err)?,
        deadline,
        workspace_id: WorkspaceId(row.try_get("workspace_id").map_err(decode_err)?),
        owner_workspace_id: WorkspaceId(row.try_get("owner_workspace_id").map_err(decode_err)?),
        parent_workspace_id: parent_workspace_id.map(WorkspaceId),
        status: WorkItemStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status}`")))?,
        escalated: row.try_get("escalated").map_err(decode_err)?,
        escalated_at: parse_optional_timestamp(escalated_at)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl WorkItemRepository for SqlWorkItemRepository {
    async fn find_by_id(&self, id: &WorkItemId) -> Result<Option<WorkItem>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WORK_ITEM_COLUMNS} FROM work_item WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_work_item).transpose()
    }

    async fn save(&self, item: WorkItem) -> Result<(), RepositoryError> {
        let deadline_json = item.deadline.as_ref().map(to_json).transpose()?;

        sqlx::query(
            "INSERT INTO work_item (id, item_type, title, category, priority, estimated_hours,
                                    assignee_id, deadline_json, due_at, workspace_id,
                                    owner_workspace_id, parent_workspace_id, status, escalated,
                                    escalated_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 item_type = excluded.item_type,
                 title = excluded.title,
                 category = excluded.category,
                 priority = excluded.priority,
                 estimated_hours = excluded.estimated_hours,
                 assignee_id = excluded.assignee_id,
                 deadline_json = excluded.deadline_json,
                 due_at = excluded.due_at,
                 owner_workspace_id = excluded.owner_workspace_id,
                 parent_workspace_id = excluded.parent_workspace_id,
                 status = excluded.status,
                 escalated = excluded.escalated,
                 escalated_at = excluded.escalated_at,
                 updated_at = excluded.updated_at",
        )
        .bind(&item.id.0)
        .bind(item.item_type.as_str())
        .bind(&item.title)
        .bind(&item.category)
        .bind(item.priority.as_str())
        .bind(item.estimated_hours.map(|hours| hours.to_string()))
        .bind(&item.assignee_id)
        .bind(deadline_json)
        .bind(item.effective_due_at().map(|due_at| due_at.timestamp()))
        .bind(&item.workspace_id.0)
        .bind(&item.owner_workspace_id.0)
        .bind(item.parent_workspace_id.as_ref().map(|parent| parent.0.clone()))
        .bind(item.status.as_str())
        .bind(item.escalated)
        .bind(item.escalated_at.map(|at| at.to_rfc3339()))
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_escalation_candidates(
        &self,
        due_before: DateTime<Utc>,
        after: Option<&WorkItemId>,
        limit: u32,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let after = after.map(|id| id.0.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_item
             WHERE status = 'open' AND escalated = 0 AND due_at IS NOT NULL AND due_at <= ?
               AND (? IS NULL OR id > ?)
             ORDER BY id ASC
             LIMIT ?"
        ))
        .bind(due_before.timestamp())
        .bind(after)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_work_item).collect()
    }

    async fn list_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<WorkItem>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_item
             WHERE workspace_id = ? OR owner_workspace_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&workspace_id.0)
        .bind(&workspace_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_work_item).collect()
    }

    async fn mark_escalated(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let at = at.to_rfc3339();
        let result = sqlx::query(
            "UPDATE work_item
             SET escalated = 1, escalated_at = ?, owner_workspace_id = ?, updated_at = ?
             WHERE id = ? AND escalated = 0 AND status = 'open'",
        )
        .bind(&at)
        .bind(&owner.0)
        .bind(&at)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_escalation(
        &self,
        id: &WorkItemId,
        owner: &WorkspaceId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE work_item
             SET escalated = 0, escalated_at = NULL, owner_workspace_id = ?
             WHERE id = ? AND escalated = 1 AND escalated_at = ?",
        )
        .bind(&owner.0)
        .bind(&id.0)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use stagehand_core::domain::work_item::{
        Deadline, Priority, WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
    };
    use stagehand_core::domain::WorkspaceId;

    use super::SqlWorkItemRepository;
    use crate::repositories::WorkItemRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlWorkItemRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlWorkItemRepository::new(pool)
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn issue(id: &str, created_at: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: WorkItemId(id.to_string()),
            item_type: WorkItemType::Issue,
            title: "Wristband scanners dropping".to_string(),
            category: Some("operations".to_string()),
            priority: Priority::Urgent,
            estimated_hours: Some(Decimal::new(25, 1)),
            assignee_id: Some("u-ops".to_string()),
            deadline: Some(Deadline::SlaHours { hours: 4, started_at: created_at }),
            workspace_id: WorkspaceId("ws-fest".to_string()),
            owner_workspace_id: WorkspaceId("ws-fest".to_string()),
            parent_workspace_id: Some(WorkspaceId("ws-org".to_string())),
            status: WorkItemStatus::Open,
            escalated: false,
            escalated_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn sql_work_item_repo_round_trips_deadline_and_hours() {
        let repo = setup().await;
        let stored = issue("issue-1", ts("2026-08-01T08:00:00Z"));

        repo.save(stored.clone()).await.expect("save");
        let found = repo.find_by_id(&stored.id).await.expect("find");

        assert_eq!(found, Some(stored));
    }

    #[tokio::test]
    async fn sql_mark_escalated_is_a_one_shot_per_episode() {
        let repo = setup().await;
        let created = ts("2026-08-01T08:00:00Z");
        repo.save(issue("issue-1", created)).await.expect("save");
        let id = WorkItemId("issue-1".to_string());
        let org = WorkspaceId("ws-org".to_string());

        assert!(repo.mark_escalated(&id, &org, created + Duration::hours(30)).await.expect("1st"));
        assert!(!repo.mark_escalated(&id, &org, created + Duration::hours(31)).await.expect("2nd"));

        let mut item = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert!(item.escalated);
        assert_eq!(item.owner_workspace_id, org);
        assert_eq!(repo.list_for_workspace(&org).await.expect("list").len(), 1);

        item.reassign("u-night-shift", created + Duration::hours(32));
        repo.save(item).await.expect("save reassigned");
        assert!(repo.mark_escalated(&id, &org, created + Duration::hours(40)).await.expect("3rd"));
    }

    #[tokio::test]
    async fn sql_escalation_candidates_are_due_open_and_unflagged() {
        let repo = setup().await;
        let created = ts("2026-08-01T08:00:00Z");
        let mut resolved = issue("issue-1", created);
        resolved.resolve(created + Duration::hours(1));
        repo.save(resolved).await.expect("save resolved");
        let mut undated = issue("issue-2", created);
        undated.deadline = None;
        repo.save(undated).await.expect("save undated");
        repo.save(issue("issue-3", created)).await.expect("save due");
        repo.save(issue("issue-4", created + Duration::hours(2))).await.expect("save later");
        repo.save(issue("issue-5", created)).await.expect("save flagged");
        let org = WorkspaceId("ws-org".to_string());
        let flagged = WorkItemId("issue-5".to_string());
        repo.mark_escalated(&flagged, &org, created + Duration::hours(5)).await.expect("flag");

        let cutoff = created + Duration::hours(5);
        let due = repo.list_escalation_candidates(cutoff, None, 10).await.expect("candidates");
        let ids: Vec<&str> = due.iter().map(|item| item.id.0.as_str()).collect();
        assert_eq!(ids, vec!["issue-3"]);

        let later = repo
            .list_escalation_candidates(cutoff + Duration::hours(2), None, 1)
            .await
            .expect("first page");
        assert_eq!(later[0].id.0, "issue-3");
        let next = repo
            .list_escalation_candidates(cutoff + Duration::hours(2), Some(&later[0].id), 1)
            .await
            .expect("second page");
        assert_eq!(next[0].id.0, "issue-4");
    }

    #[tokio::test]
    async fn sql_revert_escalation_restores_the_previous_owner() {
        let repo = setup().await;
        let created = ts("2026-08-01T08:00:00Z");
        repo.save(issue("issue-1", created)).await.expect("save");
        let id = WorkItemId("issue-1".to_string());
        let fest = WorkspaceId("ws-fest".to_string());
        let org = WorkspaceId("ws-org".to_string());
        let at = created + Duration::hours(30);
        repo.mark_escalated(&id, &org, at).await.expect("flag");

        assert!(!repo.revert_escalation(&id, &fest, at + Duration::hours(1)).await.expect("stale"));
        assert!(repo.revert_escalation(&id, &fest, at).await.expect("revert"));

        let item = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert!(!item.escalated);
        assert_eq!(item.escalated_at, None);
        assert_eq!(item.owner_workspace_id, fest);
        assert_eq!(repo.list_escalation_candidates(at, None, 10).await.expect("due").len(), 1);
    }
}
