use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::Row;

use stagehand_core::domain::escalation::{EscalationEvent, EscalationEventId};
use stagehand_core::domain::work_item::{WorkItemId, WorkItemType};
use stagehand_core::domain::WorkspaceId;

use super::{
    decode_err, is_unique_violation, parse_timestamp, EscalationEventRepository, RepositoryError,
};
use crate::DbPool;

const EVENT_COLUMNS: &str = "id, item_id, item_type, escalated_from, escalated_to,
    overdue_hours_at_escalation, created_at";

/// Append-only store; rows are never updated or deleted.
pub struct SqlEscalationEventRepository {
    pool: DbPool,
}

impl SqlEscalationEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<EscalationEvent, RepositoryError> {
    let item_type: String = row.try_get("item_type").map_err(decode_err)?;
    let overdue: String = row.try_get("overdue_hours_at_escalation").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(EscalationEvent {
        id: EscalationEventId(row.try_get("id").map_err(decode_err)?),
        item_id: WorkItemId(row.try_get("item_id").map_err(decode_err)?),
        item_type: WorkItemType::parse(&item_type)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown item type `{item_type}`")))?,
        escalated_from: WorkspaceId(row.try_get("escalated_from").map_err(decode_err)?),
        escalated_to: WorkspaceId(row.try_get("escalated_to").map_err(decode_err)?),
        overdue_hours_at_escalation: Decimal::from_str(&overdue).map_err(decode_err)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait::async_trait]
impl EscalationEventRepository for SqlEscalationEventRepository {
    async fn append(&self, event: EscalationEvent) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO escalation_event (id, item_id, item_type, escalated_from, escalated_to,
                                           overdue_hours_at_escalation, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.item_id.0)
        .bind(event.item_type.as_str())
        .bind(&event.escalated_from.0)
        .bind(&event.escalated_to.0)
        .bind(event.overdue_hours_at_escalation.to_string())
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(RepositoryError::Conflict(format!(
                "escalation event `{}` already recorded",
                event.id
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn list_for_item(
        &self,
        item_id: &WorkItemId,
    ) -> Result<Vec<EscalationEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM escalation_event
             WHERE item_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&item_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn list_all(&self) -> Result<Vec<EscalationEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM escalation_event ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use stagehand_core::domain::escalation::{EscalationEvent, EscalationEventId};
    use stagehand_core::domain::work_item::{WorkItemId, WorkItemType};
    use stagehand_core::domain::WorkspaceId;

    use super::SqlEscalationEventRepository;
    use crate::repositories::{EscalationEventRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    fn event(id: &str, item: &str, created_at: DateTime<Utc>) -> EscalationEvent {
        EscalationEvent {
            id: EscalationEventId(id.to_string()),
            item_id: WorkItemId(item.to_string()),
            item_type: WorkItemType::Approval,
            escalated_from: WorkspaceId("ws-gala".to_string()),
            escalated_to: WorkspaceId("ws-org".to_string()),
            overdue_hours_at_escalation: Decimal::new(3025, 2),
            created_at,
        }
    }

    #[tokio::test]
    async fn sql_escalation_events_are_append_only_and_listed_per_item() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlEscalationEventRepository::new(pool);
        let base = DateTime::parse_from_rfc3339("2026-09-01T00:00:00Z")
            .expect("valid rfc3339")
            .with_timezone(&Utc);

        let first = event("esc-1", "inst-1", base);
        repo.append(first.clone()).await.expect("append first");
        repo.append(event("esc-2", "task-9", base + Duration::hours(1))).await.expect("append");
        repo.append(event("esc-3", "inst-1", base + Duration::days(3))).await.expect("append");

        let error = repo.append(first.clone()).await.expect_err("duplicate id");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        let for_item =
            repo.list_for_item(&WorkItemId("inst-1".to_string())).await.expect("list for item");
        assert_eq!(for_item.len(), 2);
        assert_eq!(for_item[0], first);
        assert_eq!(repo.list_all().await.expect("list all").len(), 3);
    }
}
