//! # Power Event Repository
//!
//! Append-only history of power transitions. A trigger in the schema
//! rejects any UPDATE, so rows can only be inserted or aged out.

use sqlx::SqlitePool;

use super::{from_millis, to_millis};
use crate::error::DbResult;
use meridian_core::{NewPowerEvent, PowerEvent, PowerEventType, PowerState, RecoveryStatus};

#[derive(Debug, sqlx::FromRow)]
struct PowerEventRow {
    id: i64,
    terminal_id: String,
    event_type: PowerEventType,
    power_state: PowerState,
    battery_level: Option<f64>,
    estimated_runtime_minutes: Option<i64>,
    affected_transactions: i64,
    recovery_status: Option<RecoveryStatus>,
    notes: Option<String>,
    occurred_ms: i64,
}

impl PowerEventRow {
    fn into_event(self) -> DbResult<PowerEvent> {
        Ok(PowerEvent {
            occurred_at: from_millis("power_event", self.id, self.occurred_ms)?,
            id: self.id,
            terminal_id: self.terminal_id,
            event_type: self.event_type,
            power_state: self.power_state,
            battery_level: self.battery_level.map(|level| level as f32),
            estimated_runtime_minutes: self.estimated_runtime_minutes,
            affected_transactions: self.affected_transactions,
            recovery_status: self.recovery_status,
            notes: self.notes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PowerEventRepository {
    pool: SqlitePool,
}

impl PowerEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PowerEventRepository { pool }
    }

    /// Appends an event and returns its id.
    pub async fn append(&self, event: &NewPowerEvent) -> DbResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO power_events (
                terminal_id, event_type, power_state, battery_level,
                estimated_runtime_minutes, affected_transactions, recovery_status,
                notes, occurred_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            "#,
        )
        .bind(&event.terminal_id)
        .bind(event.event_type)
        .bind(event.power_state)
        .bind(event.battery_level.map(f64::from))
        .bind(event.estimated_runtime_minutes)
        .bind(event.affected_transactions)
        .bind(event.recovery_status)
        .bind(&event.notes)
        .bind(to_millis(event.occurred_at))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Newest events first, optionally of one type.
    pub async fn recent(
        &self,
        terminal_id: &str,
        event_type: Option<PowerEventType>,
        limit: u32,
    ) -> DbResult<Vec<PowerEvent>> {
        let rows: Vec<PowerEventRow> = sqlx::query_as(
            r#"
            SELECT id, terminal_id, event_type, power_state, battery_level,
                   estimated_runtime_minutes, affected_transactions, recovery_status,
                   notes, occurred_ms
            FROM power_events
            WHERE terminal_id = ?1 AND (?2 IS NULL OR event_type = ?2)
            ORDER BY occurred_ms DESC, id DESC
            LIMIT ?3
            "#,
        )
        .bind(terminal_id)
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PowerEventRow::into_event).collect()
    }

    pub async fn latest(&self, terminal_id: &str) -> DbResult<Option<PowerEvent>> {
        Ok(self.recent(terminal_id, None, 1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{Duration, Utc};

    fn event(event_type: PowerEventType, state: PowerState, secs_ago: i64) -> NewPowerEvent {
        NewPowerEvent {
            terminal_id: "TERM-A".into(),
            event_type,
            power_state: state,
            battery_level: Some(62.5),
            estimated_runtime_minutes: Some(18),
            affected_transactions: 1,
            recovery_status: None,
            notes: None,
            occurred_at: meridian_core::storage_precision(Utc::now() - Duration::seconds(secs_ago)),
        }
    }

    #[tokio::test]
    async fn test_recent_filters_and_orders() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.power_events();
        repo.append(&event(PowerEventType::PowerCut, PowerState::OnBattery, 30))
            .await
            .unwrap();
        repo.append(&event(PowerEventType::BatteryLow, PowerState::LowBattery, 20))
            .await
            .unwrap();
        repo.append(&event(PowerEventType::PowerRestored, PowerState::Online, 10))
            .await
            .unwrap();

        let all = repo.recent("TERM-A", None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, PowerEventType::PowerRestored);
        assert_eq!(all[0].battery_level, Some(62.5));

        let cuts = repo
            .recent("TERM-A", Some(PowerEventType::PowerCut), 10)
            .await
            .unwrap();
        assert_eq!(cuts.len(), 1);
        assert_eq!(cuts[0].power_state, PowerState::OnBattery);

        assert!(repo.recent("TERM-B", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_cannot_be_rewritten() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let id = db
            .power_events()
            .append(&event(PowerEventType::PowerCut, PowerState::OnBattery, 0))
            .await
            .unwrap();

        let rewritten = sqlx::query("UPDATE power_events SET notes = 'edited' WHERE id = ?1")
            .bind(id)
            .execute(db.pool())
            .await;
        assert!(rewritten.is_err());
    }
}
