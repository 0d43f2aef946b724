//! Sync queue database operations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{Actor, PatientFields, Priority, SyncAction, SyncQueueItem, SyncStatus};

const SELECT_QUEUE_ITEM: &str = r#"
    SELECT id, action, entity_type, target_id, payload, payload_digest, sent_digest,
           priority, status, sequence, retry_count, max_retries,
           next_attempt_at, last_error, server_id, actor,
           enqueued_at, updated_at, synced_at
    FROM sync_queue
"#;

impl Database {
    /// Insert or update a queue item.
    pub fn upsert_queue_item(&self, item: &SyncQueueItem) -> DbResult<()> {
        upsert_queue_item(&self.conn, item)
    }

    /// Get a queue item by ID.
    pub fn get_queue_item(&self, id: &str) -> DbResult<Option<SyncQueueItem>> {
        self.conn
            .query_row(&format!("{SELECT_QUEUE_ITEM} WHERE id = ?"), [id], read_row)
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Get the queue item targeting a record's temporary ID.
    pub fn get_queue_item_for_target(&self, target_id: &str) -> DbResult<Option<SyncQueueItem>> {
        self.conn
            .query_row(
                &format!("{SELECT_QUEUE_ITEM} WHERE target_id = ?"),
                [target_id],
                read_row,
            )
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// List queue items in dequeue order (priority, then FIFO).
    pub fn list_queue_items(&self) -> DbResult<Vec<SyncQueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"{SELECT_QUEUE_ITEM}
            ORDER BY CASE priority WHEN 'critical' THEN 0 ELSE 1 END, sequence"#
        ))?;
        let rows = stmt.query_map([], read_row)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.try_into()?);
        }
        Ok(items)
    }

    /// Delete a queue item.
    pub fn delete_queue_item(&self, id: &str) -> DbResult<bool> {
        delete_queue_item(&self.conn, id)
    }
}

pub(crate) fn upsert_queue_item(conn: &Connection, item: &SyncQueueItem) -> DbResult<()> {
    let payload_json = serde_json::to_string(&item.payload)?;
    let actor_json = serde_json::to_string(&item.actor)?;

    conn.execute(
        r#"
        INSERT INTO sync_queue (
            id, action, entity_type, target_id, payload, payload_digest, sent_digest,
            priority, status, sequence, retry_count, max_retries,
            next_attempt_at, last_error, server_id, actor,
            enqueued_at, updated_at, synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
        ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            payload_digest = excluded.payload_digest,
            sent_digest = excluded.sent_digest,
            priority = excluded.priority,
            status = excluded.status,
            retry_count = excluded.retry_count,
            max_retries = excluded.max_retries,
            next_attempt_at = excluded.next_attempt_at,
            last_error = excluded.last_error,
            server_id = excluded.server_id,
            updated_at = excluded.updated_at,
            synced_at = excluded.synced_at
        "#,
        params![
            item.id,
            item.action.as_str(),
            item.entity_type,
            item.target_id,
            payload_json,
            item.payload_digest,
            item.sent_digest,
            item.priority.as_str(),
            item.status.as_str(),
            item.sequence,
            item.retry_count,
            item.max_retries,
            item.next_attempt_at.map(format_ts),
            item.last_error,
            item.server_id,
            actor_json,
            format_ts(item.enqueued_at),
            format_ts(item.updated_at),
            item.synced_at.map(format_ts),
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_queue_item(conn: &Connection, id: &str) -> DbResult<bool> {
    let rows_affected = conn.execute("DELETE FROM sync_queue WHERE id = ?", [id])?;
    Ok(rows_affected > 0)
}

/// Timestamps are stored with fixed precision so they sort as text.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DbError::Constraint(format!("Invalid timestamp {s:?}: {e}")))
}

/// Intermediate row struct for database mapping.
struct QueueRow {
    id: String,
    action: String,
    entity_type: String,
    target_id: String,
    payload: String,
    payload_digest: String,
    sent_digest: Option<String>,
    priority: String,
    status: String,
    sequence: i64,
    retry_count: u32,
    max_retries: u32,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
    server_id: Option<String>,
    actor: String,
    enqueued_at: String,
    updated_at: String,
    synced_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        action: row.get(1)?,
        entity_type: row.get(2)?,
        target_id: row.get(3)?,
        payload: row.get(4)?,
        payload_digest: row.get(5)?,
        sent_digest: row.get(6)?,
        priority: row.get(7)?,
        status: row.get(8)?,
        sequence: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        next_attempt_at: row.get(12)?,
        last_error: row.get(13)?,
        server_id: row.get(14)?,
        actor: row.get(15)?,
        enqueued_at: row.get(16)?,
        updated_at: row.get(17)?,
        synced_at: row.get(18)?,
    })
}

impl TryFrom<QueueRow> for SyncQueueItem {
    type Error = DbError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let payload: PatientFields = serde_json::from_str(&row.payload)?;
        let actor: Actor = serde_json::from_str(&row.actor)?;
        let action = SyncAction::parse(&row.action)
            .ok_or_else(|| DbError::Constraint(format!("Unknown sync action: {}", row.action)))?;
        let priority = Priority::parse(&row.priority)
            .ok_or_else(|| DbError::Constraint(format!("Unknown priority: {}", row.priority)))?;
        let status = SyncStatus::parse(&row.status)
            .ok_or_else(|| DbError::Constraint(format!("Unknown sync status: {}", row.status)))?;

        Ok(SyncQueueItem {
            id: row.id,
            action,
            entity_type: row.entity_type,
            target_id: row.target_id,
            payload,
            payload_digest: row.payload_digest,
            sent_digest: row.sent_digest,
            priority,
            status,
            sequence: row.sequence,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_attempt_at: row.next_attempt_at.as_deref().map(parse_ts).transpose()?,
            last_error: row.last_error,
            server_id: row.server_id,
            actor,
            enqueued_at: parse_ts(&row.enqueued_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            synced_at: row.synced_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
