//! Short-term memory: the per-conversation message queue.
//!
//! Entries move `pending -> in_flight -> processed`, or back to `pending` on a
//! failed analysis until the attempt cap drops them. Only processed and dropped
//! entries count towards the history cap; nothing unprocessed is ever evicted.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::config::QueueConfig;
use crate::error::{PersonaError, Result};
use crate::memory::records::write_audit_log;
use crate::memory::types::{format_timestamp, parse_column, Priority, QueueEntry, QueueState};

const ENTRY_COLUMNS: &str = "id, conversation_id, sender_id, sender_name, content, arrived_at, \
                             priority, state, attempts, is_bot, last_error";

/// Sender id used for the bot's own replies.
pub const BOT_SENDER: &str = "self";

/// An incoming chat message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// Private chat or a direct mention.
    pub is_priority: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    /// Process now, synchronously.
    Immediate,
    /// Wait for the batch cycle.
    Queued,
    /// Stored, but the conversation has more pending entries than it should.
    Backpressure { pending: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutcome {
    pub entry_id: i64,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequeueOutcome {
    /// Back in `pending` for the next cycle.
    pub retried: Vec<i64>,
    /// Hit the attempt cap.
    pub dropped: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub processed: usize,
    pub dropped: usize,
}

fn entry_from_row(row: &Row) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        arrived_at: row.get(5)?,
        priority: parse_column::<Priority>(6, row.get(6)?)?,
        state: parse_column::<QueueState>(7, row.get(7)?)?,
        attempts: row.get(8)?,
        is_bot: row.get::<_, i64>(9)? != 0,
        last_error: row.get(10)?,
    })
}

/// Store an incoming message and say how the coordinator should handle it.
pub fn enqueue(
    conn: &Connection,
    message: &NewMessage,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome> {
    if message.conversation_id.is_empty() {
        return Err(PersonaError::InvalidInput("conversation id is empty".into()));
    }

    let priority = if message.is_priority {
        Priority::Immediate
    } else {
        Priority::Batched
    };

    conn.execute(
        "INSERT INTO message_queue (conversation_id, sender_id, sender_name, content, arrived_at, priority) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.conversation_id,
            message.sender_id,
            message.sender_name,
            message.content,
            format_timestamp(now),
            priority.as_str()
        ],
    )?;
    let entry_id = conn.last_insert_rowid();

    let pending = pending_count(conn, &message.conversation_id)?;
    let disposition = if message.is_priority {
        Disposition::Immediate
    } else if pending > config.pending_capacity {
        tracing::warn!(
            conversation = %message.conversation_id,
            pending,
            capacity = config.pending_capacity,
            "queue backpressure"
        );
        Disposition::Backpressure { pending }
    } else {
        Disposition::Queued
    };

    Ok(EnqueueOutcome {
        entry_id,
        disposition,
    })
}

pub fn pending_count(conn: &Connection, conversation_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM message_queue WHERE conversation_id = ?1 AND state = 'pending'",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Claim up to `max_items` of the oldest pending entries, in arrival order.
pub fn drain_batch(conn: &Connection, conversation_id: &str, max_items: usize) -> Result<Vec<QueueEntry>> {
    let mut entries = conn
        .prepare(&format!(
            "UPDATE message_queue SET state = 'in_flight' WHERE id IN \
             (SELECT id FROM message_queue WHERE conversation_id = ?1 AND state = 'pending' \
              ORDER BY id ASC LIMIT ?2) \
             RETURNING {ENTRY_COLUMNS}"
        ))?
        .query_map(params![conversation_id, max_items as i64], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    // RETURNING order is unspecified
    entries.sort_by_key(|e| e.id);
    Ok(entries)
}

fn id_list(ids: &[i64]) -> String {
    vec!["?"; ids.len()].join(", ")
}

/// Mark claimed entries processed, then trim history. Returns the number acknowledged.
pub fn ack(conn: &mut Connection, ids: &[i64], history_size: usize) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let conversations: Vec<String> = tx
        .prepare(&format!(
            "SELECT DISTINCT conversation_id FROM message_queue WHERE id IN ({})",
            id_list(ids)
        ))?
        .query_map(params_from_iter(ids.iter()), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let acked = tx.execute(
        &format!(
            "UPDATE message_queue SET state = 'processed', last_error = NULL \
             WHERE state = 'in_flight' AND id IN ({})",
            id_list(ids)
        ),
        params_from_iter(ids.iter()),
    )?;

    for conversation in &conversations {
        trim_history(&tx, conversation, history_size)?;
    }
    tx.commit()?;
    Ok(acked)
}

/// Keep only the newest `history_size` processed/dropped entries of a conversation.
fn trim_history(conn: &Connection, conversation_id: &str, history_size: usize) -> rusqlite::Result<usize> {
    let evicted = conn.execute(
        "DELETE FROM message_queue WHERE conversation_id = ?1 AND state IN ('processed', 'dropped') \
         AND id NOT IN (SELECT id FROM message_queue WHERE conversation_id = ?1 \
                        AND state IN ('processed', 'dropped') ORDER BY id DESC LIMIT ?2)",
        params![conversation_id, history_size as i64],
    )?;
    if evicted > 0 {
        tracing::debug!(conversation = %conversation_id, evicted, "trimmed queue history");
    }
    Ok(evicted)
}

/// Return failed entries to pending, or drop those that reached `max_attempts`.
pub fn requeue_failed(
    conn: &mut Connection,
    ids: &[i64],
    error: &str,
    max_attempts: u32,
) -> Result<RequeueOutcome> {
    let tx = conn.transaction()?;
    let mut outcome = RequeueOutcome::default();

    for &id in ids {
        let row: Option<(u32, String)> = tx
            .query_row(
                "SELECT attempts, conversation_id FROM message_queue WHERE id = ?1 AND state = 'in_flight'",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((attempts, conversation)) = row else {
            continue;
        };

        let attempts = attempts + 1;
        if attempts >= max_attempts {
            tx.execute(
                "UPDATE message_queue SET state = 'dropped', attempts = ?2, last_error = ?3 WHERE id = ?1",
                params![id, attempts, error],
            )?;
            write_audit_log(
                &tx,
                "drop",
                &id.to_string(),
                Some(&serde_json::json!({
                    "conversation_id": conversation,
                    "attempts": attempts,
                    "error": error,
                })),
            )?;
            tracing::warn!(entry = id, conversation = %conversation, attempts, error, "dropped queue entry");
            outcome.dropped.push(id);
        } else {
            tx.execute(
                "UPDATE message_queue SET state = 'pending', attempts = ?2, last_error = ?3 WHERE id = ?1",
                params![id, attempts, error],
            )?;
            outcome.retried.push(id);
        }
    }

    tx.commit()?;
    Ok(outcome)
}

/// Store the bot's own reply as processed history.
pub fn record_reply(
    conn: &mut Connection,
    conversation_id: &str,
    content: &str,
    history_size: usize,
    now: DateTime<Utc>,
) -> Result<i64> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO message_queue (conversation_id, sender_id, sender_name, content, arrived_at, priority, state, is_bot) \
         VALUES (?1, ?2, '', ?3, ?4, 'batched', 'processed', 1)",
        params![conversation_id, BOT_SENDER, content, format_timestamp(now)],
    )?;
    let id = tx.last_insert_rowid();
    trim_history(&tx, conversation_id, history_size)?;
    tx.commit()?;
    Ok(id)
}

/// The newest `limit` entries that are not dropped, oldest first.
pub fn recent_history(conn: &Connection, conversation_id: &str, limit: usize) -> Result<Vec<QueueEntry>> {
    let mut entries = conn
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM message_queue \
             WHERE conversation_id = ?1 AND state <> 'dropped' \
             ORDER BY id DESC LIMIT ?2"
        ))?
        .query_map(params![conversation_id, limit as i64], entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    entries.reverse();
    Ok(entries)
}

/// When the bot last replied in a conversation.
pub fn last_reply_at(conn: &Connection, conversation_id: &str) -> Result<Option<String>> {
    let at = conn
        .query_row(
            "SELECT arrived_at FROM message_queue WHERE conversation_id = ?1 AND is_bot = 1 \
             ORDER BY id DESC LIMIT 1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(at)
}

/// Return entries left `in_flight` by an interrupted run to `pending`.
pub fn recover_in_flight(conn: &Connection) -> Result<usize> {
    let recovered = conn.execute(
        "UPDATE message_queue SET state = 'pending' WHERE state = 'in_flight'",
        [],
    )?;
    Ok(recovered)
}

/// Conversations with work waiting, oldest pending entry first.
pub fn pending_conversations(conn: &Connection) -> Result<Vec<String>> {
    let ids = conn
        .prepare(
            "SELECT conversation_id FROM message_queue WHERE state = 'pending' \
             GROUP BY conversation_id ORDER BY MIN(id)",
        )?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

pub fn queue_stats(conn: &Connection, conversation_id: Option<&str>) -> Result<QueueStats> {
    let mut stats = QueueStats::default();
    let rows = conn
        .prepare(
            "SELECT state, COUNT(*) FROM message_queue \
             WHERE ?1 IS NULL OR conversation_id = ?1 GROUP BY state",
        )?
        .query_map(params![conversation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (state, count) in rows {
        stats.total += count;
        match state.as_str() {
            "pending" => stats.pending = count,
            "in_flight" => stats.in_flight = count,
            "processed" => stats.processed = count,
            "dropped" => stats.dropped = count,
            _ => {}
        }
    }
    Ok(stats)
}
