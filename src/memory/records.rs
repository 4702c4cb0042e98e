//! Long-term memory records: create, reinforce, list, admin edits, audit log.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{or_not_found, EntityKind, PersonaError, Result};
use crate::memory::types::{format_timestamp, MemoryRecord};

const MEMORY_COLUMNS: &str =
    "id, conversation_id, content, weight, permanent, created_at, last_accessed, decayed_at, rowid";

/// Input for [`create_memory`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub conversation_id: String,
    pub content: String,
    /// Initial weight, in `[0.0, 1.0]`.
    pub importance: f64,
    pub node_ids: Vec<String>,
    pub permanent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Time-bounded listing parameters. Both bounds are inclusive.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            limit: 50,
            order: SortOrder::NewestFirst,
        }
    }
}

/// Administrative edit. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub weight: Option<f64>,
    pub permanent: Option<bool>,
}

fn memory_from_row(row: &Row) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        weight: row.get(3)?,
        permanent: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        last_accessed: row.get(6)?,
        decayed_at: row.get(7)?,
        node_ids: Vec::new(),
        seq: row.get(8)?,
    })
}

fn load_links(conn: &Connection, memory: &mut MemoryRecord) -> rusqlite::Result<()> {
    memory.node_ids = conn
        .prepare_cached("SELECT node_id FROM memory_nodes WHERE memory_id = ?1 ORDER BY node_id")?
        .query_map(params![memory.id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

fn attach_links(conn: &Connection, memories: &mut [MemoryRecord]) -> rusqlite::Result<()> {
    for memory in memories.iter_mut() {
        load_links(conn, memory)?;
    }
    Ok(())
}

fn validate_weight(weight: f64, field: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&weight) {
        return Err(PersonaError::InvalidInput(format!(
            "{field} must be in [0, 1], got {weight}"
        )));
    }
    Ok(())
}

impl NewMemory {
    /// Check content and importance without touching either store.
    pub fn validate(&self) -> Result<()> {
        validate_weight(self.importance, "importance")?;
        if self.content.trim().is_empty() {
            return Err(PersonaError::InvalidInput("memory content is empty".into()));
        }
        Ok(())
    }
}

/// Persist a memory and link it to its nodes.
pub fn create_memory(conn: &mut Connection, new: &NewMemory, now: DateTime<Utc>) -> Result<MemoryRecord> {
    new.validate()?;

    let id = uuid::Uuid::now_v7().to_string();
    let ts = format_timestamp(now);

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO memories (id, conversation_id, content, weight, permanent, created_at, last_accessed, decayed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
        params![
            id,
            new.conversation_id,
            new.content.trim(),
            new.importance,
            new.permanent,
            ts
        ],
    )?;
    for node_id in &new.node_ids {
        tx.execute(
            "INSERT OR IGNORE INTO memory_nodes (memory_id, node_id) VALUES (?1, ?2)",
            params![id, node_id],
        )?;
    }
    write_audit_log(
        &tx,
        "create",
        &id,
        Some(&serde_json::json!({
            "conversation_id": new.conversation_id,
            "importance": new.importance,
            "nodes": new.node_ids.len(),
        })),
    )?;
    tx.commit()?;

    get_memory(conn, &id)
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<MemoryRecord> {
    let mut memory = conn
        .query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            memory_from_row,
        )
        .map_err(|e| or_not_found(e, EntityKind::Memory, id))?;
    load_links(conn, &mut memory)?;
    Ok(memory)
}

/// Boost a memory's weight (capped at 1.0) and restart its decay clock.
pub fn reinforce(conn: &Connection, id: &str, boost: f64, now: DateTime<Utc>) -> Result<MemoryRecord> {
    let ts = format_timestamp(now);
    let updated = conn.execute(
        "UPDATE memories SET weight = MIN(1.0, weight + ?2), last_accessed = ?3, decayed_at = ?3 \
         WHERE id = ?1",
        params![id, boost.max(0.0), ts],
    )?;
    if updated == 0 {
        return Err(PersonaError::not_found(EntityKind::Memory, id));
    }
    write_audit_log(conn, "reinforce", id, Some(&serde_json::json!({"boost": boost})))?;
    get_memory(conn, id)
}

/// List a conversation's memories inside an inclusive time window.
pub fn list_by_conversation(
    conn: &Connection,
    conversation_id: &str,
    query: &ListQuery,
) -> Result<Vec<MemoryRecord>> {
    let order = match query.order {
        SortOrder::NewestFirst => "DESC",
        SortOrder::OldestFirst => "ASC",
    };
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories \
         WHERE conversation_id = ?1 \
           AND (?2 IS NULL OR created_at >= ?2) \
           AND (?3 IS NULL OR created_at <= ?3) \
         ORDER BY created_at {order}, rowid {order} \
         LIMIT ?4"
    );

    let mut memories = conn
        .prepare(&sql)?
        .query_map(
            params![
                conversation_id,
                query.since.map(format_timestamp),
                query.until.map(format_timestamp),
                query.limit as i64
            ],
            memory_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    attach_links(conn, &mut memories)?;
    Ok(memories)
}

/// Every memory belonging to any of the given conversations.
pub fn memories_in_conversations(conn: &Connection, conversation_ids: &[&str]) -> Result<Vec<MemoryRecord>> {
    if conversation_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; conversation_ids.len()].join(", ");
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE conversation_id IN ({placeholders}) ORDER BY rowid"
    );
    let mut memories = conn
        .prepare(&sql)?
        .query_map(params_from_iter(conversation_ids.iter()), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    attach_links(conn, &mut memories)?;
    Ok(memories)
}

/// Memories linked to any of the given nodes, each returned once.
pub fn memories_for_nodes(conn: &Connection, node_ids: &[String]) -> Result<Vec<MemoryRecord>> {
    if node_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; node_ids.len()].join(", ");
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN \
         (SELECT DISTINCT memory_id FROM memory_nodes WHERE node_id IN ({placeholders})) \
         ORDER BY rowid"
    );
    let mut memories = conn
        .prepare(&sql)?
        .query_map(params_from_iter(node_ids.iter()), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    attach_links(conn, &mut memories)?;
    Ok(memories)
}

/// Administrative edit. Leaves the decay clock alone.
pub fn update_memory(conn: &Connection, id: &str, update: &MemoryUpdate) -> Result<MemoryRecord> {
    let current = get_memory(conn, id)?;

    if let Some(weight) = update.weight {
        validate_weight(weight, "weight")?;
    }
    if let Some(content) = &update.content {
        if content.trim().is_empty() {
            return Err(PersonaError::InvalidInput("memory content is empty".into()));
        }
    }

    conn.execute(
        "UPDATE memories SET content = ?2, weight = ?3, permanent = ?4 WHERE id = ?1",
        params![
            id,
            update.content.as_deref().map(str::trim).unwrap_or(&current.content),
            update.weight.unwrap_or(current.weight),
            update.permanent.unwrap_or(current.permanent),
        ],
    )?;
    write_audit_log(
        conn,
        "admin",
        id,
        Some(&serde_json::json!({
            "content_changed": update.content.is_some(),
            "weight": update.weight,
            "permanent": update.permanent,
        })),
    )?;
    get_memory(conn, id)
}

pub fn delete_memory(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM memory_nodes WHERE memory_id = ?1", params![id])?;
    let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(PersonaError::not_found(EntityKind::Memory, id));
    }
    write_audit_log(conn, "delete", id, None)?;
    Ok(())
}

/// Delete a conversation's memories created inside an inclusive window. Returns the count.
pub fn delete_by_time_range(
    conn: &mut Connection,
    conversation_id: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<usize> {
    if since > until {
        return Err(PersonaError::InvalidInput(
            "time range start is after its end".into(),
        ));
    }
    let (since, until) = (format_timestamp(since), format_timestamp(until));

    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM memory_nodes WHERE memory_id IN \
         (SELECT id FROM memories WHERE conversation_id = ?1 AND created_at >= ?2 AND created_at <= ?3)",
        params![conversation_id, since, until],
    )?;
    let deleted = tx.execute(
        "DELETE FROM memories WHERE conversation_id = ?1 AND created_at >= ?2 AND created_at <= ?3",
        params![conversation_id, since, until],
    )?;
    if deleted > 0 {
        write_audit_log(
            &tx,
            "delete",
            conversation_id,
            Some(&serde_json::json!({"since": since, "until": until, "deleted": deleted})),
        )?;
    }
    tx.commit()?;
    Ok(deleted)
}

/// Audit an administrative change made outside this store, such as a graph edit.
pub fn record_admin_action(conn: &Connection, target_id: &str, details: &serde_json::Value) -> Result<()> {
    write_audit_log(conn, "admin", target_id, Some(details))?;
    Ok(())
}

/// Record a lifecycle mutation in `memory_log`.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    target_id: &str,
    details: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let now = format_timestamp(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, target_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, target_id, details_json, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_memory_database, StoreKind};
    use chrono::{Duration, TimeZone};

    fn test_db() -> Connection {
        open_memory_database(StoreKind::Records).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn new_memory(content: &str, importance: f64) -> NewMemory {
        NewMemory {
            conversation_id: "g1".into(),
            content: content.into(),
            importance,
            node_ids: vec!["n1".into(), "n2".into()],
            permanent: false,
        }
    }

    #[test]
    fn create_links_nodes_and_audits() {
        let mut conn = test_db();
        let memory = create_memory(&mut conn, &new_memory("likes cats", 0.6), t0()).unwrap();
        assert_eq!(memory.weight, 0.6);
        assert_eq!(memory.node_ids, vec!["n1", "n2"]);
        assert_eq!(memory.created_at, memory.decayed_at);

        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM memory_log")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ops, vec!["create"]);
    }

    #[test]
    fn importance_out_of_range_rejected() {
        let mut conn = test_db();
        let err = create_memory(&mut conn, &new_memory("x", 1.5), t0()).unwrap_err();
        assert!(matches!(err, PersonaError::InvalidInput(_)));
        let err = create_memory(&mut conn, &new_memory("  ", 0.5), t0()).unwrap_err();
        assert!(matches!(err, PersonaError::InvalidInput(_)));
    }

    #[test]
    fn reinforce_caps_weight_and_resets_clock() {
        let mut conn = test_db();
        let memory = create_memory(&mut conn, &new_memory("x", 0.95), t0()).unwrap();
        let later = t0() + Duration::hours(5);
        let reinforced = reinforce(&conn, &memory.id, 0.1, later).unwrap();
        assert_eq!(reinforced.weight, 1.0);
        assert_eq!(reinforced.last_accessed, format_timestamp(later));
        assert_eq!(reinforced.decayed_at, format_timestamp(later));
    }

    #[test]
    fn reinforce_missing_is_not_found() {
        let conn = test_db();
        let err = reinforce(&conn, "nope", 0.1, t0()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_is_time_bounded_and_newest_first() {
        let mut conn = test_db();
        for i in 0..5 {
            create_memory(&mut conn, &new_memory(&format!("m{i}"), 0.5), t0() + Duration::hours(i)).unwrap();
        }

        let all = list_by_conversation(&conn, "g1", &ListQuery::default()).unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2", "m1", "m0"]);

        let window = ListQuery {
            since: Some(t0() + Duration::hours(1)),
            until: Some(t0() + Duration::hours(3)),
            order: SortOrder::OldestFirst,
            ..Default::default()
        };
        let bounded = list_by_conversation(&conn, "g1", &window).unwrap();
        let contents: Vec<_> = bounded.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);

        assert!(list_by_conversation(&conn, "other", &ListQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn admin_update_keeps_decay_clock() {
        let mut conn = test_db();
        let memory = create_memory(&mut conn, &new_memory("x", 0.5), t0()).unwrap();
        let updated = update_memory(
            &conn,
            &memory.id,
            &MemoryUpdate {
                weight: Some(0.2),
                permanent: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.weight, 0.2);
        assert!(updated.permanent);
        assert_eq!(updated.content, "x");
        assert_eq!(updated.decayed_at, memory.decayed_at);
        assert_eq!(updated.last_accessed, memory.last_accessed);
    }

    #[test]
    fn delete_reports_missing() {
        let mut conn = test_db();
        let memory = create_memory(&mut conn, &new_memory("x", 0.5), t0()).unwrap();
        delete_memory(&conn, &memory.id).unwrap();
        assert!(get_memory(&conn, &memory.id).unwrap_err().is_not_found());
        assert!(delete_memory(&conn, &memory.id).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_by_time_range_only_touches_window() {
        let mut conn = test_db();
        for i in 0..4 {
            create_memory(&mut conn, &new_memory(&format!("m{i}"), 0.5), t0() + Duration::hours(i)).unwrap();
        }
        let deleted = delete_by_time_range(&mut conn, "g1", t0(), t0() + Duration::hours(1)).unwrap();
        assert_eq!(deleted, 2);
        let left = list_by_conversation(&conn, "g1", &ListQuery::default()).unwrap();
        assert_eq!(left.len(), 2);
        let links: i64 = conn.query_row("SELECT COUNT(*) FROM memory_nodes", [], |r| r.get(0)).unwrap();
        assert_eq!(links, 4);
    }

    #[test]
    fn memories_for_nodes_deduplicates() {
        let mut conn = test_db();
        create_memory(&mut conn, &new_memory("both", 0.5), t0()).unwrap();
        let found = memories_for_nodes(&conn, &["n1".into(), "n2".into()]).unwrap();
        assert_eq!(found.len(), 1);
        assert!(memories_for_nodes(&conn, &[]).unwrap().is_empty());
    }

    #[test]
    fn rejected_input_is_caught_before_any_write() {
        let mut conn = test_db();
        assert!(new_memory("   ", 0.5).validate().is_err());
        assert!(new_memory("likes cats", 1.2).validate().is_err());
        assert!(new_memory("likes cats", f64::NAN).validate().is_err());
        assert!(new_memory("likes cats", 1.0).validate().is_ok());

        assert!(create_memory(&mut conn, &new_memory("likes cats", 1.2), t0()).is_err());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
