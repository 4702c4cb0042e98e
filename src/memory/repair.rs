//! Self-healing for integrity violations found after the fact.
//!
//! The unique `(scope, name_key)` index and foreign keys prevent duplicates and
//! dangling edges during normal operation. Graphs imported from elsewhere, or
//! written with foreign keys disabled, can still contain them. These passes run
//! when the graph store opens and at the start of every decay pass.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::memory::records::write_audit_log;

/// What a repair pass fixed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RepairReport {
    /// Duplicate nodes folded into an older node with the same name.
    pub merged_nodes: usize,
    /// Memory links moved from a merged node to the node that absorbed it.
    pub relinked: usize,
    /// Edges whose source or target no longer exists.
    pub dangling_associations: usize,
    /// Memory links pointing at nodes that no longer exist.
    pub orphan_links: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.merged_nodes == 0 && self.relinked == 0 && self.dangling_associations == 0 && self.orphan_links == 0
    }
}

/// Fold nodes sharing `(scope, name_key)` into the oldest one. Returns the number removed.
///
/// The survivor takes the highest activation and any permanence in the group.
/// Edges are re-pointed to it, keeping the stronger strength when both exist.
/// Each merge is noted in `node_merges` for [`relink_merged_nodes`].
pub fn merge_duplicate_nodes(conn: &Connection) -> rusqlite::Result<usize> {
    let groups: Vec<(String, String)> = conn
        .prepare(
            "SELECT scope, name_key FROM cognitive_nodes \
             GROUP BY scope, name_key HAVING COUNT(*) > 1",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if groups.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    let mut removed = 0;

    for (scope, key) in &groups {
        let ids: Vec<String> = tx
            .prepare(
                "SELECT id FROM cognitive_nodes WHERE scope = ?1 AND name_key = ?2 \
                 ORDER BY created_at ASC, rowid ASC",
            )?
            .query_map(params![scope, key], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let Some((keeper, duplicates)) = ids.split_first() else {
            continue;
        };

        for dup in duplicates {
            tx.execute(
                "INSERT INTO associations (source_id, target_id, strength, created_at, updated_at, decayed_at) \
                 SELECT ?1, target_id, strength, created_at, updated_at, decayed_at \
                 FROM associations WHERE source_id = ?2 AND target_id <> ?1 \
                 ON CONFLICT(source_id, target_id) DO UPDATE SET strength = MAX(strength, excluded.strength)",
                params![keeper, dup],
            )?;
            tx.execute(
                "INSERT INTO associations (source_id, target_id, strength, created_at, updated_at, decayed_at) \
                 SELECT source_id, ?1, strength, created_at, updated_at, decayed_at \
                 FROM associations WHERE target_id = ?2 AND source_id <> ?1 \
                 ON CONFLICT(source_id, target_id) DO UPDATE SET strength = MAX(strength, excluded.strength)",
                params![keeper, dup],
            )?;
            tx.execute(
                "UPDATE cognitive_nodes SET \
                   activation = MAX(activation, (SELECT activation FROM cognitive_nodes WHERE id = ?2)), \
                   permanent = MAX(permanent, (SELECT permanent FROM cognitive_nodes WHERE id = ?2)), \
                   last_accessed = MAX(last_accessed, (SELECT last_accessed FROM cognitive_nodes WHERE id = ?2)) \
                 WHERE id = ?1",
                params![keeper, dup],
            )?;
            tx.execute(
                "DELETE FROM associations WHERE source_id = ?1 OR target_id = ?1",
                params![dup],
            )?;
            tx.execute("DELETE FROM cognitive_nodes WHERE id = ?1", params![dup])?;
            tx.execute(
                "INSERT OR REPLACE INTO node_merges (merged_id, keeper_id) VALUES (?1, ?2)",
                params![dup, keeper],
            )?;
            tracing::warn!(scope = %scope, name = %key, kept = %keeper, merged = %dup, "merged duplicate node");
            removed += 1;
        }
    }

    tx.commit()?;
    Ok(removed)
}

/// Delete edges whose endpoints are missing. Returns the number deleted.
pub fn drop_dangling_associations(conn: &Connection) -> rusqlite::Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM associations WHERE \
           source_id NOT IN (SELECT id FROM cognitive_nodes) OR \
           target_id NOT IN (SELECT id FROM cognitive_nodes)",
        [],
    )?;
    if deleted > 0 {
        tracing::warn!(deleted, "dropped dangling associations");
    }
    Ok(deleted)
}

/// Move memory links off merged nodes onto their keepers. Returns the number moved.
///
/// A keeper that was itself merged later is followed to the final survivor.
/// Links that would duplicate an existing one are left for [`drop_orphan_links`].
pub fn relink_merged_nodes(graph: &Connection, records: &Connection) -> Result<usize> {
    let merges: HashMap<String, String> = graph
        .prepare("SELECT merged_id, keeper_id FROM node_merges")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    if merges.is_empty() {
        return Ok(0);
    }

    let mut moved = 0;
    for merged in merges.keys() {
        let mut keeper = &merges[merged];
        for _ in 0..merges.len() {
            match merges.get(keeper) {
                Some(next) => keeper = next,
                None => break,
            }
        }
        moved += records.execute(
            "UPDATE OR IGNORE memory_nodes SET node_id = ?2 WHERE node_id = ?1",
            params![merged, keeper],
        )?;
    }

    if moved > 0 {
        tracing::info!(moved, "moved memory links onto merged nodes");
    }
    Ok(moved)
}

/// Delete memory links whose node is gone from the graph store.
///
/// The two stores are separate databases, so this compares id sets in memory.
pub fn drop_orphan_links(graph: &Connection, records: &Connection) -> Result<usize> {
    let linked: Vec<String> = records
        .prepare("SELECT DISTINCT node_id FROM memory_nodes")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if linked.is_empty() {
        return Ok(0);
    }

    let existing: HashSet<String> = graph
        .prepare("SELECT id FROM cognitive_nodes")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;

    let mut removed = 0;
    for node_id in linked.iter().filter(|id| !existing.contains(*id)) {
        removed += records.execute("DELETE FROM memory_nodes WHERE node_id = ?1", params![node_id])?;
    }

    if removed > 0 {
        tracing::warn!(removed, "dropped memory links to missing nodes");
    }
    Ok(removed)
}

/// Run every repair and audit what was fixed.
pub fn repair(graph: &Connection, records: &Connection) -> Result<RepairReport> {
    let report = RepairReport {
        merged_nodes: merge_duplicate_nodes(graph)?,
        relinked: relink_merged_nodes(graph, records)?,
        dangling_associations: drop_dangling_associations(graph)?,
        orphan_links: drop_orphan_links(graph, records)?,
    };

    if !report.is_clean() {
        write_audit_log(
            records,
            "repair",
            "graph",
            Some(&serde_json::to_value(&report)?),
        )?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn raw_graph() -> Connection {
        // No unique index and no foreign keys, like an imported file.
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cognitive_nodes (
                id TEXT PRIMARY KEY, scope TEXT NOT NULL DEFAULT '', name TEXT NOT NULL,
                name_key TEXT NOT NULL, activation REAL NOT NULL, permanent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL, last_accessed TEXT NOT NULL, decayed_at TEXT NOT NULL);
             CREATE TABLE associations (
                source_id TEXT NOT NULL, target_id TEXT NOT NULL, strength REAL NOT NULL,
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL, decayed_at TEXT NOT NULL,
                PRIMARY KEY (source_id, target_id));
             CREATE TABLE node_merges (merged_id TEXT PRIMARY KEY, keeper_id TEXT NOT NULL);",
        )
        .unwrap();
        conn
    }

    fn insert_node(conn: &Connection, id: &str, name: &str, activation: f64, created: &str) {
        conn.execute(
            "INSERT INTO cognitive_nodes (id, scope, name, name_key, activation, created_at, last_accessed, decayed_at) \
             VALUES (?1, 'g1', ?2, lower(?2), ?3, ?4, ?4, ?4)",
            params![id, name, activation, created],
        )
        .unwrap();
    }

    fn insert_edge(conn: &Connection, s: &str, t: &str, strength: f64) {
        conn.execute(
            "INSERT INTO associations (source_id, target_id, strength, created_at, updated_at, decayed_at) \
             VALUES (?1, ?2, ?3, 't', 't', 't')",
            params![s, t, strength],
        )
        .unwrap();
    }

    #[test]
    fn duplicates_merge_into_oldest() {
        let conn = raw_graph();
        insert_node(&conn, "a", "Cats", 1.0, "2024-01-01T00:00:00.000000Z");
        insert_node(&conn, "b", "cats", 2.5, "2024-01-02T00:00:00.000000Z");
        insert_node(&conn, "d", "dogs", 1.0, "2024-01-01T00:00:00.000000Z");
        insert_edge(&conn, "b", "d", 0.4);
        insert_edge(&conn, "a", "d", 0.2);
        insert_edge(&conn, "d", "b", 0.3);

        assert_eq!(merge_duplicate_nodes(&conn).unwrap(), 1);

        let (count, activation): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(activation) FROM cognitive_nodes WHERE name_key = 'cats'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(activation, 2.5);

        let out: f64 = conn
            .query_row("SELECT strength FROM associations WHERE source_id='a' AND target_id='d'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(out, 0.4);
        let incoming: f64 = conn
            .query_row("SELECT strength FROM associations WHERE source_id='d' AND target_id='a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(incoming, 0.3);
        let leftover: i64 = conn
            .query_row("SELECT COUNT(*) FROM associations WHERE source_id='b' OR target_id='b'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn merging_never_creates_self_edges() {
        let conn = raw_graph();
        insert_node(&conn, "a", "cats", 1.0, "2024-01-01T00:00:00.000000Z");
        insert_node(&conn, "b", "CATS", 1.0, "2024-01-02T00:00:00.000000Z");
        insert_edge(&conn, "a", "b", 0.5);
        insert_edge(&conn, "b", "a", 0.5);

        merge_duplicate_nodes(&conn).unwrap();

        let edges: i64 = conn.query_row("SELECT COUNT(*) FROM associations", [], |r| r.get(0)).unwrap();
        assert_eq!(edges, 0);
    }

    #[test]
    fn dangling_edges_dropped() {
        let conn = raw_graph();
        insert_node(&conn, "a", "cats", 1.0, "t");
        insert_edge(&conn, "a", "ghost", 0.5);
        assert_eq!(drop_dangling_associations(&conn).unwrap(), 1);
        assert_eq!(drop_dangling_associations(&conn).unwrap(), 0);
    }

    #[test]
    fn orphan_links_dropped_and_audited() {
        let graph = raw_graph();
        insert_node(&graph, "a", "cats", 1.0, "t");

        let records = Connection::open_in_memory().unwrap();
        schema::init_records_schema(&records).unwrap();
        records
            .execute(
                "INSERT INTO memories (id, conversation_id, content, weight, created_at, last_accessed, decayed_at) \
                 VALUES ('m1', 'g1', 'x', 0.5, 't', 't', 't')",
                [],
            )
            .unwrap();
        records
            .execute("INSERT INTO memory_nodes (memory_id, node_id) VALUES ('m1', 'a'), ('m1', 'gone')", [])
            .unwrap();

        let report = repair(&graph, &records).unwrap();
        assert_eq!(report.orphan_links, 1);
        assert!(!report.is_clean());

        let audits: i64 = records
            .query_row("SELECT COUNT(*) FROM memory_log WHERE operation = 'repair'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(audits, 1);
    }

    fn records_with_memory(links: &[&str]) -> Connection {
        let records = Connection::open_in_memory().unwrap();
        schema::init_records_schema(&records).unwrap();
        records
            .execute(
                "INSERT INTO memories (id, conversation_id, content, weight, created_at, last_accessed, decayed_at) \
                 VALUES ('m1', 'g1', 'x', 0.5, 't', 't', 't')",
                [],
            )
            .unwrap();
        for node in links {
            records
                .execute("INSERT INTO memory_nodes (memory_id, node_id) VALUES ('m1', ?1)", params![node])
                .unwrap();
        }
        records
    }

    fn links(records: &Connection) -> Vec<String> {
        records
            .prepare("SELECT node_id FROM memory_nodes WHERE memory_id = 'm1' ORDER BY node_id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn memory_links_follow_merged_node() {
        let graph = raw_graph();
        insert_node(&graph, "a", "Cats", 1.0, "2024-01-01T00:00:00.000000Z");
        insert_node(&graph, "b", "cats", 2.0, "2024-01-02T00:00:00.000000Z");
        let records = records_with_memory(&["b"]);

        let report = repair(&graph, &records).unwrap();
        assert_eq!(report.merged_nodes, 1);
        assert_eq!(report.relinked, 1);
        assert_eq!(report.orphan_links, 0);
        assert_eq!(links(&records), vec!["a"]);
    }

    #[test]
    fn merge_at_open_is_relinked_later() {
        let graph = raw_graph();
        insert_node(&graph, "a", "cats", 1.0, "2024-01-01T00:00:00.000000Z");
        insert_node(&graph, "b", "CATS", 1.0, "2024-01-02T00:00:00.000000Z");
        // Merged while only the graph store was open.
        merge_duplicate_nodes(&graph).unwrap();

        let records = records_with_memory(&["a", "b"]);
        let report = repair(&graph, &records).unwrap();
        assert_eq!(report.merged_nodes, 0);
        assert_eq!(report.orphan_links, 1);
        assert_eq!(links(&records), vec!["a"]);
    }

    #[test]
    fn chained_merges_resolve_to_final_keeper() {
        let graph = raw_graph();
        insert_node(&graph, "c", "cats", 1.0, "t");
        graph
            .execute("INSERT INTO node_merges (merged_id, keeper_id) VALUES ('a', 'b'), ('b', 'c')", [])
            .unwrap();
        let records = records_with_memory(&["a"]);

        assert_eq!(relink_merged_nodes(&graph, &records).unwrap(), 1);
        assert_eq!(links(&records), vec!["c"]);
    }
}
