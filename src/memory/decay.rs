//! Time-based forgetting.
//!
//! A decay pass ages every non-permanent memory, node and association by
//! `value * exp(-rate * hours)`, where hours are measured from the entity's
//! decay anchor (the later of its last access and its last decay). Because the
//! curve composes multiplicatively, running many short passes is the same as
//! running one long one, and a pass with no elapsed time changes nothing.
//!
//! After decay, entities below their floors are pruned, per-conversation
//! capacity limits are enforced, and any integrity violations are repaired.
//! Only one pass may run at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::DecayConfig;
use crate::db::Store;
use crate::error::Result;
use crate::memory::records::write_audit_log;
use crate::memory::repair::{self, RepairReport};
use crate::memory::types::{format_timestamp, hours_between};

/// Exponential decay of `value` over `elapsed_hours`.
///
/// Zero or negative elapsed time returns `value` unchanged.
pub fn decay_value(value: f64, rate_per_hour: f64, elapsed_hours: f64) -> f64 {
    if elapsed_hours <= 0.0 || rate_per_hour <= 0.0 {
        return value;
    }
    value * (-rate_per_hour * elapsed_hours).exp()
}

/// Per-hour rate that halves a value every `half_life_hours`.
pub fn rate_for_half_life(half_life_hours: f64) -> f64 {
    std::f64::consts::LN_2 / half_life_hours
}

/// Summary of one decay pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DecayReport {
    pub ran_at: String,
    pub duration_ms: u64,
    pub memories_decayed: usize,
    pub nodes_decayed: usize,
    pub associations_decayed: usize,
    pub memories_pruned: usize,
    pub nodes_pruned: usize,
    pub associations_pruned: usize,
    /// Removed because a conversation exceeded its node limit.
    pub nodes_over_capacity: usize,
    /// Removed because a conversation exceeded its memory limit.
    pub memories_over_capacity: usize,
    pub repair: RepairReport,
}

/// Runs decay passes against a [`Store`], one at a time.
#[derive(Clone)]
pub struct DecayEngine {
    store: Store,
    config: DecayConfig,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the pass finishes, even on error.
struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DecayEngine {
    pub fn new(store: Store, config: DecayConfig) -> Self {
        Self {
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run_pass(&self) -> Result<Option<DecayReport>> {
        self.run_pass_at(Utc::now()).await
    }

    /// Run one pass as of `now`. Returns `None` when another pass is active.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<Option<DecayReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("decay pass already running, skipping");
            return Ok(None);
        }
        let guard = PassGuard(self.running.clone());
        let config = self.config.clone();

        let report = self
            .store
            .run(move |graph, records| {
                let _guard = guard;
                run_pass_blocking(graph, records, &config, now)
            })
            .await?;

        tracing::info!(
            memories_decayed = report.memories_decayed,
            nodes_decayed = report.nodes_decayed,
            memories_pruned = report.memories_pruned,
            nodes_pruned = report.nodes_pruned,
            associations_pruned = report.associations_pruned,
            duration_ms = report.duration_ms,
            "decay pass complete"
        );
        Ok(Some(report))
    }
}

/// Later of two stored timestamps. Both use the fixed-precision format, so string order is time order.
fn anchor<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a >= b {
        a
    } else {
        b
    }
}

/// One full pass over both stores. Each store is updated in its own transaction.
pub fn run_pass_blocking(
    graph: &mut Connection,
    records: &mut Connection,
    config: &DecayConfig,
    now: DateTime<Utc>,
) -> Result<DecayReport> {
    let started = Instant::now();
    let mut report = DecayReport {
        ran_at: format_timestamp(now),
        repair: repair::repair(graph, records)?,
        ..Default::default()
    };

    let pruned_nodes = decay_graph(graph, config, now, &mut report)?;
    decay_records(records, config, now, &pruned_nodes, &mut report)?;

    report.duration_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// Decay and prune the graph store. Returns the ids of deleted nodes.
fn decay_graph(
    conn: &mut Connection,
    config: &DecayConfig,
    now: DateTime<Utc>,
    report: &mut DecayReport,
) -> Result<Vec<(String, String)>> {
    let ts = format_timestamp(now);
    let tx = conn.transaction()?;

    let nodes: Vec<(String, f64, String, String)> = tx
        .prepare(
            "SELECT id, activation, last_accessed, decayed_at FROM cognitive_nodes WHERE permanent = 0",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, activation, last_accessed, decayed_at) in &nodes {
        let hours = hours_between(anchor(last_accessed, decayed_at), now);
        if hours <= 0.0 {
            continue;
        }
        let decayed = decay_value(*activation, config.node_rate_per_hour, hours);
        tx.execute(
            "UPDATE cognitive_nodes SET activation = ?2, decayed_at = ?3 WHERE id = ?1",
            params![id, decayed, ts],
        )?;
        report.nodes_decayed += 1;
    }

    // Edges between two permanent nodes are as permanent as their endpoints.
    let edges: Vec<(String, String, f64, String)> = tx
        .prepare(
            "SELECT a.source_id, a.target_id, a.strength, a.decayed_at \
             FROM associations a \
             JOIN cognitive_nodes s ON s.id = a.source_id \
             JOIN cognitive_nodes t ON t.id = a.target_id \
             WHERE NOT (s.permanent = 1 AND t.permanent = 1)",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // Edges are anchored on decayed_at alone; admin edits bump updated_at only.
    for (source, target, strength, decayed_at) in &edges {
        let hours = hours_between(decayed_at, now);
        if hours <= 0.0 {
            continue;
        }
        let decayed = decay_value(*strength, config.association_rate_per_hour, hours);
        tx.execute(
            "UPDATE associations SET strength = ?3, decayed_at = ?4 WHERE source_id = ?1 AND target_id = ?2",
            params![source, target, decayed, ts],
        )?;
        report.associations_decayed += 1;
    }

    report.associations_pruned = tx.execute(
        "DELETE FROM associations WHERE strength < ?1 OR strength <= 0.0",
        params![config.association_floor],
    )?;

    let mut pruned: Vec<(String, String)> = tx
        .prepare(
            "DELETE FROM cognitive_nodes WHERE permanent = 0 AND activation < ?1 \
             AND NOT EXISTS (SELECT 1 FROM associations a \
                             WHERE (a.source_id = cognitive_nodes.id OR a.target_id = cognitive_nodes.id) \
                               AND a.strength > 0.0) \
             RETURNING id, name",
        )?
        .query_map(params![config.node_floor], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    report.nodes_pruned = pruned.len();

    let crowded: Vec<String> = tx
        .prepare(
            "SELECT scope FROM cognitive_nodes WHERE permanent = 0 \
             GROUP BY scope HAVING COUNT(*) > ?1",
        )?
        .query_map(params![config.max_nodes_per_conversation as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for scope in &crowded {
        let doomed: Vec<(String, String)> = tx
            .prepare(
                "SELECT id, name FROM cognitive_nodes WHERE scope = ?1 AND permanent = 0 \
                 ORDER BY activation DESC, last_accessed DESC, rowid ASC LIMIT -1 OFFSET ?2",
            )?
            .query_map(
                params![scope, config.max_nodes_per_conversation as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, _) in &doomed {
            tx.execute(
                "DELETE FROM associations WHERE source_id = ?1 OR target_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM cognitive_nodes WHERE id = ?1", params![id])?;
        }
        tracing::debug!(scope = %scope, removed = doomed.len(), "node capacity enforced");
        report.nodes_over_capacity += doomed.len();
        pruned.extend(doomed);
    }

    tx.commit()?;
    Ok(pruned)
}

/// Decay and prune the relational store, dropping links to nodes pruned from the graph.
fn decay_records(
    conn: &mut Connection,
    config: &DecayConfig,
    now: DateTime<Utc>,
    pruned_nodes: &[(String, String)],
    report: &mut DecayReport,
) -> Result<()> {
    let ts = format_timestamp(now);
    let tx = conn.transaction()?;

    let memories: Vec<(String, f64, String, String)> = tx
        .prepare("SELECT id, weight, last_accessed, decayed_at FROM memories WHERE permanent = 0")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, weight, last_accessed, decayed_at) in &memories {
        let hours = hours_between(anchor(last_accessed, decayed_at), now);
        if hours <= 0.0 {
            continue;
        }
        let decayed = decay_value(*weight, config.memory_rate_per_hour, hours);
        tx.execute(
            "UPDATE memories SET weight = ?2, decayed_at = ?3 WHERE id = ?1",
            params![id, decayed, ts],
        )?;
        report.memories_decayed += 1;
    }

    let faded: Vec<(String, f64)> = tx
        .prepare("SELECT id, weight FROM memories WHERE permanent = 0 AND weight < ?1")?
        .query_map(params![config.memory_floor], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (id, weight) in &faded {
        delete_memory_row(&tx, id)?;
        write_audit_log(
            &tx,
            "prune",
            id,
            Some(&serde_json::json!({"reason": "below_floor", "weight": weight})),
        )?;
    }
    report.memories_pruned = faded.len();

    let crowded: Vec<String> = tx
        .prepare(
            "SELECT conversation_id FROM memories WHERE permanent = 0 \
             GROUP BY conversation_id HAVING COUNT(*) > ?1",
        )?
        .query_map(params![config.max_memories_per_conversation as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for conversation in &crowded {
        let doomed: Vec<String> = tx
            .prepare(
                "SELECT id FROM memories WHERE conversation_id = ?1 AND permanent = 0 \
                 ORDER BY weight DESC, last_accessed DESC, rowid ASC LIMIT -1 OFFSET ?2",
            )?
            .query_map(
                params![conversation, config.max_memories_per_conversation as i64],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for id in &doomed {
            delete_memory_row(&tx, id)?;
            write_audit_log(&tx, "prune", id, Some(&serde_json::json!({"reason": "capacity"})))?;
        }
        report.memories_over_capacity += doomed.len();
    }

    for (node_id, name) in pruned_nodes {
        tx.execute("DELETE FROM memory_nodes WHERE node_id = ?1", params![node_id])?;
        write_audit_log(&tx, "prune", node_id, Some(&serde_json::json!({"node": name})))?;
    }

    write_audit_log(&tx, "decay", "pass", Some(&serde_json::to_value(&*report)?))?;
    tx.commit()?;
    Ok(())
}

fn delete_memory_row(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM memory_nodes WHERE memory_id = ?1", params![id])?;
    conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::memory::graph;
    use crate::memory::records::{self, NewMemory};
    use crate::memory::types::Scope;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn zero_elapsed_is_identity() {
        assert_eq!(decay_value(0.7, 0.5, 0.0), 0.7);
        assert_eq!(decay_value(0.7, 0.0, 100.0), 0.7);
    }

    #[test]
    fn decay_is_monotonic_and_composes() {
        let rate = 0.1;
        let mut previous = 1.0;
        for h in 1..50 {
            let v = decay_value(1.0, rate, h as f64);
            assert!(v <= previous);
            previous = v;
        }
        let split = decay_value(decay_value(0.8, rate, 3.0), rate, 4.0);
        let whole = decay_value(0.8, rate, 7.0);
        assert!((split - whole).abs() < 1e-12);
    }

    #[test]
    fn half_life_rate_halves() {
        let rate = rate_for_half_life(24.0);
        assert!((decay_value(1.0, rate, 24.0) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn concurrent_pass_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        let engine = DecayEngine::new(store, DecayConfig::default());
        engine.running.store(true, Ordering::Release);
        assert!(engine.run_pass_at(t0()).await.unwrap().is_none());

        engine.running.store(false, Ordering::Release);
        assert!(engine.run_pass_at(t0()).await.unwrap().is_some());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn repeated_pass_at_same_instant_changes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let memory = {
            let mut conn = store.records().unwrap();
            records::create_memory(
                &mut conn,
                &NewMemory {
                    conversation_id: "g1".into(),
                    content: "likes cats".into(),
                    importance: 0.9,
                    node_ids: vec![],
                    permanent: false,
                },
                t0(),
            )
            .unwrap()
        };

        let engine = DecayEngine::new(store.clone(), DecayConfig::default());
        let later = t0() + Duration::hours(10);
        engine.run_pass_at(later).await.unwrap().unwrap();
        let once = records::get_memory(&store.records().unwrap(), &memory.id).unwrap();

        let report = engine.run_pass_at(later).await.unwrap().unwrap();
        let twice = records::get_memory(&store.records().unwrap(), &memory.id).unwrap();

        assert_eq!(report.memories_decayed, 0);
        assert_eq!(once.weight, twice.weight);
        assert!(once.weight < 0.9);
    }

    #[tokio::test]
    async fn faded_nodes_pruned_unless_connected() {
        let store = Store::open_in_memory().unwrap();
        let node_config = NodeConfig::default();
        let (lonely, linked_a, linked_b) = {
            let conn = store.graph().unwrap();
            let g1 = Scope::conversation("g1");
            let lonely = graph::upsert_node(&conn, &g1, "lonely", &node_config, t0()).unwrap();
            let a = graph::upsert_node(&conn, &g1, "a", &node_config, t0()).unwrap();
            let b = graph::upsert_node(&conn, &g1, "b", &node_config, t0()).unwrap();
            graph::upsert_association(&conn, &a.id, &b.id, 1.0, &node_config, t0()).unwrap();
            (lonely, a, b)
        };

        // Nodes fall below the floor, the edge stays above its own.
        let config = DecayConfig {
            node_rate_per_hour: 1.0,
            association_rate_per_hour: 0.0,
            ..Default::default()
        };
        let engine = DecayEngine::new(store.clone(), config);
        let report = engine.run_pass_at(t0() + Duration::hours(10)).await.unwrap().unwrap();

        assert_eq!(report.nodes_pruned, 1);
        let conn = store.graph().unwrap();
        assert!(graph::get_node(&conn, &lonely.id).unwrap_err().is_not_found());
        assert!(graph::get_node(&conn, &linked_a.id).is_ok());
        assert!(graph::get_node(&conn, &linked_b.id).is_ok());
    }

    #[tokio::test]
    async fn capacity_keeps_strongest_memories() {
        let store = Store::open_in_memory().unwrap();
        {
            let mut conn = store.records().unwrap();
            for (i, importance) in [0.2, 0.9, 0.5, 0.7].into_iter().enumerate() {
                records::create_memory(
                    &mut conn,
                    &NewMemory {
                        conversation_id: "g1".into(),
                        content: format!("m{i}"),
                        importance,
                        node_ids: vec![],
                        permanent: false,
                    },
                    t0(),
                )
                .unwrap();
            }
        }

        let config = DecayConfig {
            max_memories_per_conversation: 2,
            ..Default::default()
        };
        let report = DecayEngine::new(store.clone(), config)
            .run_pass_at(t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.memories_over_capacity, 2);

        let left = records::list_by_conversation(&store.records().unwrap(), "g1", &Default::default()).unwrap();
        let mut contents: Vec<_> = left.into_iter().map(|m| m.content).collect();
        contents.sort();
        assert_eq!(contents, vec!["m1", "m3"]);
    }
}
