use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

use crate::error::Result;
use crate::memory::queue::{self, QueueStats};

/// Response from memory_stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub nodes: u64,
    pub permanent_nodes: u64,
    pub associations: u64,
    pub memories: u64,
    pub permanent_memories: u64,
    pub mean_activation: f64,
    pub mean_weight: f64,
    pub queue: QueueStats,
    pub records_db_bytes: u64,
    pub graph_db_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute statistics over both stores.
///
/// If `conversation` is provided, counts are filtered to it (graph counts use it as the scope).
/// `paths` is (records, graph) for file sizes; pass None for in-memory stores.
pub fn memory_stats(
    graph: &Connection,
    records: &Connection,
    conversation: Option<&str>,
    paths: Option<(&Path, &Path)>,
) -> Result<StatsResponse> {
    let (nodes, permanent_nodes, mean_activation): (i64, i64, Option<f64>) = graph.query_row(
        "SELECT COUNT(*), COALESCE(SUM(permanent), 0), AVG(activation) FROM cognitive_nodes \
         WHERE ?1 IS NULL OR scope = ?1",
        params![conversation],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let associations: i64 = graph.query_row(
        "SELECT COUNT(*) FROM associations a JOIN cognitive_nodes n ON n.id = a.source_id \
         WHERE ?1 IS NULL OR n.scope = ?1",
        params![conversation],
        |row| row.get(0),
    )?;

    let (memories, permanent_memories, mean_weight, oldest, newest): (
        i64,
        i64,
        Option<f64>,
        Option<String>,
        Option<String>,
    ) = records.query_row(
        "SELECT COUNT(*), COALESCE(SUM(permanent), 0), AVG(weight), MIN(created_at), MAX(created_at) \
         FROM memories WHERE ?1 IS NULL OR conversation_id = ?1",
        params![conversation],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;

    let file_size = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    let (records_db_bytes, graph_db_bytes) = paths
        .map(|(r, g)| (file_size(r), file_size(g)))
        .unwrap_or((0, 0));

    Ok(StatsResponse {
        nodes: nodes as u64,
        permanent_nodes: permanent_nodes as u64,
        associations: associations as u64,
        memories: memories as u64,
        permanent_memories: permanent_memories as u64,
        mean_activation: mean_activation.unwrap_or(0.0),
        mean_weight: mean_weight.unwrap_or(0.0),
        queue: queue::queue_stats(records, conversation)?,
        records_db_bytes,
        graph_db_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}
