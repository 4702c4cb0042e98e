//! Ranked recall over the node graph and memory records.
//!
//! Keyword retrieval scores every candidate as
//! `importance_weight * salience + recency_weight * recency + match_weight * match`.
//! Context retrieval seeds from nodes named in recent messages, follows one
//! hop of associations, and ranks by activation times edge strength.
//!
//! Equal scores are ordered by most recent access, then by creation order,
//! so the same snapshot always yields the same list. With
//! [`AccessMode::Reinforce`] each returned memory is reinforced after ranking.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::memory::graph;
use crate::memory::records;
use crate::memory::types::{hours_between, name_key, CognitiveNode, MemoryRecord, Scope};

const EXACT_MATCH: f64 = 1.0;
const PREFIX_MATCH: f64 = 0.8;
const SUBSTRING_MATCH: f64 = 0.6;
const CONTENT_MATCH: f64 = 0.7;
const LINKED_MATCH: f64 = 0.5;
const HOP_MATCH: f64 = 0.3;

/// Whether retrieval counts as use of the returned memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Reinforce every returned memory.
    Reinforce,
    /// Never write. For admin browsing and CLI search.
    ReadOnly,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitTarget {
    Node(CognitiveNode),
    Memory(MemoryRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub target: HitTarget,
    pub score: f64,
    /// How well the keyword matched, before weighting.
    pub match_strength: f64,
}

impl RetrievalHit {
    fn last_accessed(&self) -> &str {
        match &self.target {
            HitTarget::Node(n) => &n.last_accessed,
            HitTarget::Memory(m) => &m.last_accessed,
        }
    }

    fn created_at(&self) -> &str {
        match &self.target {
            HitTarget::Node(n) => &n.created_at,
            HitTarget::Memory(m) => &m.created_at,
        }
    }

    /// Nodes sort before memories when everything else ties.
    fn kind_rank(&self) -> u8 {
        match &self.target {
            HitTarget::Node(_) => 0,
            HitTarget::Memory(_) => 1,
        }
    }

    fn seq(&self) -> i64 {
        match &self.target {
            HitTarget::Node(n) => n.seq,
            HitTarget::Memory(m) => m.seq,
        }
    }

    pub fn as_node(&self) -> Option<&CognitiveNode> {
        match &self.target {
            HitTarget::Node(n) => Some(n),
            HitTarget::Memory(_) => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryRecord> {
        match &self.target {
            HitTarget::Memory(m) => Some(m),
            HitTarget::Node(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredNode {
    pub node: CognitiveNode,
    pub score: f64,
    /// True if the node was named in the messages, false if reached over an edge.
    pub seed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: MemoryRecord,
    pub score: f64,
}

/// What the bot "has in mind" for a conversation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextRecall {
    pub nodes: Vec<ScoredNode>,
    pub memories: Vec<ScoredMemory>,
}

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn compare_hits(a: &RetrievalHit, b: &RetrievalHit) -> Ordering {
    desc(a.score, b.score)
        .then_with(|| b.last_accessed().cmp(a.last_accessed()))
        .then_with(|| a.created_at().cmp(b.created_at()))
        .then_with(|| a.kind_rank().cmp(&b.kind_rank()))
        .then_with(|| a.seq().cmp(&b.seq()))
}

/// How strongly a node name matches a keyword, both already case-folded.
pub fn name_match(node_key: &str, keyword: &str) -> Option<f64> {
    if node_key.is_empty() || keyword.is_empty() {
        None
    } else if node_key == keyword {
        Some(EXACT_MATCH)
    } else if node_key.starts_with(keyword) || keyword.starts_with(node_key) {
        Some(PREFIX_MATCH)
    } else if node_key.contains(keyword) || keyword.contains(node_key) {
        Some(SUBSTRING_MATCH)
    } else {
        None
    }
}

/// Ranks nodes and memories. Holds only configuration; connections are passed per call.
#[derive(Debug, Clone)]
pub struct Retriever {
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    fn scopes(&self, scope: &Scope) -> Vec<Scope> {
        let mut scopes = vec![scope.clone()];
        if self.config.include_shared && !scope.is_shared() {
            scopes.push(Scope::Shared);
        }
        scopes
    }

    fn recency(&self, last_accessed: &str, now: DateTime<Utc>) -> f64 {
        0.5f64.powf(hours_between(last_accessed, now) / self.config.recency_half_life_hours)
    }

    fn score(&self, salience: f64, last_accessed: &str, match_strength: f64, now: DateTime<Utc>) -> f64 {
        self.config.importance_weight * salience
            + self.config.recency_weight * self.recency(last_accessed, now)
            + self.config.match_weight * match_strength
    }

    fn node_salience(&self, node: &CognitiveNode) -> f64 {
        (node.activation / self.config.max_activation).min(1.0)
    }

    /// Top `limit` nodes and memories related to `keyword` in `scope`.
    #[allow(clippy::too_many_arguments)]
    pub fn retrieve_by_keyword(
        &self,
        graph_conn: &Connection,
        records_conn: &Connection,
        scope: &Scope,
        keyword: &str,
        limit: usize,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetrievalHit>> {
        let keyword = name_key(keyword);
        if keyword.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let scopes = self.scopes(scope);
        let mut hits = Vec::new();

        // Nodes matched by name
        let mut matched: Vec<(CognitiveNode, f64)> = Vec::new();
        for node in graph::nodes_in_scopes(graph_conn, &scopes)? {
            if let Some(strength) = name_match(&node.name_key, &keyword) {
                matched.push((node, strength));
            }
        }

        // Best match per memory id
        let mut memory_matches: HashMap<String, f64> = HashMap::new();
        let mut note = |id: &str, strength: f64| {
            let entry = memory_matches.entry(id.to_string()).or_insert(0.0);
            if strength > *entry {
                *entry = strength;
            }
        };

        let conversation_ids: Vec<&str> = scopes.iter().map(Scope::as_key).collect();
        let in_scope = records::memories_in_conversations(records_conn, &conversation_ids)?;
        for memory in &in_scope {
            if memory.content.to_lowercase().contains(&keyword) {
                note(&memory.id, CONTENT_MATCH);
            }
        }

        // Neighbors one hop from a matched node
        let matched_ids: Vec<String> = matched.iter().map(|(n, _)| n.id.clone()).collect();
        let mut hop_strength: HashMap<String, f64> = HashMap::new();
        let mut reached: HashMap<String, CognitiveNode> = HashMap::new();
        for id in &matched_ids {
            for (edge, neighbor) in graph::neighbors(graph_conn, id, self.config.expansion_fanout)? {
                if matched_ids.contains(&neighbor.id) || !scopes.contains(&neighbor.scope) {
                    continue;
                }
                let s = (HOP_MATCH * edge.strength).min(HOP_MATCH);
                let entry = hop_strength.entry(neighbor.id.clone()).or_insert(0.0);
                *entry = entry.max(s);
                reached.insert(neighbor.id.clone(), neighbor);
            }
        }
        for (id, node) in reached {
            if let Some(&strength) = hop_strength.get(&id) {
                matched.push((node, strength));
            }
        }

        for memory in &in_scope {
            for node_id in &memory.node_ids {
                if matched_ids.contains(node_id) {
                    note(&memory.id, LINKED_MATCH);
                } else if let Some(s) = hop_strength.get(node_id) {
                    note(&memory.id, *s);
                }
            }
        }

        for (node, strength) in matched {
            let score = self.score(self.node_salience(&node), &node.last_accessed, strength, now);
            hits.push(RetrievalHit {
                target: HitTarget::Node(node),
                score,
                match_strength: strength,
            });
        }
        for memory in in_scope {
            if let Some(&strength) = memory_matches.get(&memory.id) {
                let score = self.score(memory.weight, &memory.last_accessed, strength, now);
                hits.push(RetrievalHit {
                    target: HitTarget::Memory(memory),
                    score,
                    match_strength: strength,
                });
            }
        }

        hits.sort_by(compare_hits);
        hits.truncate(limit);

        if mode == AccessMode::Reinforce {
            for hit in hits.iter_mut() {
                if let HitTarget::Memory(memory) = &mut hit.target {
                    *memory = records::reinforce(records_conn, &memory.id, self.config.reinforce_boost, now)?;
                }
            }
        }

        tracing::debug!(keyword = %keyword, scope = %scope, results = hits.len(), "keyword retrieval");
        Ok(hits)
    }

    /// Nodes named in `recent_messages`, their one-hop neighbors, and the memories linked to them.
    #[allow(clippy::too_many_arguments)]
    pub fn retrieve_for_context(
        &self,
        graph_conn: &Connection,
        records_conn: &Connection,
        conversation_id: &str,
        recent_messages: &[String],
        limit: usize,
        mode: AccessMode,
        now: DateTime<Utc>,
    ) -> Result<ContextRecall> {
        if limit == 0 || recent_messages.is_empty() {
            return Ok(ContextRecall::default());
        }

        let scopes = self.scopes(&Scope::conversation(conversation_id));
        let text: Vec<String> = recent_messages.iter().map(|m| m.to_lowercase()).collect();

        let mut scored: HashMap<String, ScoredNode> = HashMap::new();
        let seeds: Vec<CognitiveNode> = graph::nodes_in_scopes(graph_conn, &scopes)?
            .into_iter()
            .filter(|n| !n.name_key.is_empty() && text.iter().any(|t| t.contains(&n.name_key)))
            .collect();

        for seed in &seeds {
            keep_max(&mut scored, seed.clone(), seed.activation, true);
        }
        for seed in &seeds {
            for (edge, neighbor) in graph::neighbors(graph_conn, &seed.id, self.config.expansion_fanout)? {
                if !scopes.contains(&neighbor.scope) {
                    continue;
                }
                let score = neighbor.activation * edge.strength;
                keep_max(&mut scored, neighbor, score, false);
            }
        }

        let mut nodes: Vec<ScoredNode> = scored.into_values().collect();
        nodes.sort_by(|a, b| {
            desc(a.score, b.score)
                .then_with(|| b.node.last_accessed.cmp(&a.node.last_accessed))
                .then_with(|| a.node.seq.cmp(&b.node.seq))
        });
        nodes.truncate(limit);

        let node_scores: HashMap<&str, f64> = nodes.iter().map(|n| (n.node.id.as_str(), n.score)).collect();
        let node_ids: Vec<String> = nodes.iter().map(|n| n.node.id.clone()).collect();
        let conversation_keys: Vec<&str> = scopes.iter().map(Scope::as_key).collect();

        let mut memories: Vec<ScoredMemory> = records::memories_for_nodes(records_conn, &node_ids)?
            .into_iter()
            .filter(|m| conversation_keys.contains(&m.conversation_id.as_str()))
            .map(|memory| {
                let best = memory
                    .node_ids
                    .iter()
                    .filter_map(|id| node_scores.get(id.as_str()).copied())
                    .fold(0.0, f64::max);
                ScoredMemory {
                    score: memory.weight * best,
                    memory,
                }
            })
            .collect();
        memories.sort_by(|a, b| {
            desc(a.score, b.score)
                .then_with(|| b.memory.last_accessed.cmp(&a.memory.last_accessed))
                .then_with(|| a.memory.seq.cmp(&b.memory.seq))
        });
        memories.truncate(limit);

        if mode == AccessMode::Reinforce {
            for scored in memories.iter_mut() {
                scored.memory =
                    records::reinforce(records_conn, &scored.memory.id, self.config.reinforce_boost, now)?;
            }
        }

        tracing::debug!(
            conversation = %conversation_id,
            seeds = seeds.len(),
            nodes = nodes.len(),
            memories = memories.len(),
            "context retrieval"
        );
        Ok(ContextRecall { nodes, memories })
    }
}

fn keep_max(scored: &mut HashMap<String, ScoredNode>, node: CognitiveNode, score: f64, seed: bool) {
    match scored.get_mut(&node.id) {
        Some(existing) if existing.score >= score => {}
        Some(existing) => {
            existing.score = score;
            existing.seed |= seed;
        }
        None => {
            scored.insert(node.id.clone(), ScoredNode { node, score, seed });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::db::Store;
    use crate::memory::records::NewMemory;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn match_strength_tiers() {
        assert_eq!(name_match("cats", "cats"), Some(EXACT_MATCH));
        assert_eq!(name_match("catsup", "cats"), Some(PREFIX_MATCH));
        assert_eq!(name_match("cat", "cats"), Some(PREFIX_MATCH));
        assert_eq!(name_match("bobcats", "cats"), Some(SUBSTRING_MATCH));
        assert_eq!(name_match("dogs", "cats"), None);
    }

    fn seeded_store() -> (Store, String, String) {
        let store = Store::open_in_memory().unwrap();
        let config = NodeConfig::default();
        let g1 = Scope::conversation("g1");
        let (cats, dogs) = {
            let g = store.graph().unwrap();
            let cats = graph::upsert_node(&g, &g1, "cats", &config, t0()).unwrap();
            graph::upsert_node(&g, &g1, "cats", &config, t0()).unwrap();
            let dogs = graph::upsert_node(&g, &g1, "dogs", &config, t0()).unwrap();
            graph::upsert_association(&g, &cats.id, &dogs.id, 0.5, &config, t0()).unwrap();
            (cats.id, dogs.id)
        };
        {
            let mut r = store.records().unwrap();
            records::create_memory(
                &mut r,
                &NewMemory {
                    conversation_id: "g1".into(),
                    content: "alice has two cats".into(),
                    importance: 0.8,
                    node_ids: vec![cats.clone()],
                    permanent: false,
                },
                t0(),
            )
            .unwrap();
            records::create_memory(
                &mut r,
                &NewMemory {
                    conversation_id: "g1".into(),
                    content: "bob walks the dog daily".into(),
                    importance: 0.8,
                    node_ids: vec![dogs.clone()],
                    permanent: false,
                },
                t0(),
            )
            .unwrap();
        }
        (store, cats, dogs)
    }

    #[test]
    fn keyword_finds_named_node_and_linked_memories() {
        let (store, cats, dogs) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let hits: Vec<RetrievalHit> = retriever
            .retrieve_by_keyword(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                &Scope::conversation("g1"),
                "Cats",
                10,
                AccessMode::ReadOnly,
                t0(),
            )
            .unwrap();

        let node_ids: Vec<_> = hits.iter().filter_map(|h| h.as_node()).map(|n| n.id.as_str()).collect();
        // dogs reached over the cats -> dogs edge, ranked below the named node
        assert_eq!(node_ids, vec![cats.as_str(), dogs.as_str()]);
        let memory_contents: Vec<_> = hits.iter().filter_map(|h| h.as_memory()).map(|m| m.content.as_str()).collect();
        assert_eq!(memory_contents[0], "alice has two cats");
        assert!(memory_contents.contains(&"bob walks the dog daily"));
    }

    #[test]
    fn read_only_is_deterministic_and_writes_nothing() {
        let (store, _, _) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let graph_conn = store.graph().unwrap();
        let records_conn = store.records().unwrap();
        let run = || {
            retriever
                .retrieve_by_keyword(
                    &graph_conn,
                    &records_conn,
                    &Scope::conversation("g1"),
                    "cats",
                    10,
                    AccessMode::ReadOnly,
                    t0() + Duration::hours(2),
                )
                .unwrap()
                .into_iter()
                .map(|h| (h.score, h.as_node().map(|n| n.id.clone()), h.as_memory().map(|m| m.id.clone())))
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);

        let reinforcements: i64 = records_conn
            .query_row("SELECT COUNT(*) FROM memory_log WHERE operation = 'reinforce'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(reinforcements, 0);
    }

    #[test]
    fn reinforce_mode_touches_returned_memories() {
        let (store, _, _) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let later = t0() + Duration::hours(1);
        let hits = retriever
            .retrieve_by_keyword(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                &Scope::conversation("g1"),
                "cats",
                10,
                AccessMode::Reinforce,
                later,
            )
            .unwrap();
        let memory = hits.iter().find_map(|h| h.as_memory()).unwrap();
        assert!((memory.weight - 0.9).abs() < 1e-9);
        assert_eq!(memory.last_accessed, crate::memory::types::format_timestamp(later));
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let (store, _, _) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let hits = retriever
            .retrieve_by_keyword(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                &Scope::conversation("g1"),
                "zebras",
                10,
                AccessMode::ReadOnly,
                t0(),
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn context_expands_one_hop() {
        let (store, cats, dogs) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let recall = retriever
            .retrieve_for_context(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                "g1",
                &["I love my CATS".to_string()],
                10,
                AccessMode::ReadOnly,
                t0(),
            )
            .unwrap();

        assert_eq!(recall.nodes.len(), 2);
        assert_eq!(recall.nodes[0].node.id, cats);
        assert!(recall.nodes[0].seed);
        assert_eq!(recall.nodes[1].node.id, dogs);
        assert!(!recall.nodes[1].seed);
        assert!((recall.nodes[1].score - 0.5).abs() < 1e-9);
        assert_eq!(recall.memories[0].memory.content, "alice has two cats");
    }

    #[test]
    fn other_conversation_is_invisible() {
        let (store, _, _) = seeded_store();
        let retriever = Retriever::new(RetrievalConfig::default());
        let recall = retriever
            .retrieve_for_context(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                "g2",
                &["cats".to_string()],
                10,
                AccessMode::ReadOnly,
                t0(),
            )
            .unwrap();
        assert!(recall.nodes.is_empty());
        assert!(recall.memories.is_empty());
    }

    #[test]
    fn context_hop_stays_in_scope() {
        let (store, cats, _) = seeded_store();
        {
            let g = store.graph().unwrap();
            let config = NodeConfig::default();
            let secret = graph::upsert_node(&g, &Scope::conversation("g2"), "secret", &config, t0()).unwrap();
            graph::upsert_association(&g, &cats, &secret.id, 1.0, &config, t0()).unwrap();
        }
        let retriever = Retriever::new(RetrievalConfig::default());
        let recall = retriever
            .retrieve_for_context(
                &store.graph().unwrap(),
                &store.records().unwrap(),
                "g1",
                &["cats".to_string()],
                10,
                AccessMode::ReadOnly,
                t0(),
            )
            .unwrap();
        assert!(recall.nodes.iter().all(|n| n.node.name != "secret"));
        assert_eq!(recall.nodes.len(), 2);
    }
}
