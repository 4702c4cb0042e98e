//! Core type definitions.
//!
//! Defines [`Scope`] (which keyword graph a node belongs to), [`CognitiveNode`]
//! and [`Association`] (the graph store), [`MemoryRecord`] (long-term memory),
//! and [`QueueEntry`] (short-term memory), plus the timestamp helpers every
//! store uses.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Which graph a node lives in.
///
/// Stored as the conversation id, with the empty string for the shared graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    /// Private to one conversation.
    Conversation(String),
    /// The public graph visible from every conversation.
    Shared,
}

impl Scope {
    pub fn conversation(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.is_empty() {
            Self::Shared
        } else {
            Self::Conversation(id)
        }
    }

    /// SQL column value.
    pub fn as_key(&self) -> &str {
        match self {
            Self::Conversation(id) => id,
            Self::Shared => "",
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared)
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        Self::conversation(s)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.as_key().to_string()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => f.write_str(id),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// A keyword node, matching the `cognitive_nodes` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitiveNode {
    /// UUID v7 primary key.
    pub id: String,
    pub scope: Scope,
    /// Display name as first seen.
    pub name: String,
    /// Case-folded name used for uniqueness within a scope.
    pub name_key: String,
    pub activation: f64,
    /// Exempt from decay and from the normal delete path.
    pub permanent: bool,
    pub created_at: String,
    pub last_accessed: String,
    /// Decay anchor: elapsed time is measured from the later of this and `last_accessed`.
    pub decayed_at: String,
    /// Insertion order, the final tie-breaker in ranked lists.
    pub seq: i64,
}

/// A directed, weighted edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub source_id: String,
    pub target_id: String,
    pub strength: f64,
    pub created_at: String,
    pub updated_at: String,
    pub decayed_at: String,
}

/// A long-term memory, matching the `memories` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    /// Salience in `[0.0, 1.0]`, reduced by decay and raised by reinforcement.
    pub weight: f64,
    pub permanent: bool,
    pub created_at: String,
    pub last_accessed: String,
    pub decayed_at: String,
    /// Graph nodes this memory was extracted with. References may dangle.
    pub node_ids: Vec<String>,
    pub seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Private chat or a direct mention: processed on arrival.
    Immediate,
    /// Accumulated and processed by the batch cycle.
    Batched,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batched => "batched",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "batched" => Ok(Self::Batched),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    InFlight,
    Processed,
    Dropped,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Processed => "processed",
            Self::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "processed" => Ok(Self::Processed),
            "dropped" => Ok(Self::Dropped),
            _ => Err(format!("unknown queue state: {s}")),
        }
    }
}

/// One chat message in the short-term queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic; defines arrival order.
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub arrived_at: String,
    pub priority: Priority,
    pub state: QueueState,
    pub attempts: u32,
    /// The bot's own reply, kept for context but never analyzed.
    pub is_bot: bool,
    pub last_error: Option<String>,
}

/// Case-folded, trimmed form of a node name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Format a timestamp for storage. Fixed precision keeps lexical order equal to time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Hours from `since` to `now`, never negative. Unparseable input counts as zero.
pub fn hours_between(since: &str, now: DateTime<Utc>) -> f64 {
    match parse_timestamp(since) {
        Some(ts) => ((now - ts).num_milliseconds() as f64 / 3_600_000.0).max(0.0),
        None => 0.0,
    }
}

/// Convert a SQL text column into an enum, surfacing bad values as conversion errors.
pub(crate) fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })
}
