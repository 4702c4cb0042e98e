//! The boundary to the external analysis and reply services.
//!
//! Analysis payloads are untrusted JSON of uncertain shape. [`Analysis`] is the
//! strict internal form; [`Analysis::parse_payload`] coerces whatever the
//! service returned into it or fails with [`PersonaError::Analysis`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{PersonaError, Result};
use crate::memory::retrieve::ContextRecall;
use crate::memory::types::{name_key, QueueEntry};

const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Input for one analysis call.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub conversation_id: String,
    /// The batch being processed, in arrival order.
    pub messages: Vec<QueueEntry>,
    /// Earlier processed history, oldest first, for context only.
    pub context: Vec<QueueEntry>,
}

/// What the analyzer extracted from a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analysis {
    /// One entry per mention, so a repeated name appears more than once.
    pub nodes: Vec<String>,
    /// Pairs of names that co-occurred.
    pub associations: Vec<(String, String)>,
    pub summary: String,
    /// Importance of the summary as a memory, in `[0, 1]`.
    pub importance: f64,
    /// Likelihood the conversation continues and wants the bot in it, in `[0, 1]`.
    pub continuation: f64,
}

fn invalid(msg: impl Into<String>) -> PersonaError {
    PersonaError::Analysis(msg.into())
}

/// Remove a surrounding Markdown code fence, with or without a language tag.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches("json"),
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn pair(value: &Value) -> Option<(String, String)> {
    let (a, b) = match value {
        Value::Array(items) if items.len() == 2 => (items[0].as_str()?, items[1].as_str()?),
        Value::Object(map) => (
            map.get("source").or_else(|| map.get("from"))?.as_str()?,
            map.get("target").or_else(|| map.get("to"))?.as_str()?,
        ),
        _ => return None,
    };
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

fn unit_number(value: Option<&Value>, field: &str, default: f64) -> Result<f64> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .ok_or_else(|| invalid(format!("{field} is not a finite number"))),
        Some(other) => Err(invalid(format!("{field} must be a number, got {other}"))),
    }
}

fn unit_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        default
    }
}

impl Analysis {
    /// Parse a raw service response, tolerating a Markdown code fence.
    pub fn parse_payload(raw: &str) -> Result<Self> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body)
            .map_err(|e| invalid(format!("payload is not JSON: {e}")))?;
        Self::from_json_value(&value)
    }

    /// Coerce a JSON value into an `Analysis`.
    ///
    /// Accepts the flat layout (`nodes` or `keywords`, `associations`, `summary`,
    /// `importance`, `continuation`) and the topic layout (`completed_topics` /
    /// `ongoing_topics`, each with `keywords`), where keywords in one topic count
    /// as co-occurring.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid("payload is not a JSON object"))?;

        if map.contains_key("completed_topics") || map.contains_key("ongoing_topics") {
            return Self::from_topics(value);
        }

        let nodes = string_list(map.get("nodes").or_else(|| map.get("keywords")));
        let associations = match map.get("associations") {
            Some(Value::Array(items)) => items.iter().filter_map(pair).collect(),
            _ => Vec::new(),
        };
        let summary = map
            .get("summary")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let analysis = Self {
            nodes,
            associations,
            summary,
            importance: unit_number(map.get("importance"), "importance", DEFAULT_IMPORTANCE)?,
            continuation: unit_number(
                map.get("continuation").or_else(|| map.get("continuation_probability")),
                "continuation",
                0.0,
            )?,
        };

        if analysis.nodes.is_empty() && analysis.summary.is_empty() {
            return Err(invalid("payload has neither nodes nor summary"));
        }
        Ok(analysis)
    }

    fn from_topics(value: &Value) -> Result<Self> {
        let mut analysis = Self {
            importance: unit_number(value.get("importance"), "importance", DEFAULT_IMPORTANCE)?,
            ..Default::default()
        };
        let mut summaries = Vec::new();

        for (field, completed) in [("completed_topics", true), ("ongoing_topics", false)] {
            let Some(Value::Array(topics)) = value.get(field) else {
                continue;
            };
            for topic in topics {
                let keywords = string_list(topic.get("keywords").or_else(|| topic.get("nodes")));
                for (i, a) in keywords.iter().enumerate() {
                    for b in &keywords[i + 1..] {
                        analysis.associations.push((a.clone(), b.clone()));
                    }
                }
                analysis.nodes.extend(keywords);

                if completed {
                    if let Some(summary) = topic.get("summary").and_then(Value::as_str) {
                        if !summary.trim().is_empty() {
                            summaries.push(summary.trim().to_string());
                        }
                    }
                } else {
                    let p = unit_number(topic.get("continuation_probability"), "continuation_probability", 0.0)?;
                    analysis.continuation = analysis.continuation.max(p);
                }
            }
        }

        analysis.summary = summaries.join("\n");
        if analysis.nodes.is_empty() && analysis.summary.is_empty() {
            return Err(invalid("payload has neither nodes nor summary"));
        }
        Ok(analysis)
    }

    /// Drop self-associations, associations naming unknown nodes, and duplicate pairs.
    ///
    /// `importance` and `continuation` are clamped into `[0, 1]`; a non-finite
    /// value falls back to its default.
    pub fn validated(mut self) -> Self {
        self.importance = unit_or(self.importance, DEFAULT_IMPORTANCE);
        self.continuation = unit_or(self.continuation, 0.0);
        self.summary = self.summary.trim().to_string();
        self.nodes.retain(|n| !n.trim().is_empty());
        let known: Vec<String> = self.nodes.iter().map(|n| name_key(n)).collect();

        let mut seen = Vec::new();
        self.associations.retain(|(a, b)| {
            let (ka, kb) = (name_key(a), name_key(b));
            if ka == kb || !known.contains(&ka) || !known.contains(&kb) {
                tracing::debug!(source = %a, target = %b, "discarding association");
                return false;
            }
            let key = if ka < kb { (ka, kb) } else { (kb, ka) };
            if seen.contains(&key) {
                return false;
            }
            seen.push(key);
            true
        });
        self
    }
}

/// Extracts nodes, associations and a summary from a batch of messages.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis>;
}

/// Input for generating a reply.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub conversation_id: String,
    /// Recent history including the bot's own replies, oldest first.
    pub history: Vec<QueueEntry>,
    pub recall: ContextRecall,
    /// The bot was addressed directly.
    pub priority: bool,
}

/// Produces the bot's reply text. `None` means stay silent.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: ReplyRequest) -> Result<Option<String>>;
}
