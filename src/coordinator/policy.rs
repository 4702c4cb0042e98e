//! Whether to speak up unprompted in a group conversation.

use std::collections::HashSet;

use crate::config::PolicyConfig;

/// Inputs for an autonomous reply decision.
#[derive(Debug, Clone, Default)]
pub struct ReplyContext {
    pub conversation_id: String,
    /// Case-folded names extracted from the batch just processed.
    pub extracted_nodes: Vec<String>,
    /// Case-folded names of the conversation's most active nodes.
    pub active_nodes: Vec<String>,
    /// Analyzer-reported continuation likelihood, in `[0, 1]`.
    pub continuation: f64,
    /// `None` if the bot has never replied here.
    pub minutes_since_last_reply: Option<f64>,
}

impl ReplyContext {
    /// Share of distinct extracted names that are among the active ones.
    pub fn topic_similarity(&self) -> f64 {
        let extracted: HashSet<&str> = self.extracted_nodes.iter().map(String::as_str).collect();
        if extracted.is_empty() {
            return 0.0;
        }
        let active: HashSet<&str> = self.active_nodes.iter().map(String::as_str).collect();
        extracted.intersection(&active).count() as f64 / extracted.len() as f64
    }
}

/// Pluggable reply decision. Priority messages never reach it; they always get a reply.
pub trait ReplyPolicy: Send + Sync {
    fn should_reply(&self, context: &ReplyContext) -> bool;
}

/// Weighted topic overlap and continuation, damped right after the bot spoke.
#[derive(Debug, Clone)]
pub struct ContinuationPolicy {
    config: PolicyConfig,
}

impl ContinuationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// `1 - 0.5^(minutes / cooldown)`: zero right after a reply, approaching one after several cooldowns.
    pub fn cooldown_factor(&self, minutes_since_last_reply: Option<f64>) -> f64 {
        match minutes_since_last_reply {
            None => 1.0,
            Some(_) if self.config.cooldown_minutes <= 0.0 => 1.0,
            Some(minutes) => 1.0 - 0.5f64.powf(minutes.max(0.0) / self.config.cooldown_minutes),
        }
    }

    pub fn score(&self, context: &ReplyContext) -> f64 {
        let raw = self.config.topic_weight * context.topic_similarity()
            + self.config.continuation_weight * context.continuation;
        raw * self.cooldown_factor(context.minutes_since_last_reply)
    }
}

impl ReplyPolicy for ContinuationPolicy {
    fn should_reply(&self, context: &ReplyContext) -> bool {
        let score = self.score(context);
        tracing::debug!(
            conversation = %context.conversation_id,
            score,
            threshold = self.config.reply_threshold,
            "continuation score"
        );
        score >= self.config.reply_threshold
    }
}
