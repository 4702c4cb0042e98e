#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use persona::config::PersonaConfig;
use persona::coordinator::analysis::{Analysis, AnalysisRequest, Analyzer, ReplyRequest, Responder};
use persona::coordinator::policy::{ContinuationPolicy, ReplyContext, ReplyPolicy};
use persona::coordinator::sink::ReplySink;
use persona::coordinator::{EngineConfig, IncomingMessage, PersonaEngine, Reply};
use persona::db::Store;
use persona::error::{PersonaError, Result};

/// Fresh in-memory stores with schema and migrations applied.
pub fn test_store() -> Store {
    Store::open_in_memory().unwrap()
}

/// A fixed instant so decay and recency are reproducible.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Words of four or more letters, lowercased, stripped of punctuation.
pub fn keywords(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() >= 4)
        .collect()
}

/// Deterministic analyzer: nodes are the keywords of each message and
/// keywords in the same message co-occur.
#[derive(Default)]
pub struct KeywordAnalyzer {
    pub calls: AtomicUsize,
    /// Ids of batch entries in the order they were analysed.
    pub seen: std::sync::Mutex<Vec<i64>>,
}

#[async_trait]
impl Analyzer for KeywordAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.extend(request.messages.iter().map(|m| m.id));
        }
        let mut analysis = Analysis {
            importance: 0.7,
            continuation: 0.5,
            ..Default::default()
        };
        for message in &request.messages {
            let words = keywords(&message.content);
            for (i, a) in words.iter().enumerate() {
                for b in &words[i + 1..] {
                    if a != b {
                        analysis.associations.push((a.clone(), b.clone()));
                    }
                }
            }
            analysis.nodes.extend(words);
        }
        if !analysis.nodes.is_empty() {
            analysis.summary = format!("[{}] talked about {}", request.conversation_id, analysis.nodes.join(", "));
        }
        Ok(analysis)
    }
}

/// Always fails, as an unavailable analysis service would.
#[derive(Default)]
pub struct FailingAnalyzer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Analyzer for FailingAnalyzer {
    async fn analyze(&self, _request: AnalysisRequest) -> Result<Analysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PersonaError::Analysis("service unavailable".into()))
    }
}

/// Sleeps past any reasonable deadline before answering.
pub struct SlowAnalyzer(pub Duration);

#[async_trait]
impl Analyzer for SlowAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis> {
        tokio::time::sleep(self.0).await;
        KeywordAnalyzer::default().analyze(request).await
    }
}

/// Replies with a fixed text and counts how many memories it was given.
#[derive(Default)]
pub struct FixedResponder {
    pub recalled: AtomicUsize,
}

#[async_trait]
impl Responder for FixedResponder {
    async fn respond(&self, request: ReplyRequest) -> Result<Option<String>> {
        self.recalled.store(request.recall.memories.len(), Ordering::SeqCst);
        Ok(Some(format!("noted, {} things come to mind", request.recall.memories.len())))
    }
}

pub struct FailingResponder;

#[async_trait]
impl Responder for FailingResponder {
    async fn respond(&self, _request: ReplyRequest) -> Result<Option<String>> {
        Err(PersonaError::Analysis("reply service unavailable".into()))
    }
}

/// Never speaks unprompted.
pub struct NeverReply;

impl ReplyPolicy for NeverReply {
    fn should_reply(&self, _context: &ReplyContext) -> bool {
        false
    }
}

/// Keeps every autonomous reply it is handed.
#[derive(Default)]
pub struct CollectingSink {
    pub replies: std::sync::Mutex<Vec<Reply>>,
}

#[async_trait]
impl ReplySink for CollectingSink {
    async fn deliver(&self, reply: Reply) -> Result<()> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(reply);
        }
        Ok(())
    }
}

/// Refuses everything, as a disconnected chat adapter would.
pub struct ClosedSink;

#[async_trait]
impl ReplySink for ClosedSink {
    async fn deliver(&self, _reply: Reply) -> Result<()> {
        Err(PersonaError::Delivery("adapter offline".into()))
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig::from_config(&PersonaConfig::default())
}

pub fn engine_with(
    analyzer: Arc<dyn Analyzer>,
    responder: Arc<dyn Responder>,
    config: EngineConfig,
) -> Arc<PersonaEngine> {
    engine_with_sink(analyzer, responder, Arc::new(CollectingSink::default()), config)
}

pub fn engine_with_sink(
    analyzer: Arc<dyn Analyzer>,
    responder: Arc<dyn Responder>,
    sink: Arc<dyn ReplySink>,
    config: EngineConfig,
) -> Arc<PersonaEngine> {
    let policy = Arc::new(ContinuationPolicy::new(config.policy.clone()));
    Arc::new(PersonaEngine::new(test_store(), analyzer, responder, policy, sink, config))
}

pub fn group_message(conversation: &str, sender: &str, content: &str) -> IncomingMessage {
    IncomingMessage {
        conversation_id: conversation.into(),
        sender_id: sender.into(),
        sender_name: sender.into(),
        content: content.into(),
        is_private: false,
        is_mentioned: false,
    }
}

pub fn mention(conversation: &str, sender: &str, content: &str) -> IncomingMessage {
    IncomingMessage {
        is_mentioned: true,
        ..group_message(conversation, sender, content)
    }
}
