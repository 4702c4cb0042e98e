//! Turns incoming chat messages into memory and, sometimes, a reply.
//!
//! Each conversation is processed by at most one task at a time, behind a
//! per-conversation async mutex, so batches within a conversation are handled
//! strictly in arrival order while different conversations run in parallel.
//!
//! Processing a conversation drains its queue in batches. Every batch goes to
//! the [`Analyzer`]; the result boosts nodes, links co-occurring pairs, stores a
//! summary memory and acknowledges the batch. A failed or timed-out analysis
//! sends the batch back to the queue and ends the cycle for that conversation.

pub mod analysis;
pub mod llm;
pub mod policy;
pub mod sink;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::config::{NodeConfig, PersonaConfig, PolicyConfig, QueueConfig, RetrievalConfig};
use crate::db::Store;
use crate::error::{PersonaError, Result};
use crate::memory::graph;
use crate::memory::queue::{self, Disposition, NewMessage};
use crate::memory::records::{self, NewMemory};
use crate::memory::retrieve::{AccessMode, RetrievalHit, Retriever};
use crate::memory::types::{hours_between, name_key, CognitiveNode, MemoryRecord, QueueEntry, QueueState, Scope};

use analysis::{Analysis, AnalysisRequest, Analyzer, ReplyRequest, Responder};
use policy::{ReplyContext, ReplyPolicy};
use sink::ReplySink;

/// The slice of [`PersonaConfig`] the coordinator needs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub nodes: NodeConfig,
    pub retrieval: RetrievalConfig,
    pub policy: PolicyConfig,
    /// Deadline for one analyzer or responder call.
    pub analysis_timeout: Duration,
    pub max_attempts: u32,
}

impl EngineConfig {
    pub fn from_config(config: &PersonaConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            nodes: config.nodes.clone(),
            retrieval: config.retrieval.clone(),
            policy: config.policy.clone(),
            analysis_timeout: Duration::from_secs(config.analysis.timeout_secs),
            max_attempts: config.analysis.max_attempts,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&PersonaConfig::default())
    }
}

/// A chat message as the adapter sees it.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// One-to-one chat with the bot.
    pub is_private: bool,
    /// The bot was mentioned by name.
    pub is_mentioned: bool,
}

impl IncomingMessage {
    pub fn is_priority(&self) -> bool {
        self.is_private || self.is_mentioned
    }
}

/// Text the bot wants to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub conversation_id: String,
    pub content: String,
    /// Reply preparation failed and this is the configured fallback.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Queued,
    Processing,
}

/// What one [`PersonaEngine::process_conversation`] call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutcome {
    /// Queue entries analysed and acknowledged.
    pub processed: usize,
    pub batches: usize,
    /// Entries sent back to pending after a failed analysis.
    pub failed: usize,
    /// Entries dropped after reaching the attempt cap.
    pub dropped: usize,
    /// The answer to a priority request, for the caller to send.
    pub reply: Option<Reply>,
    /// An autonomous reply was accepted by the reply sink.
    pub delivered: bool,
}

/// Totals for one [`PersonaEngine::run_batch_cycle`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub conversations: usize,
    pub processed: usize,
    pub failed: usize,
    pub dropped: usize,
    pub errors: usize,
    /// Autonomous replies accepted by the reply sink.
    pub delivered: usize,
}

/// Marks a conversation as processing until dropped.
struct ProcessingGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    conversation_id: String,
}

impl<'a> ProcessingGuard<'a> {
    fn enter(set: &'a StdMutex<HashSet<String>>, conversation_id: &str) -> Result<Self> {
        set.lock()
            .map_err(|e| PersonaError::LockPoisoned(format!("processing set: {e}")))?
            .insert(conversation_id.to_string());
        Ok(Self {
            set,
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.conversation_id);
        }
    }
}

type LockMap = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// A handle on one conversation's lock. The map entry is removed when the
/// last lease is dropped.
struct ConversationLease<'a> {
    locks: &'a LockMap,
    conversation_id: String,
    lock: Option<Arc<Mutex<()>>>,
}

impl ConversationLease<'_> {
    async fn acquire(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }
}

impl Drop for ConversationLease<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        // Leases are cloned under the map lock, so the count cannot grow while we hold it.
        if let Ok(mut locks) = self.locks.lock() {
            if locks
                .get(&self.conversation_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&self.conversation_id);
            }
        }
    }
}

pub struct PersonaEngine {
    store: Store,
    analyzer: Arc<dyn Analyzer>,
    responder: Arc<dyn Responder>,
    policy: Arc<dyn ReplyPolicy>,
    sink: Arc<dyn ReplySink>,
    retriever: Retriever,
    config: EngineConfig,
    locks: LockMap,
    processing: StdMutex<HashSet<String>>,
}

impl PersonaEngine {
    pub fn new(
        store: Store,
        analyzer: Arc<dyn Analyzer>,
        responder: Arc<dyn Responder>,
        policy: Arc<dyn ReplyPolicy>,
        sink: Arc<dyn ReplySink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            responder,
            policy,
            sink,
            retriever: Retriever::new(config.retrieval.clone()),
            config,
            locks: StdMutex::new(HashMap::new()),
            processing: StdMutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn conversation_lock(&self, conversation_id: &str) -> Result<ConversationLease<'_>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| PersonaError::LockPoisoned(format!("conversation locks: {e}")))?;
        let lock = Arc::clone(locks.entry(conversation_id.to_string()).or_default());
        Ok(ConversationLease {
            locks: &self.locks,
            conversation_id: conversation_id.to_string(),
            lock: Some(lock),
        })
    }

    /// Conversations with a lock in the map, for tests of lock cleanup.
    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Queue a message. Priority messages are processed and answered before this returns.
    pub async fn handle_message(&self, message: IncomingMessage) -> Result<Option<Reply>> {
        let conversation_id = message.conversation_id.clone();
        let new = NewMessage {
            is_priority: message.is_priority(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content: message.content,
        };
        let queue_config = self.config.queue.clone();
        let outcome = self
            .store
            .run_records(move |conn| queue::enqueue(conn, &new, &queue_config, Utc::now()))
            .await?;

        match outcome.disposition {
            Disposition::Immediate => Ok(self.process_conversation(&conversation_id, true).await?.reply),
            Disposition::Backpressure { pending } => {
                tracing::info!(conversation = %conversation_id, pending, "processing early under backpressure");
                Ok(self.process_conversation(&conversation_id, false).await?.reply)
            }
            Disposition::Queued => Ok(None),
        }
    }

    /// Drain and analyse everything pending for a conversation, then decide on a reply.
    ///
    /// With `force_reply` the bot always answers, falling back to
    /// `policy.fallback_reply` if the reply cannot be prepared.
    pub async fn process_conversation(&self, conversation_id: &str, force_reply: bool) -> Result<ProcessOutcome> {
        let lease = self.conversation_lock(conversation_id)?;
        let _serialized = lease.acquire().await;
        let _processing = ProcessingGuard::enter(&self.processing, conversation_id)?;

        let mut outcome = ProcessOutcome::default();
        let mut extracted = Vec::new();
        let mut continuation: f64 = 0.0;

        loop {
            let conv = conversation_id.to_string();
            let batch_size = self.config.queue.batch_size;
            let batch = self
                .store
                .run_records(move |conn| queue::drain_batch(conn, &conv, batch_size))
                .await?;
            if batch.is_empty() {
                break;
            }
            let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();

            match self.process_batch(conversation_id, batch).await {
                Ok(analysis) => {
                    outcome.processed += ids.len();
                    outcome.batches += 1;
                    continuation = continuation.max(analysis.continuation);
                    extracted.extend(analysis.nodes.iter().map(|n| name_key(n)));
                }
                Err(err) => {
                    let message = err.to_string();
                    let max_attempts = self.config.max_attempts;
                    let requeued = self
                        .store
                        .run_records(move |conn| queue::requeue_failed(conn, &ids, &message, max_attempts))
                        .await;
                    match requeued {
                        Ok(r) => {
                            outcome.failed += r.retried.len();
                            outcome.dropped += r.dropped.len();
                        }
                        Err(requeue_err) => {
                            tracing::error!(conversation = %conversation_id, error = %requeue_err, "failed to requeue batch");
                        }
                    }
                    if !err.is_transient() {
                        return Err(err);
                    }
                    tracing::warn!(conversation = %conversation_id, error = %err, "analysis failed, batch requeued");
                    break;
                }
            }
        }

        let should_reply = if force_reply {
            true
        } else if outcome.batches > 0 {
            let context = self.reply_context(conversation_id, extracted, continuation).await?;
            self.policy.should_reply(&context)
        } else {
            false
        };
        if should_reply {
            let reply = self.prepare_reply(conversation_id, force_reply).await;
            if force_reply {
                outcome.reply = reply;
            } else if let Some(reply) = reply {
                outcome.delivered = self.deliver(reply).await;
            }
        }

        tracing::debug!(
            conversation = %conversation_id,
            processed = outcome.processed,
            failed = outcome.failed,
            dropped = outcome.dropped,
            replied = outcome.reply.is_some() || outcome.delivered,
            "conversation processed"
        );
        Ok(outcome)
    }

    async fn process_batch(&self, conversation_id: &str, batch: Vec<QueueEntry>) -> Result<Analysis> {
        let conv = conversation_id.to_string();
        let history_size = self.config.queue.history_size;
        let context: Vec<QueueEntry> = self
            .store
            .run_records(move |conn| queue::recent_history(conn, &conv, history_size))
            .await?
            .into_iter()
            .filter(|e| e.state == QueueState::Processed)
            .collect();

        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        let request = AnalysisRequest {
            conversation_id: conversation_id.to_string(),
            messages: batch,
            context,
        };
        let timeout = self.config.analysis_timeout;
        let analysis = tokio::time::timeout(timeout, self.analyzer.analyze(request))
            .await
            .map_err(|_| PersonaError::Timeout(timeout))??
            .validated();

        self.apply_analysis(conversation_id, ids, &analysis).await?;
        Ok(analysis)
    }

    /// Write an analysis into both stores and acknowledge its batch.
    async fn apply_analysis(&self, conversation_id: &str, ids: Vec<i64>, analysis: &Analysis) -> Result<()> {
        let now = Utc::now();
        let scope = Scope::conversation(conversation_id);
        let nodes_config = self.config.nodes.clone();
        let names = analysis.nodes.clone();
        let pairs = analysis.associations.clone();

        // Checked before the graph write so a rejected summary leaves no trace.
        let mut new_memory = (!analysis.summary.is_empty()).then(|| NewMemory {
            conversation_id: conversation_id.to_string(),
            content: analysis.summary.clone(),
            importance: analysis.importance,
            node_ids: Vec::new(),
            permanent: false,
        });
        if let Some(new_memory) = &new_memory {
            new_memory.validate()?;
        }

        let node_ids = self
            .store
            .run_graph(move |conn| {
                let tx = conn.transaction()?;
                let mut by_key: HashMap<String, String> = HashMap::new();
                for name in &names {
                    let node = graph::upsert_node(&tx, &scope, name, &nodes_config, now)?;
                    by_key.insert(node.name_key, node.id);
                }
                for (a, b) in &pairs {
                    let (Some(source), Some(target)) = (by_key.get(&name_key(a)), by_key.get(&name_key(b))) else {
                        continue;
                    };
                    let delta = nodes_config.association_delta;
                    graph::upsert_association(&tx, source, target, delta, &nodes_config, now)?;
                    graph::upsert_association(&tx, target, source, delta, &nodes_config, now)?;
                }
                tx.commit()?;
                let mut ids: Vec<String> = by_key.into_values().collect();
                ids.sort();
                Ok(ids)
            })
            .await?;

        if let Some(new_memory) = new_memory.as_mut() {
            new_memory.node_ids = node_ids;
        }
        let history_size = self.config.queue.history_size;
        self.store
            .run_records(move |conn| {
                if let Some(new_memory) = &new_memory {
                    records::create_memory(conn, new_memory, now)?;
                }
                queue::ack(conn, &ids, history_size)?;
                Ok(())
            })
            .await
    }

    async fn reply_context(&self, conversation_id: &str, extracted: Vec<String>, continuation: f64) -> Result<ReplyContext> {
        let scope = Scope::conversation(conversation_id);
        let top = self.config.policy.active_node_count;
        let active_nodes = self
            .store
            .run_graph(move |conn| graph::get_top_nodes(conn, &scope, top))
            .await?
            .into_iter()
            .map(|n| n.name_key)
            .collect();

        let conv = conversation_id.to_string();
        let last_reply = self
            .store
            .run_records(move |conn| queue::last_reply_at(conn, &conv))
            .await?;
        let now = Utc::now();

        Ok(ReplyContext {
            conversation_id: conversation_id.to_string(),
            extracted_nodes: extracted,
            active_nodes,
            continuation,
            minutes_since_last_reply: last_reply.map(|at| hours_between(&at, now) * 60.0),
        })
    }

    /// Hand an autonomous reply to the sink and record it once accepted.
    async fn deliver(&self, reply: Reply) -> bool {
        let conversation_id = reply.conversation_id.clone();
        let content = reply.content.clone();
        if let Err(err) = self.sink.deliver(reply).await {
            tracing::warn!(conversation = %conversation_id, error = %err, "autonomous reply not delivered");
            return false;
        }
        if let Err(err) = self.record_reply(&conversation_id, content).await {
            tracing::error!(conversation = %conversation_id, error = %err, "failed to record delivered reply");
        }
        true
    }

    /// Build a reply. Failures are logged; a priority request still gets the fallback text.
    ///
    /// Priority replies are recorded here, since the caller receives them
    /// directly. Autonomous ones are recorded by [`Self::deliver`].
    async fn prepare_reply(&self, conversation_id: &str, priority: bool) -> Option<Reply> {
        match self.try_reply(conversation_id, priority).await {
            Ok(Some(content)) => {
                if priority {
                    if let Err(err) = self.record_reply(conversation_id, content.clone()).await {
                        tracing::error!(conversation = %conversation_id, error = %err, "failed to record reply");
                    }
                }
                Some(Reply {
                    conversation_id: conversation_id.to_string(),
                    content,
                    degraded: false,
                })
            }
            Ok(None) => None,
            Err(err) => {
                tracing::error!(conversation = %conversation_id, error = %err, "reply preparation failed");
                if !priority {
                    return None;
                }
                let fallback = self.config.policy.fallback_reply.clone();
                if let Err(record_err) = self.record_reply(conversation_id, fallback.clone()).await {
                    tracing::error!(conversation = %conversation_id, error = %record_err, "failed to record fallback reply");
                }
                Some(Reply {
                    conversation_id: conversation_id.to_string(),
                    content: fallback,
                    degraded: true,
                })
            }
        }
    }

    async fn try_reply(&self, conversation_id: &str, priority: bool) -> Result<Option<String>> {
        let conv = conversation_id.to_string();
        let limit = self.config.policy.history_for_reply;
        let history = self
            .store
            .run_records(move |conn| queue::recent_history(conn, &conv, limit))
            .await?;
        let texts: Vec<String> = history.iter().filter(|e| !e.is_bot).map(|e| e.content.clone()).collect();

        let retriever = self.retriever.clone();
        let conv = conversation_id.to_string();
        let recall_limit = self.config.retrieval.default_limit;
        let recall = self
            .store
            .run(move |graph_conn, records_conn| {
                retriever.retrieve_for_context(
                    graph_conn,
                    records_conn,
                    &conv,
                    &texts,
                    recall_limit,
                    AccessMode::Reinforce,
                    Utc::now(),
                )
            })
            .await?;

        let request = ReplyRequest {
            conversation_id: conversation_id.to_string(),
            history,
            recall,
            priority,
        };
        let timeout = self.config.analysis_timeout;
        let reply = tokio::time::timeout(timeout, self.responder.respond(request))
            .await
            .map_err(|_| PersonaError::Timeout(timeout))??;

        Ok(reply.filter(|c| !c.trim().is_empty()))
    }

    async fn record_reply(&self, conversation_id: &str, content: String) -> Result<i64> {
        let conv = conversation_id.to_string();
        let history_size = self.config.queue.history_size;
        self.store
            .run_records(move |conn| queue::record_reply(conn, &conv, &content, history_size, Utc::now()))
            .await
    }

    /// Process every conversation with pending entries, in parallel.
    pub async fn run_batch_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let conversations = self.store.run_records(|conn| queue::pending_conversations(conn)).await?;

        let mut tasks = JoinSet::new();
        for conversation_id in conversations {
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let result = engine.process_conversation(&conversation_id, false).await;
                (conversation_id, result)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.conversations += 1;
                    report.processed += outcome.processed;
                    report.failed += outcome.failed;
                    report.dropped += outcome.dropped;
                    report.delivered += usize::from(outcome.delivered);
                }
                Ok((conversation_id, Err(err))) => {
                    report.errors += 1;
                    tracing::error!(conversation = %conversation_id, error = %err, "batch cycle failed");
                }
                Err(err) => {
                    report.errors += 1;
                    tracing::error!(error = %err, "batch task panicked");
                }
            }
        }

        if report.conversations > 0 || report.errors > 0 {
            tracing::info!(
                conversations = report.conversations,
                processed = report.processed,
                failed = report.failed,
                dropped = report.dropped,
                errors = report.errors,
                delivered = report.delivered,
                "batch cycle complete"
            );
        }
        Ok(report)
    }

    /// Process queued entries now instead of waiting for the scheduler.
    pub async fn force_process(&self, conversation_id: &str) -> Result<ProcessOutcome> {
        tracing::info!(conversation = %conversation_id, "forced processing");
        self.process_conversation(conversation_id, false).await
    }

    pub async fn state(&self, conversation_id: &str) -> Result<ConversationState> {
        let processing = self
            .processing
            .lock()
            .map_err(|e| PersonaError::LockPoisoned(format!("processing set: {e}")))?
            .contains(conversation_id);
        if processing {
            return Ok(ConversationState::Processing);
        }

        let conv = conversation_id.to_string();
        let pending = self
            .store
            .run_records(move |conn| queue::pending_count(conn, &conv))
            .await?;
        Ok(if pending > 0 {
            ConversationState::Queued
        } else {
            ConversationState::Idle
        })
    }

    /// Pin a fact: a permanent node and a permanent memory linked to it.
    ///
    /// An empty `conversation_id` targets the shared graph.
    pub async fn remember(
        &self,
        conversation_id: &str,
        node_name: &str,
        content: &str,
    ) -> Result<(CognitiveNode, MemoryRecord)> {
        let mut new_memory = NewMemory {
            conversation_id: conversation_id.to_string(),
            content: content.trim().to_string(),
            importance: 1.0,
            node_ids: Vec::new(),
            permanent: true,
        };
        new_memory.validate()?;

        let now = Utc::now();
        let scope = Scope::conversation(conversation_id);
        let nodes_config = self.config.nodes.clone();
        let name = node_name.to_string();
        let node = self
            .store
            .run_graph(move |conn| graph::create_node(conn, &scope, &name, None, true, &nodes_config, now))
            .await?;

        new_memory.node_ids = vec![node.id.clone()];
        let memory = self
            .store
            .run_records(move |conn| records::create_memory(conn, &new_memory, now))
            .await?;
        tracing::info!(conversation = %conversation_id, node = %node.id, memory = %memory.id, "pinned permanent memory");
        Ok((node, memory))
    }

    /// Keyword recall that counts as use: returned memories are reinforced.
    pub async fn recall(&self, keyword: &str, scope: Scope, limit: usize) -> Result<Vec<RetrievalHit>> {
        let retriever = self.retriever.clone();
        let keyword = keyword.to_string();
        self.store
            .run(move |graph_conn, records_conn| {
                retriever.retrieve_by_keyword(
                    graph_conn,
                    records_conn,
                    &scope,
                    &keyword,
                    limit,
                    AccessMode::Reinforce,
                    Utc::now(),
                )
            })
            .await
    }
}
