pub mod ingest_message;
pub mod list_memories;
pub mod manage_association;
pub mod manage_memory;
pub mod manage_node;
pub mod memory_stats;
pub mod recall_memory;
pub mod run_decay;
pub mod take_replies;

use chrono::{DateTime, Utc};
use ingest_message::IngestMessageParams;
use list_memories::ListMemoriesParams;
use manage_association::ManageAssociationParams;
use manage_memory::ManageMemoryParams;
use manage_node::ManageNodeParams;
use memory_stats::MemoryStatsParams;
use recall_memory::RecallMemoryParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use run_decay::RunDecayParams;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use take_replies::TakeRepliesParams;
use tokio::sync::{mpsc, Mutex};

use persona::config::PersonaConfig;
use persona::coordinator::{IncomingMessage, PersonaEngine, Reply};
use persona::error::{EntityKind, PersonaError};
use persona::memory::decay::DecayEngine;
use persona::memory::graph::{self, NodeUpdate};
use persona::memory::records::{self, ListQuery, MemoryUpdate, SortOrder};
use persona::memory::stats;
use persona::memory::types::Scope;

const MAX_RECALL: usize = 50;
const DEFAULT_TAKE: usize = 20;

/// Autonomous replies waiting for the chat adapter to collect them.
pub type Outbox = Arc<Mutex<mpsc::Receiver<Reply>>>;

fn tool_error(e: PersonaError) -> String {
    e.to_string()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

fn require<'a>(value: &'a Option<String>, field: &str, action: &str) -> Result<&'a str, String> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("'{field}' is required for action '{action}'"))
}

fn parse_time(value: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>, String> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("{field} is not an RFC 3339 timestamp: {e}"))
        })
        .transpose()
}

/// The Persona MCP tool handler. Stands in for the chat adapter and the admin console.
#[derive(Clone)]
pub struct PersonaTools {
    tool_router: ToolRouter<Self>,
    engine: Arc<PersonaEngine>,
    decay: DecayEngine,
    config: Arc<PersonaConfig>,
    outbox: Outbox,
}

impl PersonaTools {
    /// Record an admin graph edit in the records store's audit log.
    async fn audit(&self, target_id: String, details: serde_json::Value) {
        let result = self
            .engine
            .store()
            .run_records(move |conn| records::record_admin_action(conn, &target_id, &details))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to write admin audit row");
        }
    }
}

#[tool_router]
impl PersonaTools {
    pub fn new(engine: Arc<PersonaEngine>, decay: DecayEngine, config: Arc<PersonaConfig>, outbox: Outbox) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
            decay,
            config,
            outbox,
        }
    }

    /// Feed a chat message to the bot.
    #[tool(description = "Deliver a chat message. Private chats and mentions are processed at once and answered; other messages wait for the batch cycle.")]
    async fn ingest_message(
        &self,
        Parameters(params): Parameters<IngestMessageParams>,
    ) -> Result<String, String> {
        if params.content.trim().is_empty() {
            return Err("content must not be empty".into());
        }
        let conversation_id = params.conversation_id.clone();
        let message = IncomingMessage {
            conversation_id: params.conversation_id,
            sender_name: params.sender_name.unwrap_or_else(|| params.sender_id.clone()),
            sender_id: params.sender_id,
            content: params.content,
            is_private: params.private.unwrap_or(false),
            is_mentioned: params.mentioned.unwrap_or(false),
        };

        tracing::info!(
            conversation = %conversation_id,
            priority = message.is_priority(),
            "ingest_message called"
        );

        let reply = self.engine.handle_message(message).await.map_err(tool_error)?;
        let state = self.engine.state(&conversation_id).await.map_err(tool_error)?;
        to_json(&json!({ "reply": reply, "state": state }))
    }

    /// Collect replies the bot decided to send on its own.
    #[tool(description = "Collect replies the bot decided to send on its own during batch processing. Each reply is returned once.")]
    async fn take_replies(
        &self,
        Parameters(params): Parameters<TakeRepliesParams>,
    ) -> Result<String, String> {
        let limit = params.limit.unwrap_or(DEFAULT_TAKE).max(1);
        let mut outbox = self.outbox.lock().await;
        let mut replies = Vec::new();
        while replies.len() < limit {
            match outbox.try_recv() {
                Ok(reply) => replies.push(reply),
                Err(_) => break,
            }
        }
        tracing::info!(taken = replies.len(), "take_replies called");
        to_json(&json!({ "total": replies.len(), "replies": replies }))
    }

    /// Keyword recall as the bot would use it.
    #[tool(description = "Recall nodes and memories related to a keyword. Returned memories are reinforced.")]
    async fn recall_memory(
        &self,
        Parameters(params): Parameters<RecallMemoryParams>,
    ) -> Result<String, String> {
        let limit = params
            .limit
            .unwrap_or(self.config.retrieval.default_limit)
            .clamp(1, MAX_RECALL);
        let scope = params
            .conversation_id
            .map(Scope::conversation)
            .unwrap_or(Scope::Shared);

        tracing::info!(keyword = %params.keyword, scope = %scope, limit, "recall_memory called");

        let hits = self
            .engine
            .recall(&params.keyword, scope, limit)
            .await
            .map_err(tool_error)?;
        to_json(&json!({ "total": hits.len(), "results": hits }))
    }

    /// Browse a conversation's memories without touching them.
    #[tool(description = "List a conversation's memories in a time window. Read-only.")]
    async fn list_memories(
        &self,
        Parameters(params): Parameters<ListMemoriesParams>,
    ) -> Result<String, String> {
        let order: SortOrder = match params.order {
            Some(order) => serde_json::from_value(serde_json::Value::String(order))
                .map_err(|_| "order must be 'newest_first' or 'oldest_first'".to_string())?,
            None => SortOrder::default(),
        };
        let query = ListQuery {
            since: parse_time(params.since.as_deref(), "since")?,
            until: parse_time(params.until.as_deref(), "until")?,
            limit: params.limit.unwrap_or(ListQuery::default().limit),
            order,
        };
        let conversation_id = params.conversation_id;

        let memories = self
            .engine
            .store()
            .run_records(move |conn| records::list_by_conversation(conn, &conversation_id, &query))
            .await
            .map_err(tool_error)?;
        to_json(&json!({ "total": memories.len(), "memories": memories }))
    }

    /// Admin edits on memory records.
    #[tool(description = "Inspect, pin, edit or delete memories. Actions: get, remember, update, delete, delete_range. remember creates a permanent node and a permanent memory linked to it.")]
    async fn manage_memory(
        &self,
        Parameters(params): Parameters<ManageMemoryParams>,
    ) -> Result<String, String> {
        let action = params.action.as_str();
        tracing::info!(action, id = ?params.id, "manage_memory called");
        let store = self.engine.store();

        match action {
            "get" => {
                let id = require(&params.id, "id", action)?.to_string();
                let memory = store
                    .run_records(move |conn| records::get_memory(conn, &id))
                    .await
                    .map_err(tool_error)?;
                to_json(&memory)
            }
            "remember" => {
                let node_name = require(&params.node_name, "node_name", action)?;
                let content = require(&params.content, "content", action)?;
                let conversation_id = params.conversation_id.as_deref().unwrap_or("");
                let (node, memory) = self
                    .engine
                    .remember(conversation_id, node_name, content)
                    .await
                    .map_err(tool_error)?;
                self.audit(
                    node.id.clone(),
                    json!({ "action": "remember", "memory_id": memory.id }),
                )
                .await;
                to_json(&json!({ "node": node, "memory": memory }))
            }
            "update" => {
                let id = require(&params.id, "id", action)?.to_string();
                let update = MemoryUpdate {
                    content: params.content,
                    weight: params.weight,
                    permanent: params.permanent,
                };
                let memory = store
                    .run_records(move |conn| records::update_memory(conn, &id, &update))
                    .await
                    .map_err(tool_error)?;
                to_json(&memory)
            }
            "delete" => {
                let id = require(&params.id, "id", action)?.to_string();
                let deleted = id.clone();
                store
                    .run_records(move |conn| records::delete_memory(conn, &id))
                    .await
                    .map_err(tool_error)?;
                to_json(&json!({ "deleted": deleted }))
            }
            "delete_range" => {
                let conversation_id = require(&params.conversation_id, "conversation_id", action)?.to_string();
                let since = parse_time(params.since.as_deref(), "since")?
                    .ok_or_else(|| "'since' is required for action 'delete_range'".to_string())?;
                let until = parse_time(params.until.as_deref(), "until")?
                    .ok_or_else(|| "'until' is required for action 'delete_range'".to_string())?;
                let deleted = store
                    .run_records(move |conn| records::delete_by_time_range(conn, &conversation_id, since, until))
                    .await
                    .map_err(tool_error)?;
                to_json(&json!({ "deleted": deleted }))
            }
            other => Err(format!(
                "unknown action '{other}'. Valid: get, remember, update, delete, delete_range"
            )),
        }
    }

    /// Admin operations on cognitive nodes.
    #[tool(description = "Inspect and edit cognitive nodes. Actions: list, get, neighbors, create, update, delete, force_delete. create never boosts an existing node. Permanent nodes need force_delete.")]
    async fn manage_node(
        &self,
        Parameters(params): Parameters<ManageNodeParams>,
    ) -> Result<String, String> {
        let action = params.action.as_str();
        let limit = params.limit.unwrap_or(50);
        tracing::info!(action, id = ?params.id, "manage_node called");
        let store = self.engine.store();

        match action {
            "list" => {
                let scope = params.conversation_id.clone().map(Scope::conversation);
                let nodes = store
                    .run_graph(move |conn| graph::list_nodes(conn, scope.as_ref(), limit))
                    .await
                    .map_err(tool_error)?;
                to_json(&json!({ "total": nodes.len(), "nodes": nodes }))
            }
            "get" => {
                let id = require(&params.id, "id", action)?.to_string();
                let node = store
                    .run_graph(move |conn| graph::get_node(conn, &id))
                    .await
                    .map_err(tool_error)?;
                to_json(&node)
            }
            "neighbors" => {
                let id = require(&params.id, "id", action)?.to_string();
                let neighbors = store
                    .run_graph(move |conn| graph::neighbors(conn, &id, limit))
                    .await
                    .map_err(tool_error)?;
                let neighbors: Vec<_> = neighbors
                    .into_iter()
                    .map(|(association, node)| json!({ "association": association, "node": node }))
                    .collect();
                to_json(&neighbors)
            }
            "create" => {
                let name = require(&params.name, "name", action)?.to_string();
                let scope = Scope::conversation(params.conversation_id.clone().unwrap_or_default());
                let (activation, permanent) = (params.activation, params.permanent.unwrap_or(false));
                let nodes_config = self.config.nodes.clone();
                let node = store
                    .run_graph(move |conn| {
                        graph::create_node(conn, &scope, &name, activation, permanent, &nodes_config, Utc::now())
                    })
                    .await
                    .map_err(tool_error)?;
                self.audit(
                    node.id.clone(),
                    json!({ "action": "create_node", "name": node.name, "scope": node.scope.as_key() }),
                )
                .await;
                to_json(&node)
            }
            "update" => {
                let id = require(&params.id, "id", action)?.to_string();
                let update = NodeUpdate {
                    name: params.name.clone(),
                    activation: params.activation,
                    permanent: params.permanent,
                };
                let target = id.clone();
                let node = store
                    .run_graph(move |conn| graph::update_node(conn, &id, &update))
                    .await
                    .map_err(tool_error)?;
                self.audit(
                    target,
                    json!({
                        "action": "update_node",
                        "name": params.name,
                        "activation": params.activation,
                        "permanent": params.permanent,
                    }),
                )
                .await;
                to_json(&node)
            }
            "delete" | "force_delete" => {
                let id = require(&params.id, "id", action)?.to_string();
                let force = action == "force_delete";
                let target = id.clone();
                store
                    .run_graph(move |conn| {
                        if force {
                            graph::force_delete_node(conn, &id)
                        } else {
                            graph::delete_node(conn, &id)
                        }
                    })
                    .await
                    .map_err(tool_error)?;
                self.audit(target.clone(), json!({ "action": action })).await;
                to_json(&json!({ "deleted": target }))
            }
            other => Err(format!(
                "unknown action '{other}'. Valid: list, get, neighbors, create, update, delete, force_delete"
            )),
        }
    }

    /// Admin operations on associations.
    #[tool(description = "Inspect and edit the directed edge source -> target. Actions: get, strengthen, set, delete.")]
    async fn manage_association(
        &self,
        Parameters(params): Parameters<ManageAssociationParams>,
    ) -> Result<String, String> {
        let action = params.action.as_str();
        tracing::info!(action, source = %params.source_id, target = %params.target_id, "manage_association called");
        let store = self.engine.store();
        let (source, target) = (params.source_id.clone(), params.target_id.clone());
        let edge = format!("{}->{}", params.source_id, params.target_id);

        match action {
            "get" => {
                let association = store
                    .run_graph(move |conn| graph::get_association(conn, &source, &target))
                    .await
                    .map_err(tool_error)?
                    .ok_or_else(|| tool_error(PersonaError::not_found(EntityKind::Association, edge)))?;
                to_json(&association)
            }
            "strengthen" => {
                let nodes = self.config.nodes.clone();
                let delta = params.strength.unwrap_or(nodes.association_delta);
                let association = store
                    .run_graph(move |conn| {
                        graph::upsert_association(conn, &source, &target, delta, &nodes, Utc::now())
                    })
                    .await
                    .map_err(tool_error)?;
                self.audit(edge, json!({ "action": "strengthen", "delta": delta })).await;
                to_json(&association)
            }
            "set" => {
                let strength = params
                    .strength
                    .ok_or_else(|| "'strength' is required for action 'set'".to_string())?;
                let association = store
                    .run_graph(move |conn| {
                        graph::set_association_strength(conn, &source, &target, strength, Utc::now())
                    })
                    .await
                    .map_err(tool_error)?;
                self.audit(edge, json!({ "action": "set", "strength": strength })).await;
                to_json(&association)
            }
            "delete" => {
                store
                    .run_graph(move |conn| graph::delete_association(conn, &source, &target))
                    .await
                    .map_err(tool_error)?;
                self.audit(edge.clone(), json!({ "action": "delete_association" })).await;
                to_json(&json!({ "deleted": edge }))
            }
            other => Err(format!(
                "unknown action '{other}'. Valid: get, strengthen, set, delete"
            )),
        }
    }

    /// Run a decay pass now.
    #[tool(description = "Run one decay pass over nodes, associations and memories, optionally processing the queue first.")]
    async fn run_decay(
        &self,
        Parameters(params): Parameters<RunDecayParams>,
    ) -> Result<String, String> {
        tracing::info!(process_queue = ?params.process_queue, "run_decay called");

        let cycle = if params.process_queue.unwrap_or(false) {
            Some(self.engine.run_batch_cycle().await.map_err(tool_error)?)
        } else {
            None
        };

        match self.decay.run_pass().await.map_err(tool_error)? {
            Some(report) => to_json(&json!({ "status": "completed", "batch_cycle": cycle, "report": report })),
            None => to_json(&json!({
                "status": "skipped",
                "batch_cycle": cycle,
                "message": "a decay pass is already running"
            })),
        }
    }

    /// Get statistics about both stores.
    #[tool(description = "Get memory statistics: node, association, memory and queue counts, means and storage size.")]
    async fn memory_stats(
        &self,
        Parameters(params): Parameters<MemoryStatsParams>,
    ) -> Result<String, String> {
        let store = self.engine.store();
        let paths = store
            .paths()
            .map(|(records_path, graph_path)| (records_path.to_path_buf(), graph_path.to_path_buf()));
        let conversation = params.conversation_id;

        let response = store
            .run(move |graph_conn, records_conn| {
                stats::memory_stats(
                    graph_conn,
                    records_conn,
                    conversation.as_deref(),
                    paths.as_ref().map(|(r, g)| (r.as_path(), g.as_path())),
                )
            })
            .await
            .map_err(tool_error)?;
        to_json(&response)
    }
}

#[tool_handler]
impl ServerHandler for PersonaTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Persona is a chat bot memory engine. Use ingest_message to deliver chat messages, \
                 take_replies to collect what the bot says on its own, recall_memory to look \
                 things up, and manage_node / manage_association / manage_memory to inspect \
                 and edit memory."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_missing_and_empty() {
        assert_eq!(require(&Some("n1".into()), "id", "get").unwrap(), "n1");
        assert!(require(&None, "id", "get").unwrap_err().contains("'id'"));
        assert!(require(&Some(String::new()), "id", "get").is_err());
    }

    #[test]
    fn parse_time_accepts_offsets() {
        let t = parse_time(Some("2024-03-01T12:00:00+02:00"), "since").unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(parse_time(None, "since").unwrap().is_none());
        assert!(parse_time(Some("yesterday"), "since").is_err());
    }
}
