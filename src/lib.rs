//! Memory engine for a group chat bot.
//!
//! Persona turns a stream of chat messages into two kinds of long-term memory
//! and uses them when the bot decides to speak:
//!
//! | Store | Holds | Decays |
//! |-------|-------|--------|
//! | **Graph** | Keyword nodes and weighted associations, per conversation or shared | Activation and strength, exponentially |
//! | **Records** | Summary memories linked to nodes, the message queue, the audit log | Weight, exponentially |
//!
//! # Architecture
//!
//! - **Storage**: two SQLite databases (graph and records), WAL mode, no cross-store transactions
//! - **Ingest**: a per-conversation queue; mentions and private chats skip the wait
//! - **Analysis**: an external service extracts nodes, associations and a summary from each batch
//! - **Decay**: a pure function of elapsed time, so a pass at the same instant is a no-op
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and the two-store [`db::Store`]
//! - [`memory`]: queue, node graph, memory records, decay, retrieval and repair
//! - [`coordinator`]: the persona engine, analysis boundary and reply policy
//! - [`scheduler`]: periodic decay passes and batch cycles

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod memory;
pub mod scheduler;
