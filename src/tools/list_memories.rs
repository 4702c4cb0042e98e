//! MCP `list_memories` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `list_memories` MCP tool. Read-only; never reinforces.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListMemoriesParams {
    #[schemars(description = "Conversation whose memories to list")]
    pub conversation_id: String,

    #[schemars(description = "Inclusive lower bound on creation time (RFC 3339)")]
    pub since: Option<String>,

    #[schemars(description = "Inclusive upper bound on creation time (RFC 3339)")]
    pub until: Option<String>,

    #[schemars(description = "Maximum number of memories (default: 50)")]
    pub limit: Option<usize>,

    #[schemars(description = "'newest_first' (default) or 'oldest_first'")]
    pub order: Option<String>,
}
