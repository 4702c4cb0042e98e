//! MCP `manage_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `manage_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ManageMemoryParams {
    #[schemars(description = "One of: get, remember, update, delete, delete_range")]
    pub action: String,

    #[schemars(description = "Memory id (get, update, delete)")]
    pub id: Option<String>,

    #[schemars(description = "Conversation id (delete_range, remember). For remember, omit or use an empty string for the shared graph.")]
    pub conversation_id: Option<String>,

    #[schemars(description = "Name of the permanent node to pin the memory to (remember)")]
    pub node_name: Option<String>,

    #[schemars(description = "Memory content (remember, update)")]
    pub content: Option<String>,

    #[schemars(description = "New weight in [0, 1] (update)")]
    pub weight: Option<f64>,

    #[schemars(description = "Exempt from decay (update)")]
    pub permanent: Option<bool>,

    #[schemars(description = "Inclusive range start, RFC 3339 (delete_range)")]
    pub since: Option<String>,

    #[schemars(description = "Inclusive range end, RFC 3339 (delete_range)")]
    pub until: Option<String>,
}
