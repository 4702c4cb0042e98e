//! MCP `manage_node` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `manage_node` MCP tool.
///
/// Actions: `list`, `get`, `neighbors`, `create`, `update`, `delete`, `force_delete`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ManageNodeParams {
    #[schemars(description = "One of: list, get, neighbors, create, update, delete, force_delete")]
    pub action: String,

    #[schemars(description = "Node id (get, neighbors, update, delete, force_delete)")]
    pub id: Option<String>,

    #[schemars(description = "Conversation scope for list and create. Use an empty string for the shared graph; omit for all scopes (list) or the shared graph (create).")]
    pub conversation_id: Option<String>,

    #[schemars(description = "Display name (create, update)")]
    pub name: Option<String>,

    #[schemars(description = "Activation (create, update)")]
    pub activation: Option<f64>,

    #[schemars(description = "Exempt from decay and normal deletion (create, update)")]
    pub permanent: Option<bool>,

    #[schemars(description = "Maximum results for list and neighbors (default: 50)")]
    pub limit: Option<usize>,
}
