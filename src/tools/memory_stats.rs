//! MCP `memory_stats` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_stats` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryStatsParams {
    /// Optional conversation to filter statistics by.
    #[schemars(description = "Optional conversation id to filter stats by")]
    pub conversation_id: Option<String>,
}
