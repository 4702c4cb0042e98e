//! MCP `take_replies` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `take_replies` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TakeRepliesParams {
    #[schemars(description = "Maximum replies to collect (default: 20)")]
    pub limit: Option<usize>,
}
