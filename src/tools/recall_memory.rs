//! MCP `recall_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `recall_memory` MCP tool.
///
/// This is the bot-facing recall: every returned memory is reinforced.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecallMemoryParams {
    #[schemars(description = "Keyword to look up. Matched against node names and memory content, case-insensitively.")]
    pub keyword: String,

    /// Omit to search only the shared graph.
    #[schemars(description = "Conversation whose memory to search. Omit for the shared (public) graph.")]
    pub conversation_id: Option<String>,

    #[schemars(description = "Maximum number of results (1-50). Defaults to retrieval.default_limit.")]
    pub limit: Option<usize>,
}
