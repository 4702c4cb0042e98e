//! MCP `ingest_message` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `ingest_message` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct IngestMessageParams {
    #[schemars(description = "Conversation (group or private chat) the message belongs to")]
    pub conversation_id: String,

    #[schemars(description = "Stable id of the sender")]
    pub sender_id: String,

    #[schemars(description = "Display name of the sender")]
    pub sender_name: Option<String>,

    #[schemars(description = "Message text")]
    pub content: String,

    /// Private chats are always answered.
    #[schemars(description = "True for a one-to-one chat with the bot (default: false)")]
    pub private: Option<bool>,

    #[schemars(description = "True if the message mentions the bot (default: false)")]
    pub mentioned: Option<bool>,
}
