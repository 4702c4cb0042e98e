//! OpenAI-compatible chat completions client.
//!
//! Implements both [`Analyzer`] and [`Responder`] against any server exposing
//! `/v1/chat/completions`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::coordinator::analysis::{Analysis, AnalysisRequest, Analyzer, ReplyRequest, Responder};
use crate::error::{PersonaError, Result};
use crate::memory::types::QueueEntry;

const ANALYSIS_PROMPT: &str = "You analyse group chat history for a chat bot's memory. \
Return only a JSON object with these fields:\n\
- nodes: list of specific keywords or entities mentioned, one entry per mention\n\
- associations: list of [keyword, keyword] pairs that were discussed together in the same message\n\
- summary: one or two sentences worth remembering, with user names in [brackets]; empty if nothing is worth remembering\n\
- importance: 0.0 to 1.0, how worth remembering the summary is\n\
- continuation: 0.0 to 1.0, how likely the conversation continues in a way the bot could join\n\
Lines marked (context) were already analysed; only extract from the other lines.";

const REPLY_PROMPT: &str = "You are a member of this chat. Reply in one short, natural message. \
Use the remembered facts below only when they are relevant. If you have nothing useful to add, reply with an empty message.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    config: AnalysisConfig,
}

fn format_line(entry: &QueueEntry, context: bool) -> String {
    let speaker = if entry.is_bot {
        "you"
    } else if entry.sender_name.is_empty() {
        entry.sender_id.as_str()
    } else {
        entry.sender_name.as_str()
    };
    let time = entry.arrived_at.get(..16).unwrap_or(&entry.arrived_at);
    let marker = if context { " (context)" } else { "" };
    format!("[{time}] [{speaker}]{marker}: {}", entry.content)
}

impl OpenAiClient {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(PersonaError::Config(
                "analysis.api_key is empty; set PERSONA_API_KEY or OPENAI_API_KEY".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PersonaError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    async fn complete(&self, messages: Vec<ChatMessage>, temperature: f64) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url());
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PersonaError::Analysis(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PersonaError::Analysis(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiError>(&body) {
                return Err(PersonaError::Analysis(format!("API error: {}", error.error.message)));
            }
            return Err(PersonaError::Analysis(format!("API error ({status}): {body}")));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| PersonaError::Analysis(format!("failed to parse response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PersonaError::Analysis("no choices in response".into()))
    }
}

#[async_trait]
impl Analyzer for OpenAiClient {
    async fn analyze(&self, request: AnalysisRequest) -> Result<Analysis> {
        let mut lines: Vec<String> = request.context.iter().map(|e| format_line(e, true)).collect();
        lines.extend(request.messages.iter().map(|e| format_line(e, false)));

        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: ANALYSIS_PROMPT.into(),
            },
            ChatMessage {
                role: "user".into(),
                content: format!("Chat history:\n{}", lines.join("\n")),
            },
        ];

        let raw = self.complete(messages, self.config.temperature).await?;
        tracing::debug!(conversation = %request.conversation_id, response = %raw, "analysis response");
        Analysis::parse_payload(&raw)
    }
}

#[async_trait]
impl Responder for OpenAiClient {
    async fn respond(&self, request: ReplyRequest) -> Result<Option<String>> {
        let mut system = REPLY_PROMPT.to_string();
        if !request.recall.memories.is_empty() {
            system.push_str("\n\nRemembered facts:");
            for scored in &request.recall.memories {
                system.push_str("\n- ");
                system.push_str(&scored.memory.content);
            }
        }
        if !request.recall.nodes.is_empty() {
            let topics: Vec<&str> = request.recall.nodes.iter().map(|n| n.node.name.as_str()).collect();
            system.push_str("\n\nTopics on your mind: ");
            system.push_str(&topics.join(", "));
        }

        let mut messages = vec![ChatMessage {
            role: "system".into(),
            content: system,
        }];
        for entry in &request.history {
            messages.push(ChatMessage {
                role: if entry.is_bot { "assistant" } else { "user" }.into(),
                content: if entry.is_bot {
                    entry.content.clone()
                } else {
                    format_line(entry, false)
                },
            });
        }

        let reply = self.complete(messages, self.config.temperature).await?;
        let reply = reply.trim();
        Ok((!reply.is_empty()).then(|| reply.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Priority, QueueState};

    fn entry(name: &str, is_bot: bool) -> QueueEntry {
        QueueEntry {
            id: 1,
            conversation_id: "g1".into(),
            sender_id: "u1".into(),
            sender_name: name.into(),
            content: "hello".into(),
            arrived_at: "2024-03-01T12:34:56.000000Z".into(),
            priority: Priority::Batched,
            state: QueueState::Processed,
            attempts: 0,
            is_bot,
            last_error: None,
        }
    }

    #[test]
    fn lines_name_speaker_and_minute() {
        assert_eq!(format_line(&entry("alice", false), false), "[2024-03-01T12:34] [alice]: hello");
        assert_eq!(format_line(&entry("", false), true), "[2024-03-01T12:34] [u1] (context): hello");
        assert_eq!(format_line(&entry("alice", true), false), "[2024-03-01T12:34] [you]: hello");
    }

    #[test]
    fn missing_key_is_config_error() {
        let err = OpenAiClient::new(AnalysisConfig::default()).err().unwrap();
        assert!(matches!(err, PersonaError::Config(_)));
    }
}
