//! Where replies the bot decides on by itself are sent.
//!
//! A priority reply goes back to whoever asked. An autonomous reply has no
//! caller waiting for it, so the engine hands it to a [`ReplySink`] and only
//! records it in history once the sink has accepted it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::coordinator::Reply;
use crate::error::{PersonaError, Result};

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: Reply) -> Result<()>;
}

/// Buffers replies in a bounded channel for a chat adapter to collect.
///
/// A full or closed channel refuses the reply instead of waiting.
pub struct ChannelSink {
    tx: mpsc::Sender<Reply>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReplySink for ChannelSink {
    async fn deliver(&self, reply: Reply) -> Result<()> {
        self.tx.try_send(reply).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) => {
                PersonaError::Delivery(format!("outbox full, reply for {} refused", r.conversation_id))
            }
            mpsc::error::TrySendError::Closed(r) => {
                PersonaError::Delivery(format!("outbox closed, reply for {} refused", r.conversation_id))
            }
        })
    }
}
