//! Append-only conversation log consumed by the tool call loop.

use std::sync::{Mutex, PoisonError};

use crate::io::model::Message;

/// Where a scope's messages go. The persistence format is the sink's business.
pub trait ConversationSink: Send + Sync {
    fn append(&self, message: Message);

    /// Full history in append order.
    fn messages(&self) -> Vec<Message>;
}

/// In-memory sink used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryConversation {
    messages: Mutex<Vec<Message>>,
}

impl MemoryConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConversationSink for MemoryConversation {
    fn append(&self, message: Message) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
