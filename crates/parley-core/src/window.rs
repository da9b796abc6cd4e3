use serde::{Deserialize, Serialize};

use crate::message::{Conversation, Message, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_max_messages() -> usize {
    20
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_messages: default_max_messages(),
        }
    }
}

/// Trailing slice of `messages` that should be sent as context.
///
/// With history disabled only the latest message survives. With history
/// enabled and `max_messages == 0` nothing does.
pub fn sliding_window<'a>(messages: &'a [Message], history: &HistoryConfig) -> &'a [Message] {
    let keep = if history.enabled {
        history.max_messages.min(messages.len())
    } else {
        messages.len().min(1)
    };
    &messages[messages.len() - keep..]
}

/// Full conversation plus the bounded view sent with each request.
#[derive(Debug, Clone, Default)]
pub struct ConversationWindow {
    conversation: Conversation,
}

impl ConversationWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_conversation(conversation: Conversation) -> Self {
        Self { conversation }
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> &Message {
        self.conversation.append(role, content)
    }

    pub fn context_view(&self, history: &HistoryConfig) -> &[Message] {
        sliding_window(&self.conversation.messages, history)
    }

    /// Context as it would look after appending `pending`, without
    /// touching the stored conversation.
    pub fn context_with(&self, pending: Message, history: &HistoryConfig) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.conversation.messages.len() + 1);
        all.extend_from_slice(&self.conversation.messages);
        all.push(pending);
        sliding_window(&all, history).to_vec()
    }

    pub fn reset(&mut self) {
        self.conversation = Conversation::new();
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }
}
