use async_trait::async_trait;

use crate::error::StorageError;
use crate::message::{Conversation, ConversationSummary};
use crate::usage::SessionStats;

/// Durable home for cumulative stats and saved conversations.
///
/// Writes are expected to be atomic per file. Concurrent writers across
/// processes are last-writer-wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_stats(&self) -> Result<Option<SessionStats>, StorageError>;

    async fn save_stats(&self, stats: &SessionStats) -> Result<(), StorageError>;

    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, StorageError>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StorageError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StorageError>;
}
