use async_trait::async_trait;
use parley_core::error::StorageError;
use parley_core::message::{Conversation, ConversationSummary};
use parley_core::store::StateStore;
use parley_core::usage::SessionStats;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const STATS_FILE: &str = "stats.json";
const CONVERSATIONS_DIR: &str = "conversations";

/// Flat JSON files under one data directory:
///
/// ```text
/// <root>/stats.json
/// <root>/conversations/<id>.json
/// ```
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let conversations = root.join(CONVERSATIONS_DIR);
        tokio::fs::create_dir_all(&conversations)
            .await
            .map_err(|e| io_error(&conversations, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    fn conversation_path(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.root.join(CONVERSATIONS_DIR).join(format!("{id}.json")))
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn load_stats(&self) -> Result<Option<SessionStats>, StorageError> {
        let path = self.stats_path();
        match read_json(&path).await {
            Ok(stats) => Ok(stats),
            Err(StorageError::Serialization(msg)) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable stats file: {msg}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn save_stats(&self, stats: &SessionStats) -> Result<(), StorageError> {
        write_json(&self.stats_path(), stats).await
    }

    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, StorageError> {
        match self.conversation_path(id) {
            Some(path) => read_json(&path).await,
            None => Ok(None),
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let path = self.conversation_path(&conversation.id).ok_or_else(|| {
            StorageError::Serialization(format!("invalid conversation id: {}", conversation.id))
        })?;
        write_json(&path, conversation).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let dir = self.root.join(CONVERSATIONS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Conversation>(&path).await {
                Ok(Some(conversation)) => summaries.push(conversation.summary()),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), "skipping conversation: {e}"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StorageError::Serialization(format!("{}: {e}", path.display())))
}

/// Write to a `.tmp` sibling, fsync, then rename over the target.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");

    if let Err(e) = write_and_rename(&tmp, path, &json).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tracing::debug!(path = %path.display(), bytes = json.len(), "wrote state file");
    Ok(())
}

async fn write_and_rename(tmp: &Path, path: &Path, json: &[u8]) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| io_error(tmp, e))?;
    file.write_all(json).await.map_err(|e| io_error(tmp, e))?;
    file.sync_all().await.map_err(|e| io_error(tmp, e))?;
    drop(file);

    tokio::fs::rename(tmp, path)
        .await
        .map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}
