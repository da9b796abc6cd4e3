use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ParleyError;
use crate::message::{Conversation, Message, MessageRole};
use crate::provider::{Provider, ProviderResponse};
use crate::retry::{self, RetryObserver, RetryPolicy};
use crate::store::StateStore;
use crate::usage::{SessionStats, UsageAccountant, UsageRecord};
use crate::window::{ConversationWindow, HistoryConfig};

#[derive(Debug, Clone)]
pub struct Reply {
    pub content: String,
    pub usage: UsageRecord,
    pub stop_reason: Option<String>,
}

pub struct ChatSession {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    window: ConversationWindow,
    accountant: UsageAccountant,
    retry: RetryPolicy,
    history: HistoryConfig,
    system_prompt: Option<String>,
    persist_conversation: bool,
    cancel: CancellationToken,
}

pub struct ChatSessionBuilder {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    accountant: UsageAccountant,
    conversation: Option<Conversation>,
    retry: RetryPolicy,
    history: HistoryConfig,
    system_prompt: Option<String>,
    persist_conversation: bool,
    cancel: CancellationToken,
}

impl ChatSessionBuilder {
    pub fn conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    pub fn system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn persist_conversation(mut self, persist: bool) -> Self {
        self.persist_conversation = persist;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fails fast when the active model has no pricing.
    pub fn build(self) -> Result<ChatSession, ParleyError> {
        self.accountant.pricing()?;
        Ok(ChatSession {
            provider: self.provider,
            store: self.store,
            window: self
                .conversation
                .map(ConversationWindow::from_conversation)
                .unwrap_or_default(),
            accountant: self.accountant,
            retry: self.retry,
            history: self.history,
            system_prompt: self.system_prompt,
            persist_conversation: self.persist_conversation,
            cancel: self.cancel,
        })
    }
}

impl ChatSession {
    pub fn builder(
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
        accountant: UsageAccountant,
    ) -> ChatSessionBuilder {
        ChatSessionBuilder {
            provider,
            store,
            accountant,
            conversation: None,
            retry: RetryPolicy::default(),
            history: HistoryConfig::default(),
            system_prompt: None,
            persist_conversation: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Send one user turn. Nothing is committed unless the remote call
    /// succeeds; persistence failures after that are logged, not returned.
    pub async fn send(
        &mut self,
        text: &str,
        on_retry: Option<RetryObserver<'_>>,
    ) -> Result<Reply, ParleyError> {
        let mut outbound = self.window.context_with(Message::user(text), &self.history);
        if let Some(prompt) = &self.system_prompt {
            outbound.insert(0, Message::system(prompt.clone()));
        }

        tracing::debug!(
            conversation = self.window.id(),
            context_len = outbound.len(),
            model = %self.provider.model(),
            "sending request"
        );

        let provider = self.provider.clone();
        let response: ProviderResponse = retry::execute(
            || provider.send(&outbound),
            &self.retry,
            &self.cancel,
            on_retry,
        )
        .await?;

        let usage = self
            .accountant
            .compute_usage(response.usage.input_tokens, response.usage.output_tokens)?;

        self.window.append(MessageRole::User, text);
        self.window.append(MessageRole::Assistant, response.content.clone());
        self.accountant.add_usage(&usage);

        let reply = Reply {
            content: response.content,
            usage,
            stop_reason: response.stop_reason,
        };

        // Already billed and committed in memory.
        if let Err(e) = self.flush().await {
            tracing::warn!(conversation = self.window.id(), "failed to persist session state: {e}");
        }

        Ok(reply)
    }

    /// Start a fresh conversation and zero the stats.
    pub async fn clear(&mut self) -> Result<(), ParleyError> {
        self.window.reset();
        self.accountant.reset();
        self.store.save_stats(self.accountant.stats()).await?;
        tracing::info!(conversation = self.window.id(), "conversation cleared");
        Ok(())
    }

    pub async fn save_conversation(&self) -> Result<(), ParleyError> {
        self.store.save_conversation(self.window.conversation()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), ParleyError> {
        self.store.save_stats(self.accountant.stats()).await?;
        if self.persist_conversation {
            self.store.save_conversation(self.window.conversation()).await?;
        }
        tracing::info!(
            requests = self.accountant.stats().request_count,
            "session state flushed"
        );
        Ok(())
    }

    pub fn stats(&self) -> &SessionStats {
        self.accountant.stats()
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn history(&self) -> &HistoryConfig {
        &self.history
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Install a fresh token for the next request and return a handle to it.
    /// A cancelled token stays cancelled, so interactive loops renew per turn.
    pub fn renew_cancel_token(&mut self) -> CancellationToken {
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    pub fn model(&self) -> &crate::model::ModelId {
        self.accountant.model()
    }
}
