use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::chat::*;
use super::error::*;
use super::message::*;
use super::model::*;
use super::provider::*;
use super::retry::{self, RetryObserver, RetryPolicy};
use super::store::StateStore;
use super::usage::*;
use super::window::*;

// ---- classification ----

#[test]
fn test_auth_statuses_are_not_retryable() {
    for status in [401, 403] {
        let err = classify(Some(RawFailure::status(status).into()));
        assert!(matches!(err, ApiError::AuthFailure { status: s, .. } if s == status));
        assert!(!err.is_retryable());
    }
}

#[test]
fn test_rate_limit_is_retryable() {
    let err = classify(Some(RawFailure::status(429).with_message("slow down").into()));
    assert_eq!(
        err,
        ApiError::RateLimited {
            message: "slow down".into()
        }
    );
    assert!(err.is_retryable());
}

#[test]
fn test_server_errors_keep_status() {
    for status in [500, 502, 503, 529, 599] {
        let err = classify(Some(RawFailure::status(status).into()));
        assert_eq!(err.status(), Some(status));
        assert!(matches!(err, ApiError::ServiceFailure { .. }));
        assert!(err.is_retryable());
    }
}

#[test]
fn test_other_client_errors_are_invalid_requests() {
    for status in [400, 404, 413, 422] {
        let err = classify(Some(RawFailure::status(status).into()));
        assert!(matches!(err, ApiError::InvalidRequest { .. }), "{status}");
        assert!(!err.is_retryable());
    }
}

#[test]
fn test_transport_codes() {
    for code in ["connection-refused", "timed-out", "ECONNREFUSED", "ETIMEDOUT"] {
        let err = classify(Some(RawFailure::transport(code).into()));
        assert!(matches!(err, ApiError::ConnectivityFailure { .. }), "{code}");
        assert!(err.is_retryable());
    }

    let err = classify(Some(RawFailure::transport("dns-failure").into()));
    assert!(matches!(err, ApiError::UnknownFailure { .. }));
    assert!(!err.is_retryable());
}

#[test]
fn test_status_takes_precedence_over_transport() {
    let raw = RawFailure {
        status: Some(401),
        transport: Some(TransportCode::TimedOut),
        message: None,
    };
    assert!(matches!(classify(Some(raw.into())), ApiError::AuthFailure { .. }));
}

#[test]
fn test_classify_is_idempotent() {
    let original = ApiError::ServiceFailure {
        status: 503,
        message: "overloaded".into(),
    };
    let again = classify(Some(original.clone().into()));
    assert_eq!(again, original);
    assert_eq!(classify(Some(again.clone().into())), again);
}

#[test]
fn test_absent_input_is_unknown() {
    let err = classify(None);
    assert_eq!(
        err,
        ApiError::UnknownFailure {
            message: "Unknown error".into()
        }
    );
    assert!(!err.is_retryable());

    let err = classify(Some(RawFailure::default().into()));
    assert_eq!(err.message(), "Unknown error");

    let err = classify(Some(RawFailure::default().with_message("boom").into()));
    assert_eq!(err.message(), "boom");
}

// ---- retry executor ----

fn policy(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms,
        max_delay_ms,
    }
}

async fn run_failing(
    policy: &RetryPolicy,
    failure: RawFailure,
) -> (Result<(), ParleyError>, usize, Vec<(u32, Duration)>) {
    let calls = AtomicUsize::new(0);
    let mut seen = Vec::new();
    let observer: RetryObserver = &mut |attempt, delay| seen.push((attempt, delay));

    let result = retry::execute(
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            let failure = failure.clone();
            async move { Err::<(), _>(failure) }
        },
        policy,
        &CancellationToken::new(),
        Some(observer),
    )
    .await;

    (result, calls.load(Ordering::SeqCst), seen)
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_make_n_plus_one_attempts() {
    for n in [0u32, 1, 3, 5] {
        let (result, calls, seen) = run_failing(&policy(n, 10, 1000), RawFailure::status(503)).await;
        assert_eq!(calls, n as usize + 1);
        assert_eq!(seen.len(), n as usize);
        let err = result.unwrap_err();
        assert!(matches!(err.api(), Some(ApiError::ServiceFailure { status: 503, .. })));
    }
}

#[tokio::test(start_paused = true)]
async fn test_observed_delays_grow_exponentially() {
    let (_, calls, seen) = run_failing(&policy(3, 1000, 8000), RawFailure::status(429)).await;
    assert_eq!(calls, 4);

    let expected = [(1, 1000), (2, 2000), (3, 4000)];
    for ((attempt, delay), (want_attempt, floor)) in seen.iter().zip(expected) {
        assert_eq!(*attempt, want_attempt);
        let ms = delay.as_millis() as u64;
        assert!(ms >= floor && ms < floor + 250, "attempt {attempt}: {ms}ms");
    }
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_capped() {
    let (_, _, seen) =
        run_failing(&policy(3, 1000, 2000), RawFailure::transport("connection-refused")).await;
    let third = seen[2].1.as_millis() as u64;
    assert!((2000..2250).contains(&third), "{third}ms");
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_fails_once() {
    let (result, calls, seen) = run_failing(&policy(5, 10, 100), RawFailure::status(401)).await;
    assert_eq!(calls, 1);
    assert!(seen.is_empty());
    assert!(matches!(result.unwrap_err().api(), Some(ApiError::AuthFailure { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_success_short_circuits() {
    let calls = AtomicUsize::new(0);
    let mut observed = 0;
    let observer: RetryObserver = &mut |_, _| observed += 1;

    let result = retry::execute(
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RawFailure::status(529))
                } else {
                    Ok("done")
                }
            }
        },
        &policy(5, 100, 1000),
        &CancellationToken::new(),
        Some(observer),
    )
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(observed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_elapsed_time_covers_backoff() {
    let start = tokio::time::Instant::now();
    run_failing(&policy(2, 1000, 8000), RawFailure::status(500)).await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(3000));
    assert!(elapsed < Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let calls = AtomicUsize::new(0);
    let observer: RetryObserver = &mut |_, _| trigger.cancel();

    let result = retry::execute(
        || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RawFailure::status(503)) }
        },
        &policy(3, 1000, 8000),
        &cancel,
        Some(observer),
    )
    .await;

    assert!(matches!(result, Err(ParleyError::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_in_flight_attempt() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let result = retry::execute(
        || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RawFailure>(())
        },
        &RetryPolicy::default(),
        &cancel,
        None,
    )
    .await;

    assert!(matches!(result, Err(ParleyError::Cancelled)));
}

#[test]
fn test_backoff_without_jitter() {
    let p = policy(10, 1000, 8000);
    assert_eq!(p.backoff(0), Duration::from_millis(1000));
    assert_eq!(p.backoff(1), Duration::from_millis(2000));
    assert_eq!(p.backoff(2), Duration::from_millis(4000));
    assert_eq!(p.backoff(3), Duration::from_millis(8000));
    assert_eq!(p.backoff(4), Duration::from_millis(8000));
    assert_eq!(p.backoff(200), Duration::from_millis(8000));
}

// ---- usage accounting ----

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

#[test]
fn test_compute_usage() {
    let pricing = ModelPricing {
        input_per_1k: 0.003,
        output_per_1k: 0.015,
    };
    let record = UsageRecord::compute(1000, 2000, &pricing);
    assert!(approx(record.input_cost, 0.003));
    assert!(approx(record.output_cost, 0.030));
    assert!(approx(record.total_cost, 0.033));
    assert_eq!(record.total_cost, record.input_cost + record.output_cost);
    assert_eq!(format_cost(record.total_cost), "$0.0330");
}

#[test]
fn test_add_usage_accumulates() {
    let mut accountant = UsageAccountant::new(default_model(), builtin_pricing(), SessionStats::default());
    let record = |total_cost| UsageRecord {
        input_tokens: 10,
        output_tokens: 20,
        input_cost: 0.0,
        output_cost: total_cost,
        total_cost,
    };
    accountant.add_usage(&record(0.01));
    accountant.add_usage(&record(0.02));

    let stats = accountant.stats();
    assert!(approx(stats.total_cost, 0.03));
    assert_eq!(stats.request_count, 2);
    assert_eq!(stats.total_input_tokens, 20);
    assert_eq!(stats.total_output_tokens, 40);
    assert_eq!(format_cost(stats.total_cost), "$0.0300");
}

#[test]
fn test_reset_zeroes_stats() {
    let loaded = SessionStats {
        total_input_tokens: 5,
        total_output_tokens: 7,
        total_cost: 1.5,
        request_count: 3,
    };
    let mut accountant = UsageAccountant::new(default_model(), builtin_pricing(), loaded);
    accountant.reset();
    assert_eq!(accountant.stats(), &SessionStats::default());
}

#[test]
fn test_missing_pricing_is_config_error() {
    let accountant = UsageAccountant::new(
        ModelId::from("mystery-model"),
        builtin_pricing(),
        SessionStats::default(),
    );
    let err = accountant.compute_usage(1, 1).unwrap_err();
    assert!(matches!(err, ConfigError::MissingPricing(ref m) if m == "mystery-model"));
}

#[test]
fn test_format_cost_rounds_to_four_places() {
    assert_eq!(format_cost(0.0), "$0.0000");
    assert_eq!(format_cost(0.00004), "$0.0000");
    assert_eq!(format_cost(1.23456), "$1.2346");
}

// ---- conversation window ----

fn window_with(n: usize) -> ConversationWindow {
    let mut window = ConversationWindow::new();
    for i in 0..n {
        let role = if i % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        window.append(role, format!("m{i}"));
    }
    window
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

#[test]
fn test_window_keeps_last_n_in_order() {
    let window = window_with(6);
    let history = HistoryConfig {
        enabled: true,
        max_messages: 4,
    };
    assert_eq!(contents(window.context_view(&history)), ["m2", "m3", "m4", "m5"]);
    assert_eq!(window.messages().len(), 6);
}

#[test]
fn test_window_never_exceeds_length() {
    let window = window_with(2);
    let history = HistoryConfig {
        enabled: true,
        max_messages: 10,
    };
    assert_eq!(contents(window.context_view(&history)), ["m0", "m1"]);
}

#[test]
fn test_window_history_disabled() {
    let history = HistoryConfig {
        enabled: false,
        max_messages: 10,
    };
    assert!(ConversationWindow::new().context_view(&history).is_empty());
    assert_eq!(contents(window_with(5).context_view(&history)), ["m4"]);
}

#[test]
fn test_window_zero_max_is_empty() {
    let history = HistoryConfig {
        enabled: true,
        max_messages: 0,
    };
    assert!(window_with(3).context_view(&history).is_empty());
}

#[test]
fn test_context_with_pending_does_not_mutate() {
    let window = window_with(3);
    let history = HistoryConfig {
        enabled: true,
        max_messages: 2,
    };
    let ctx = window.context_with(Message::user("next"), &history);
    assert_eq!(contents(&ctx), ["m2", "next"]);
    assert_eq!(window.messages().len(), 3);
}

#[test]
fn test_window_reset_assigns_new_id() {
    let mut window = window_with(3);
    let old_id = window.id().to_string();
    window.reset();
    assert_ne!(window.id(), old_id);
    assert!(window.messages().is_empty());
    let conv = window.conversation();
    assert_eq!(conv.created_at, conv.updated_at);
}

#[test]
fn test_append_updates_timestamp() {
    let mut conv = Conversation::new();
    let created = conv.created_at;
    conv.append(MessageRole::User, "hi");
    assert!(conv.updated_at >= created);
    assert_eq!(conv.messages[0].role, MessageRole::User);
}

#[test]
fn test_conversation_title() {
    let mut conv = Conversation::new();
    assert_eq!(conv.title(), "(empty)");
    conv.append(MessageRole::System, "be brief");
    conv.append(MessageRole::User, "what is rust?\nsecond line");
    assert_eq!(conv.title(), "what is rust?");
    assert_eq!(conv.summary().message_count, 2);
}

#[test]
fn test_message_role_serialization() {
    let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
    assert_eq!(json, "\"assistant\"");
    let role: MessageRole = serde_json::from_str("\"system\"").unwrap();
    assert_eq!(role, MessageRole::System);
}

// ---- chat session ----

struct ScriptedProvider {
    model: ModelId,
    script: Mutex<VecDeque<Result<ProviderResponse, Failure>>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<ProviderResponse, Failure>>) -> Arc<Self> {
        Arc::new(Self {
            model: default_model(),
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last_request(&self) -> Vec<Message> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

fn reply(text: &str, input_tokens: u64, output_tokens: u64) -> Result<ProviderResponse, Failure> {
    Ok(ProviderResponse {
        content: text.into(),
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
        stop_reason: Some("end_turn".into()),
    })
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn send(&self, messages: &[Message]) -> Result<ProviderResponse, Failure> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply("default", 1, 1))
    }

    fn model(&self) -> &ModelId {
        &self.model
    }
}

#[derive(Default)]
struct MemoryStore {
    stats: Mutex<Option<SessionStats>>,
    conversations: Mutex<HashMap<String, Conversation>>,
    fail_writes: bool,
}

impl MemoryStore {
    fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Serialization("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_stats(&self) -> Result<Option<SessionStats>, StorageError> {
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn save_stats(&self, stats: &SessionStats) -> Result<(), StorageError> {
        self.check_writable()?;
        *self.stats.lock().unwrap() = Some(stats.clone());
        Ok(())
    }

    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>, StorageError> {
        Ok(self.conversations.lock().unwrap().get(id).cloned())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        self.check_writable()?;
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .values()
            .map(Conversation::summary)
            .collect())
    }
}

fn session(provider: Arc<ScriptedProvider>, store: Arc<MemoryStore>) -> ChatSessionBuilder {
    let accountant = UsageAccountant::new(default_model(), builtin_pricing(), SessionStats::default());
    ChatSession::builder(provider, store, accountant).retry(RetryPolicy {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 100,
    })
}

#[tokio::test]
async fn test_send_commits_turns_usage_and_persists() {
    let provider = ScriptedProvider::new(vec![reply("hello!", 1000, 2000)]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store.clone()).build().unwrap();

    let answer = chat.send("hi", None).await.unwrap();
    assert_eq!(answer.content, "hello!");
    assert!(approx(answer.usage.total_cost, 0.033));

    assert_eq!(contents(chat.window().messages()), ["hi", "hello!"]);
    assert_eq!(chat.stats().request_count, 1);
    assert_eq!(contents(&provider.last_request()), ["hi"]);

    let saved = store.stats.lock().unwrap().clone().unwrap();
    assert_eq!(saved.total_input_tokens, 1000);
    let conv_id = chat.window().id().to_string();
    assert!(store.conversations.lock().unwrap().contains_key(&conv_id));
}

#[tokio::test]
async fn test_failed_send_commits_nothing() {
    let provider = ScriptedProvider::new(vec![Err(RawFailure::status(401).into())]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store.clone()).build().unwrap();

    let err = chat.send("hi", None).await.unwrap_err();
    assert!(matches!(err.api(), Some(ApiError::AuthFailure { .. })));
    assert_eq!(provider.calls(), 1);
    assert!(chat.window().messages().is_empty());
    assert_eq!(chat.stats(), &SessionStats::default());
    assert!(store.stats.lock().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_send_retries_transient_failures() {
    let provider = ScriptedProvider::new(vec![
        Err(RawFailure::status(529).into()),
        Err(RawFailure::transport("timed-out").into()),
        reply("finally", 10, 10),
    ]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store).build().unwrap();

    let mut retries = Vec::new();
    let observer: RetryObserver = &mut |attempt, _| retries.push(attempt);
    let answer = chat.send("hi", Some(observer)).await.unwrap();

    assert_eq!(answer.content, "finally");
    assert_eq!(provider.calls(), 3);
    assert_eq!(retries, [1, 2]);
    assert_eq!(chat.stats().request_count, 1);
}

#[tokio::test]
async fn test_reply_survives_persistence_failure() {
    let provider = ScriptedProvider::new(vec![reply("kept", 1000, 2000)]);
    let store = Arc::new(MemoryStore::failing());
    let mut chat = session(provider.clone(), store.clone()).build().unwrap();

    let answer = chat.send("hi", None).await.unwrap();
    assert_eq!(answer.content, "kept");
    assert!(approx(answer.usage.total_cost, 0.033));
    assert_eq!(provider.calls(), 1);
    assert_eq!(contents(chat.window().messages()), ["hi", "kept"]);
    assert_eq!(chat.stats().request_count, 1);
    assert!(store.stats.lock().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_send_commits_nothing() {
    let provider = ScriptedProvider::new(vec![
        Err(RawFailure::status(529).into()),
        reply("too late", 10, 10),
    ]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store.clone()).build().unwrap();

    let cancel = chat.cancel_token().clone();
    let observer: RetryObserver = &mut |_, _| cancel.cancel();
    let err = chat.send("hi", Some(observer)).await.unwrap_err();

    assert!(matches!(err, ParleyError::Cancelled));
    assert_eq!(provider.calls(), 1);
    assert!(chat.window().messages().is_empty());
    assert_eq!(chat.stats(), &SessionStats::default());
    assert!(store.stats.lock().unwrap().is_none());
    assert!(store.conversations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_outbound_context_uses_window_and_system_prompt() {
    let provider = ScriptedProvider::new(vec![]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store)
        .history(HistoryConfig {
            enabled: true,
            max_messages: 3,
        })
        .system_prompt(Some("be terse".into()))
        .build()
        .unwrap();

    for text in ["one", "two", "three"] {
        chat.send(text, None).await.unwrap();
    }

    let sent = provider.last_request();
    assert_eq!(sent[0].role, MessageRole::System);
    assert_eq!(contents(&sent), ["be terse", "two", "default", "three"]);
    assert_eq!(chat.window().messages().len(), 6);
}

#[tokio::test]
async fn test_resumed_conversation_continues() {
    let mut previous = Conversation::new();
    previous.append(MessageRole::User, "earlier");
    previous.append(MessageRole::Assistant, "noted");
    let id = previous.id.clone();

    let provider = ScriptedProvider::new(vec![]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider.clone(), store)
        .conversation(previous)
        .build()
        .unwrap();
    chat.send("again", None).await.unwrap();

    assert_eq!(chat.window().id(), id);
    assert_eq!(contents(&provider.last_request()), ["earlier", "noted", "again"]);
}

#[tokio::test]
async fn test_clear_resets_conversation_and_stats() {
    let provider = ScriptedProvider::new(vec![]);
    let store = Arc::new(MemoryStore::default());
    let mut chat = session(provider, store.clone()).build().unwrap();
    chat.send("hi", None).await.unwrap();
    let old_id = chat.window().id().to_string();

    chat.clear().await.unwrap();
    assert_ne!(chat.window().id(), old_id);
    assert!(chat.window().messages().is_empty());
    assert_eq!(chat.stats(), &SessionStats::default());
    assert_eq!(store.stats.lock().unwrap().clone(), Some(SessionStats::default()));
}

#[tokio::test]
async fn test_unpriced_model_fails_at_build() {
    let provider = ScriptedProvider::new(vec![]);
    let store = Arc::new(MemoryStore::default());
    let accountant = UsageAccountant::new(
        ModelId::from("unpriced"),
        builtin_pricing(),
        SessionStats::default(),
    );
    let err = ChatSession::builder(provider.clone(), store, accountant)
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, ParleyError::Config(ConfigError::MissingPricing(_))));
    assert_eq!(provider.calls(), 0);
}
