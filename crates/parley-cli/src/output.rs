use parley_core::error::{ConfigError, ParleyError};
use parley_core::message::ConversationSummary;
use parley_core::usage::{format_cost, SessionStats, UsageRecord};
use std::io::{self, Write};
use std::time::Duration;

pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        format!("{n}")
    }
}

pub fn usage_line(usage: &UsageRecord) -> String {
    format!(
        "[tokens] in {} / out {} | cost {}",
        format_tokens(usage.input_tokens),
        format_tokens(usage.output_tokens),
        format_cost(usage.total_cost),
    )
}

pub fn print_usage(usage: &UsageRecord) {
    eprintln!("\x1b[90m{}\x1b[0m", usage_line(usage));
}

pub fn stats_lines(stats: &SessionStats) -> Vec<String> {
    vec![
        format!("Requests:       {}", stats.request_count),
        format!("Input tokens:   {}", stats.total_input_tokens),
        format!("Output tokens:  {}", stats.total_output_tokens),
        format!("Total tokens:   {}", stats.total_tokens()),
        format!("Total cost:     {}", format_cost(stats.total_cost)),
    ]
}

pub fn session_line(summary: &ConversationSummary) -> String {
    format!(
        "  {}  {}  ({} msgs, {})",
        summary.id,
        summary.title,
        summary.message_count,
        summary.updated_at.format("%Y-%m-%d %H:%M"),
    )
}

/// Retry observer output, printed before each backoff sleep.
pub fn print_retry(attempt: u32, max_retries: u32, delay: Duration) {
    eprintln!(
        "\x1b[33m[retry {}/{}] waiting {:.1}s...\x1b[0m",
        attempt,
        max_retries,
        delay.as_secs_f64()
    );
    io::stderr().flush().ok();
}

pub fn print_thinking() {
    eprint!("\x1b[90mThinking...\x1b[0m");
    io::stderr().flush().ok();
}

pub fn clear_thinking() {
    eprint!("\r\x1b[K");
    io::stderr().flush().ok();
}

/// Error line plus per-kind guidance when we have any.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("\x1b[31;1merror:\x1b[0m {err}");
    if let Some(hint) = hint_for(err) {
        eprintln!("\x1b[90m{hint}\x1b[0m");
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(parley) = err.downcast_ref::<ParleyError>() {
        return match parley {
            ParleyError::Api(api) => Some(api.hint()),
            ParleyError::Config(config) => config_hint(config),
            ParleyError::SessionNotFound(_) => Some("Run `parley sessions` to list saved conversations."),
            _ => None,
        };
    }
    err.downcast_ref::<ConfigError>().and_then(config_hint)
}

fn config_hint(err: &ConfigError) -> Option<&'static str> {
    match err {
        ConfigError::MissingPricing(_) => {
            Some("Add the model to `pricing` in your config file, or pick a known model with --model.")
        }
        _ => None,
    }
}
