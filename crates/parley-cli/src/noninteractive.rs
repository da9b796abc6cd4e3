use anyhow::Result;
use parley_core::error::ParleyError;
use parley_core::retry::RetryObserver;
use tokio_util::sync::CancellationToken;

pub async fn run(
    app: super::App,
    prompt: String,
    output_format: super::OutputFormat,
    quiet: bool,
    save: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut chat = app.session(None, save, cancel).await?;
    let max_retries = chat.retry_policy().max_retries;

    let show_progress = !quiet && matches!(output_format, super::OutputFormat::Text);
    if show_progress {
        super::output::print_thinking();
    }

    let observer: RetryObserver = &mut |attempt, delay| {
        if show_progress {
            super::output::clear_thinking();
        }
        super::output::print_retry(attempt, max_retries, delay);
    };
    let result = chat.send(&prompt, Some(observer)).await;

    if show_progress {
        super::output::clear_thinking();
    }

    match output_format {
        super::OutputFormat::Text => {
            let reply = result?;
            println!("{}", reply.content);
            if !quiet {
                super::output::print_usage(&reply.usage);
            }
            if save {
                eprintln!("Saved conversation {}", chat.window().id());
            }
        }
        super::OutputFormat::Json => match result {
            Ok(reply) => {
                let mut output = serde_json::json!({
                    "content": reply.content,
                    "stop_reason": reply.stop_reason,
                    "usage": {
                        "input_tokens": reply.usage.input_tokens,
                        "output_tokens": reply.usage.output_tokens,
                        "input_cost": reply.usage.input_cost,
                        "output_cost": reply.usage.output_cost,
                        "total_cost": reply.usage.total_cost,
                    },
                });
                if save {
                    output["conversation_id"] = serde_json::json!(chat.window().id());
                }
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Err(err) => {
                let output = match err.api() {
                    Some(api) => serde_json::json!({
                        "error": {
                            "kind": api.kind(),
                            "status": api.status(),
                            "message": api.message(),
                        }
                    }),
                    None => serde_json::json!({
                        "error": {
                            "kind": match &err {
                                ParleyError::Cancelled => "cancelled",
                                ParleyError::Config(_) => "configuration_error",
                                _ => "error",
                            },
                            "message": err.to_string(),
                        }
                    }),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
