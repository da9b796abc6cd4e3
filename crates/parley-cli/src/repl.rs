use anyhow::Result;
use parley_core::chat::ChatSession;
use parley_core::error::ParleyError;
use parley_core::retry::RetryObserver;
use parley_core::store::StateStore;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Token of the request currently in flight, if any.
type InFlight = Arc<Mutex<Option<CancellationToken>>>;

pub async fn run(app: super::App, resume_session: Option<String>) -> Result<()> {
    let conversation = match resume_session {
        Some(id) => Some(
            app.store
                .load_conversation(&id)
                .await?
                .ok_or_else(|| ParleyError::SessionNotFound(id.clone()))?,
        ),
        None => None,
    };

    let mut chat = app.session(conversation, true, CancellationToken::new()).await?;

    println!("\x1b[1mparley\x1b[0m v{}", env!("CARGO_PKG_VERSION"));
    println!("Model: \x1b[36m{}\x1b[0m", chat.model());
    if !chat.window().messages().is_empty() {
        println!(
            "Resumed conversation {} ({} messages)",
            chat.window().id(),
            chat.window().messages().len()
        );
    }
    println!("Type \x1b[33m/help\x1b[0m for commands, \x1b[33mCtrl-D\x1b[0m to exit.\n");

    let in_flight: InFlight = Arc::new(Mutex::new(None));
    tokio::spawn(watch_interrupts(in_flight.clone()));

    loop {
        eprint!("\x1b[32;1mparley>\x1b[0m ");
        io::stderr().flush().ok();

        let input = match read_line()? {
            Some(line) => line,
            None => {
                println!("\nGoodbye!");
                break;
            }
        };
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match handle_command(&input, &mut chat).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("\x1b[31mCommand error: {e}\x1b[0m");
                    continue;
                }
            }
        }

        let token = chat.renew_cancel_token();
        set_in_flight(&in_flight, Some(token));

        let max_retries = chat.retry_policy().max_retries;
        let observer: RetryObserver = &mut |attempt, delay| {
            super::output::clear_thinking();
            super::output::print_retry(attempt, max_retries, delay);
        };
        super::output::print_thinking();
        let result = chat.send(&input, Some(observer)).await;
        super::output::clear_thinking();
        set_in_flight(&in_flight, None);

        match result {
            Ok(reply) => {
                println!("{}\n", reply.content);
                super::output::print_usage(&reply.usage);
            }
            Err(ParleyError::Cancelled) => {
                eprintln!("\x1b[33m[cancelled]\x1b[0m");
            }
            Err(err) => {
                // Stay in the loop; the turn was not committed.
                super::output::print_error(&err.into());
            }
        }
    }

    Ok(())
}

/// Ctrl-C cancels the pending request; at the prompt it exits.
async fn watch_interrupts(in_flight: InFlight) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let token = in_flight.lock().ok().and_then(|slot| slot.clone());
        match token {
            Some(token) => token.cancel(),
            None => {
                eprintln!();
                std::process::exit(130);
            }
        }
    }
}

fn set_in_flight(in_flight: &InFlight, token: Option<CancellationToken>) {
    if let Ok(mut slot) = in_flight.lock() {
        *slot = token;
    }
}

/// Read one trimmed line from stdin; `None` on EOF.
fn read_line() -> Result<Option<String>> {
    let stdin = io::stdin();
    let mut buf = Vec::new();
    match stdin.lock().read_until(b'\n', &mut buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(String::from_utf8_lossy(&buf).trim().to_string())),
        Err(e) => Err(anyhow::anyhow!("Input error: {e}")),
    }
}

async fn handle_command(input: &str, chat: &mut ChatSession) -> Result<bool> {
    match input {
        "/help" | "/h" => {
            println!("\x1b[1mCommands:\x1b[0m");
            println!("  /help       Show this help");
            println!("  /clear      Start a new conversation and reset usage stats");
            println!("  /stats      Show token usage & cost");
            println!("  /history    Show what will be sent as context");
            println!("  /save       Save the conversation and print its ID");
            println!("  /model      Show current model");
            println!("  /exit       Exit");
            Ok(true)
        }
        "/exit" | "/quit" | "/q" => {
            println!("Goodbye!");
            Ok(false)
        }
        "/clear" => {
            chat.clear().await?;
            println!("Conversation cleared. New conversation {}", chat.window().id());
            Ok(true)
        }
        "/stats" | "/cost" => {
            for line in super::output::stats_lines(chat.stats()) {
                println!("{line}");
            }
            Ok(true)
        }
        "/history" => {
            let history = *chat.history();
            let context = chat.window().context_view(&history);
            println!(
                "{} of {} messages in context (history {}, max {})",
                context.len(),
                chat.window().messages().len(),
                if history.enabled { "on" } else { "off" },
                history.max_messages,
            );
            for message in context {
                let preview: String = message.content.chars().take(70).collect();
                println!("  \x1b[90m{:>9}\x1b[0m  {}", message.role, preview.replace('\n', " "));
            }
            Ok(true)
        }
        "/save" => {
            chat.save_conversation().await?;
            println!("Saved. Resume with: parley chat --session {}", chat.window().id());
            Ok(true)
        }
        "/model" => {
            println!("Model: {}", chat.model());
            Ok(true)
        }
        _ => {
            eprintln!("Unknown command: {input}. Type /help for available commands.");
            Ok(true)
        }
    }
}
