//! `courier`: line-oriented direct messaging client.
//!
//! Connects to a delivery server in real time when it can, falling back to
//! HTTP for sends otherwise. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/courier/config.toml`).
//!
//! ```bash
//! cargo run --bin courier -- --server-url http://127.0.0.1:8000 \
//!     --identity alice --token alice-secret
//! ```
//!
//! Commands: `/chat <who>`, `/status <who>`, `/unread`, `/list`,
//! `/history`, `/read`, `/quit`. Any other line is sent to the open chat.

use std::path::Path;

use clap::Parser;
use courier::client::{ChatClient, ClientEvent};
use courier::config::{CliArgs, ClientConfig};
use courier::state::{ClientStore, DeliveryState, LocalMessage};
use courier_proto::message::Identity;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they don't interleave with the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("courier starting");

    let settings = config.to_settings()?;
    let store = match config.state_file.as_deref() {
        Some(path) if path.exists() => ClientStore::load(path, settings.identity.clone())?,
        _ => ClientStore::new(settings.identity.clone()),
    }
    .with_max_body_size(settings.max_body_size);

    let (client, events) = ChatClient::with_store(settings, store)?;
    match client.connect().await {
        Ok(()) => println!("* connected as {}", client.identity()),
        Err(e) => println!("* offline, sends will use HTTP ({e})"),
    }

    let result = run(&client, events).await;

    client.disconnect().await;
    if let Some(path) = config.state_file.as_deref() {
        client.persist(path)?;
    }
    tracing::info!("courier exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(client: &ChatClient, mut events: mpsc::Receiver<ClientEvent>) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open_chat: Option<Identity> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if !handle_line(client, &mut open_chat, line.trim()).await {
                    return Ok(());
                }
            }
            Some(event) = events.recv() => print_event(&event, open_chat.as_ref()),
        }
    }
}

/// Handles one input line. Returns `false` to quit.
async fn handle_line(client: &ChatClient, open_chat: &mut Option<Identity>, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').map_or((line, ""), |(c, a)| (c, a.trim()));
    match command {
        "" => {}
        "/quit" => return false,
        "/chat" => {
            if arg.is_empty() {
                println!("* usage: /chat <identity>");
                return true;
            }
            let who = Identity::new(arg);
            match client.join_chat(&who).await {
                Ok(marked) => {
                    for m in client.conversation(&who) {
                        print_message(&m);
                    }
                    if marked > 0 {
                        println!("* marked {marked} read");
                    }
                    *open_chat = Some(who);
                }
                Err(e) => println!("* could not open chat: {e}"),
            }
        }
        "/status" => {
            let who = if arg.is_empty() { open_chat.clone() } else { Some(Identity::new(arg)) };
            let Some(who) = who else {
                println!("* usage: /status <identity>");
                return true;
            };
            match client.check_status(&who).await {
                Ok(status) if status.online => println!("* {who} is online"),
                Ok(status) => match status.last_seen {
                    Some(ts) => println!("* {who} is offline, last seen {}", format_timestamp_ms(ts.as_millis())),
                    None => println!("* {who} is offline"),
                },
                Err(e) => println!("* status check failed: {e}"),
            }
        }
        "/unread" => match client.fetch_unread().await {
            Ok(n) => println!("* fetched {n} new message(s)"),
            Err(e) => println!("* fetch failed: {e}"),
        },
        "/list" => {
            for s in client.summaries() {
                println!(
                    "  {:<16} {:>3} unread  {}",
                    s.correspondent.as_str(),
                    s.unread,
                    s.last_body
                );
            }
        }
        "/history" => match open_chat {
            Some(who) => client.conversation(who).iter().for_each(print_message),
            None => println!("* no open chat"),
        },
        "/read" => match open_chat {
            Some(who) => match client.mark_chat_read(who).await {
                Ok(n) => println!("* marked {n} read"),
                Err(e) => println!("* mark read failed: {e}"),
            },
            None => println!("* no open chat"),
        },
        _ if command.starts_with('/') => println!("* unknown command {command}"),
        _ => match open_chat {
            Some(who) => {
                if let Err(e) = client.send(who, line).await {
                    println!("* not sent: {e}");
                }
            }
            None => println!("* open a chat first with /chat <identity>"),
        },
    }
    true
}

fn print_event(event: &ClientEvent, open_chat: Option<&Identity>) {
    match event {
        ClientEvent::Connected { identity } => println!("* connected as {identity}"),
        ClientEvent::Disconnected => println!("* disconnected, sends will use HTTP"),
        ClientEvent::MessageReceived(m) => {
            let ts = format_timestamp_ms(m.sent_at.as_millis());
            if open_chat == Some(&m.sender) {
                println!("[{ts}] {}: {}", m.sender, m.body);
            } else {
                println!("* new message from {}", m.sender);
            }
        }
        ClientEvent::UnreadFlushed { count } if *count > 0 => {
            println!("* {count} message(s) arrived while you were away");
        }
        ClientEvent::DeliveryChanged {
            state: DeliveryState::Failed,
            id,
        } => println!("* message {id} failed"),
        ClientEvent::MessageRead { id } => tracing::debug!(id = %id, "read receipt"),
        ClientEvent::ServerError(reason) => println!("* server: {reason}"),
        ClientEvent::UnreadFlushed { .. } | ClientEvent::DeliveryChanged { .. } => {}
    }
}

fn print_message(m: &LocalMessage) {
    let ts = format_timestamp_ms(m.message.sent_at.as_millis());
    let marker = match (m.is_own(), m.state) {
        (true, DeliveryState::Pending) => " (sending)",
        (true, DeliveryState::Failed) => " (failed)",
        (true, DeliveryState::Sent) if m.message.read => " (read)",
        _ => "",
    };
    let who = if m.is_own() { "you" } else { m.message.sender.as_str() };
    println!("[{ts}] {who}: {}{marker}", m.message.body);
}

/// Format an epoch-millisecond timestamp as "HH:MM".
fn format_timestamp_ms(ms: u64) -> String {
    use chrono::{Local, TimeZone};
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
        _ => "??:??".to_string(),
    }
}
