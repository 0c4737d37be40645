use anyhow::{Context, Result};
use chat_client::{ChatSession, ConnectionConfig, ConnectionObserver, DisconnectReason};
use chat_proto::{EventFrame, ServerEvent};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chat-client", about = "Command line client for the chat server")]
struct Opts {
    /// Server base URL
    #[arg(long, env = "CHAT_SERVER", default_value = "http://127.0.0.1:8787")]
    server: String,
    /// Bearer token (see `chat-server --issue-token`)
    #[arg(long, env = "CHAT_TOKEN")]
    token: String,
    /// Seconds between keepalive pings
    #[arg(long, default_value_t = 30)]
    ping_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations with unread counts
    List,
    /// Print the latest messages of a conversation
    History { conversation: Uuid },
    /// Send a text message
    Send { conversation: Uuid, text: String },
    /// Mark a conversation read
    Read { conversation: Uuid },
    /// Stay connected and print pushed events until interrupted
    Watch,
}

struct Printer;

impl ConnectionObserver for Printer {
    fn on_frame(&self, frame: &EventFrame) {
        match &frame.event {
            ServerEvent::Pong { .. } => {}
            ServerEvent::NewMessage { message } => println!(
                "[{}] {}: {}",
                message.conversation_id,
                message.sender_id,
                message.content.as_deref().unwrap_or("")
            ),
            ServerEvent::Typing {
                display_name,
                is_typing: true,
                ..
            } => println!("{display_name} is typing..."),
            other => match serde_json::to_string(other) {
                Ok(line) => println!("{line}"),
                Err(_) => println!("{other:?}"),
            },
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        eprintln!("disconnected: {reason:?}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let opts = Opts::parse();
    let mut connection = ConnectionConfig::for_server(&opts.server, opts.token.clone());
    connection.ping_interval = Duration::from_secs(opts.ping_secs);
    let session = ChatSession::start(&opts.server, connection)
        .await
        .context("sign in")?;

    match opts.command {
        Command::List => {
            for c in session.replica().conversations() {
                let name = c.name.clone().unwrap_or_else(|| {
                    c.participants
                        .iter()
                        .filter(|p| p.user_id != session.user_id())
                        .map(|p| p.display_name.clone())
                        .collect::<Vec<_>>()
                        .join(", ")
                });
                let unread = c
                    .participant(&session.user_id())
                    .map(|p| p.unread_count)
                    .unwrap_or(0);
                println!("{}  {:<30} unread {}", c.id, name, unread);
            }
        }
        Command::History { conversation } => {
            for m in session.load_history(conversation).await? {
                println!(
                    "{} {}: {}",
                    m.created_at,
                    m.sender_id,
                    m.content.as_deref().unwrap_or("")
                );
            }
        }
        Command::Send { conversation, text } => {
            let message = session.send_text(conversation, &text).await?;
            println!("{}", message.id);
        }
        Command::Read { conversation } => {
            let ids = session.rest().mark_read(conversation, None).await?;
            println!("marked {} read", ids.len());
        }
        Command::Watch => {
            session.connection().add_observer(Arc::new(Printer));
            tokio::signal::ctrl_c().await?;
        }
    }
    session.close();
    Ok(())
}
