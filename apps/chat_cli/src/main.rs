use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use client_core::{
    channel::ChannelState, config::load_settings, ClientEvent, ClientHandle, SyncClient,
};
use shared::domain::ConversationId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{CliCommand, HELP};

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./chat_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    /// Raw `Cookie` header value carrying the session.
    #[arg(long)]
    cookie: Option<String>,
    /// Conversation to open on startup.
    #[arg(long)]
    conversation: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(cookie) = args.cookie {
        settings.auth_cookie = Some(cookie);
    }
    info!(server_url = %settings.server_url, "starting chat client");

    let client = SyncClient::new(&settings)?;
    let printer = tokio::spawn(print_events(client.subscribe_events()));
    client.start().await;
    if let Some(id) = args.conversation {
        client.select_conversation(ConversationId(id)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("! {}", err.0);
                continue;
            }
        };
        match command {
            CliCommand::ListConversations => {
                if let Err(err) = client.refresh_conversations().await {
                    println!("! {err}");
                }
            }
            CliCommand::Open { conversation_id } => {
                let outcome = client.select_conversation(conversation_id).await;
                info!(%conversation_id, ?outcome, "selection finished");
            }
            CliCommand::Typing => client.input_activity().await,
            CliCommand::Send { text } => {
                client.input_activity().await;
                if let Err(err) = client.send_message(&text).await {
                    warn!(%err, "message not sent");
                }
            }
            CliCommand::Visibility { visible } => client.set_page_visible(visible),
            CliCommand::Reconnect => client.reconnect().await,
            CliCommand::Help => println!("{HELP}"),
            CliCommand::Quit => break,
        }
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => render(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn render(event: &ClientEvent) {
    match event {
        ClientEvent::ConversationsUpdated(conversations) => {
            println!("-- {} conversations", conversations.len());
            for conversation in conversations {
                println!(
                    "   [{}] {} {}",
                    conversation.id,
                    conversation.name.as_deref().unwrap_or("(unnamed)"),
                    conversation.last_message.as_deref().unwrap_or("")
                );
            }
        }
        ClientEvent::ConversationOpened(details) => {
            println!("== {} | {}", details.title(), details.subtitle());
        }
        ClientEvent::ConversationUnavailable { conversation_id } => {
            println!("== conversation {conversation_id} is unavailable");
        }
        ClientEvent::PseudoConversationOpened {
            conversation_id,
            kind,
        } => println!("== conversation {conversation_id} is a {kind:?} listing"),
        ClientEvent::MessagesReplaced { messages, .. } => {
            for message in messages {
                println!("{}", message.preview());
            }
        }
        ClientEvent::MessageAppended { message, .. } => println!("{}", message.preview()),
        ClientEvent::TypingChanged { description, .. } => {
            if let Some(description) = description {
                println!("   ({description})");
            }
        }
        ClientEvent::UserStatusChanged {
            user_id,
            username,
            status,
        } => println!(
            "   {} is {status:?}",
            username.clone().unwrap_or_else(|| format!("user {user_id}"))
        ),
        ClientEvent::Notification(message) => println!("* {}", message.preview()),
        ClientEvent::ChannelStateChanged(state) => match state {
            ChannelState::Open => println!("   realtime connected"),
            ChannelState::ClosedGivenUp => println!("   realtime unavailable; polling"),
            _ => {}
        },
        ClientEvent::Status(text) => println!("! {text}"),
    }
}
