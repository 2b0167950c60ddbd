use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    api::{HttpConversationApi, HttpUploadService},
    ChatClient, ClientEvent, LocalIdentity, SocketTransport,
};
use shared::domain::{ConversationId, UserId};

mod config;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    display_name: Option<String>,
    /// Conversation to open on startup.
    #[arg(long)]
    conversation: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.user_id {
        settings.user_id = v;
    }
    if let Some(v) = args.display_name {
        settings.display_name = v;
    }

    let identity = LocalIdentity {
        user_id: UserId(settings.user_id),
        display_name: settings.display_name.clone(),
    };
    let api = Arc::new(HttpConversationApi::new(
        settings.server_url.clone(),
        identity.user_id,
    ));
    let uploads = Arc::new(HttpUploadService::new(
        settings.server_url.clone(),
        identity.user_id,
    ));
    let transport = SocketTransport::new(&settings.server_url, identity.user_id)?;
    transport.connect().await?;

    let client = ChatClient::new(identity, api, uploads, transport);
    client.start().await;

    let conversations = client.refresh_conversations().await?;
    for summary in &conversations {
        println!(
            "[{}] {} (unread {})",
            summary.conversation_id.0, summary.counterpart.display_name, summary.unread_count
        );
    }

    if let Some(conversation) = args.conversation {
        client
            .select_conversation(ConversationId(conversation))
            .await?;
        for message in client.messages().await {
            let sender = message.sender_name.unwrap_or_else(|| "?".into());
            println!("{sender}: {}", message.body.unwrap_or_default());
        }
    }

    let mut events = client.subscribe_events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(event) => println!("{event:?}"),
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
