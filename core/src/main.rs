/// Courtside chat terminal client - Main entry point
use colored::*;
use courtside_chat::{ChatClient, ChatEvent, Config, DeliveryState, Message};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let peer_id = args
        .get(3)
        .filter(|a| !a.starts_with("--"))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Usage: chat <server_addr> <user_id> <peer_id> [--token <token>]"))?;

    let client = Arc::new(ChatClient::new(config)?);
    info!("Starting chat client for {}", client.user_id());

    let printer = {
        let mut events = client.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        })
    };

    let connected = client
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("Connect failed: {}", e))?;
    println!("{} Connected as {}", "✓".green().bold(), connected.user_id.cyan());

    client.join(&peer_id).await?;

    tokio::select! {
        result = read_input(client.clone(), &peer_id) => {
            if let Err(e) = result {
                eprintln!("{} {}", "✗".red().bold(), e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received");
        }
    }

    client.dispose().await;
    let _ = printer.await;
    Ok(())
}

/// Read stdin lines: plain text is sent, slash commands manage the timeline
async fn read_input(client: Arc<ChatClient>, peer_id: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut parts = line.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("/quit"), _) => break,
            (Some("/history"), _) => {
                for message in client.snapshot(peer_id) {
                    print_message(&message);
                }
            }
            (Some("/retry"), Some(local_id)) => {
                if let Err(e) = client.retry(peer_id, local_id.trim()) {
                    eprintln!("{} {}", "✗".red().bold(), e);
                }
            }
            (Some("/remove"), Some(id)) => {
                if client.remove(peer_id, id.trim()).is_none() {
                    eprintln!("{} No message {}", "✗".red().bold(), id);
                }
            }
            (Some(""), _) | (None, _) => {}
            _ => {
                let _ = client.set_composing(peer_id, line).await;
                match client.send(peer_id, line) {
                    Ok(local_id) => println!("{} queued {}", "…".dimmed(), local_id.dimmed()),
                    Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
                }
                let _ = client.set_composing(peer_id, "").await;
            }
        }
    }

    Ok(())
}

fn print_message(message: &Message) {
    let state = match message.delivery_state {
        DeliveryState::Pending => "pending".yellow(),
        DeliveryState::Sent => "sent".green(),
        DeliveryState::Failed => "failed".red(),
    };
    println!(
        "[{}] {}: {} ({}, {})",
        message.timestamp.format("%H:%M:%S"),
        message.sender_id.cyan(),
        message.content,
        state,
        message.id.dimmed()
    );
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::NewMessage { message } => {
            if !message.originated_locally {
                print_message(message);
            }
        }
        ChatEvent::MessageUpdated { previous_id, message } => {
            if message.delivery_state == DeliveryState::Sent && previous_id != &message.id {
                println!("{} {} delivered as {}", "✓".green(), previous_id.dimmed(), message.id);
            }
        }
        ChatEvent::MessageRemoved { id, .. } => {
            println!("{} {} removed", "-".dimmed(), id.dimmed());
        }
        ChatEvent::HistoryReady { messages, .. } => {
            println!("{}", "─".repeat(60).dimmed());
            for message in messages {
                print_message(message);
            }
            println!("{}", "─".repeat(60).dimmed());
        }
        ChatEvent::TypingChanged { peer_id, typing } => {
            if *typing {
                println!("{}", format!("{} is typing…", peer_id).dimmed());
            }
        }
        ChatEvent::PresenceChanged { peer_id, online } => {
            let status = if *online { "online".green() } else { "offline".red() };
            println!("{} is {}", peer_id.cyan(), status);
        }
        ChatEvent::ConnectionStateChanged { state } => {
            println!("{} connection {}", "●".yellow(), state);
        }
        ChatEvent::SendFailed { local_id, reason, .. } => {
            eprintln!(
                "{} {} failed: {} (/retry {} or /remove {})",
                "✗".red().bold(),
                local_id,
                reason.red(),
                local_id,
                local_id
            );
        }
        ChatEvent::ServerWarning { message } => {
            eprintln!("{} server: {}", "!".yellow().bold(), message);
        }
    }
}
