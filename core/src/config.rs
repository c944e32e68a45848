/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:7070";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Messaging server address (host:port)
    pub server_addr: String,

    /// Identity of the local user
    pub user_id: String,

    /// Session credential obtained from the auth service
    pub credential: Option<String>,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Handshake timeout (hello -> hello_ack)
    pub handshake_timeout: Duration,

    /// Peer typing indicator idle window, also used for local typing_stop
    pub typing_idle_timeout: Duration,

    /// Read silence after which the client pings the server
    pub keepalive_interval: Duration,

    /// Buffer size of the notification broadcast channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            user_id: String::new(),
            credential: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            typing_idle_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <server_addr> <user_id> [peer_id] [--token <token>] [--typing-timeout-ms <n>] [--connect-timeout-ms <n>]",
                args.first().map(String::as_str).unwrap_or("chat")
            )));
        }

        let mut config = Self {
            server_addr: args[1].clone(),
            user_id: args[2].clone(),
            ..Default::default()
        };

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--token requires a value".to_string())
                    })?;
                    config.credential = Some(token.clone());
                    i += 2;
                }
                "--typing-timeout-ms" => {
                    config.typing_idle_timeout = parse_millis(args.get(i + 1), "--typing-timeout-ms")?;
                    i += 2;
                }
                "--connect-timeout-ms" => {
                    config.connect_timeout = parse_millis(args.get(i + 1), "--connect-timeout-ms")?;
                    i += 2;
                }
                flag if flag.starts_with("--") => {
                    return Err(ChatError::Config(format!("Unknown option: {}", flag)));
                }
                // Positional arguments (peer id) are handled by the binary
                _ => {
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(token) = std::env::var("COURTSIDE_TOKEN") {
            if !token.is_empty() {
                config.credential = Some(token);
            }
        }
        if let Ok(addr) = std::env::var("COURTSIDE_SERVER") {
            if !addr.is_empty() {
                config.server_addr = addr;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface as confusing runtime failures
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(ChatError::Config("user_id must not be empty".to_string()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(ChatError::Config("server_addr must not be empty".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::Config("event_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_millis(value: Option<&String>, flag: &str) -> Result<Duration> {
    let raw = value.ok_or_else(|| ChatError::Config(format!("{} requires a value", flag)))?;
    let ms = raw
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds", flag)))?;
    Ok(Duration::from_millis(ms))
}
