/// Transport session: one authenticated, event-multiplexed connection to the
/// messaging server.
///
/// The session never reconnects by itself. A dropped connection moves the
/// state to `Disconnected` and the caller decides when to call `connect` again.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::protocol::{read_packet, write_packet, OutboundEvent, Packet, PROTOCOL_VERSION};
use crate::types::ConnectionState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Named event as received from the server, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub event: String,
    pub data: Value,
}

/// What the session hands to its single consumer, in the order it happened.
/// Every state transition is delivered, none are coalesced.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Inbound(RawEvent),
    StateChanged(ConnectionState),
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub user_id: String,
    pub protocol_version: u8,
}

/// Anything outbound events can be written to
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, event: OutboundEvent) -> Result<()>;
}

type SharedWriter = Arc<AsyncMutex<Option<OwnedWriteHalf>>>;

/// Transport session handle. Clones share the same connection.
#[derive(Clone)]
pub struct TransportSession {
    config: Arc<Config>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    writer: SharedWriter,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    last_activity: Arc<Mutex<Instant>>,
    /// Bumped on every connect/disconnect so stale reader tasks cannot touch state
    generation: Arc<AtomicU64>,
    disposed: Arc<AtomicBool>,
}

impl TransportSession {
    /// Create a disconnected session
    pub fn new(config: Config) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config: Arc::new(config),
            state_tx: Arc::new(state_tx),
            writer: Arc::new(AsyncMutex::new(None)),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            tasks: Arc::new(Mutex::new(Vec::new())),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            generation: Arc::new(AtomicU64::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch the current connection state. Rapid transitions may be
    /// coalesced here; the event stream carries each one.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Take the inbound event and state transition stream. Only one consumer
    /// exists per session; it stays valid across reconnects.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    /// Connect and authenticate with the configured credential.
    ///
    /// Fails fast with `ChatError::Auth` if no credential is configured or the
    /// server rejects it. No retry happens here.
    pub async fn connect(&self) -> Result<Connected> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ChatError::Network("Session has been disposed".to_string()));
        }

        let credential = match self.config.credential.as_deref() {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return Err(ChatError::Auth("Missing session credential".to_string())),
        };

        // Claim the Disconnected -> Connecting transition atomically
        let mut previous = ConnectionState::Disconnected;
        let events_tx = &self.events_tx;
        let claimed = self.state_tx.send_if_modified(|current| {
            previous = *current;
            if *current == ConnectionState::Disconnected {
                *current = ConnectionState::Connecting;
                let _ = events_tx.send(SessionEvent::StateChanged(ConnectionState::Connecting));
                true
            } else {
                false
            }
        });
        if !claimed {
            let reason = match previous {
                ConnectionState::Connected => "Already connected",
                _ => "Connect already in progress",
            };
            return Err(ChatError::Network(reason.to_string()));
        }
        debug!("Connection state -> {}", ConnectionState::Connecting);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.open(credential).await {
            Ok((connected, reader, writer)) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    // disconnect() raced with the handshake
                    return Err(ChatError::Network("Connect cancelled".to_string()));
                }
                *self.writer.lock().await = Some(writer);
                *self.last_activity.lock() = Instant::now();
                self.spawn_tasks(reader, generation);
                self.set_state(ConnectionState::Connected);
                info!(
                    "Connected to {} as {} (protocol: {})",
                    self.config.server_addr, connected.user_id, connected.protocol_version
                );
                Ok(connected)
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", self.config.server_addr, e);
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// TCP connect plus hello handshake
    async fn open(&self, credential: String) -> Result<(Connected, OwnedReadHalf, OwnedWriteHalf)> {
        let addr = self.config.server_addr.as_str();
        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ChatError::Network(format!("Connection timeout to {}", addr)))?
            .map_err(|e| ChatError::Network(format!("Failed to connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        debug!("TCP connection established to {}", addr);

        let hello = Packet::Hello {
            credential,
            user_id: self.config.user_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        write_packet(&mut stream, &hello)
            .await
            .map_err(|e| ChatError::Network(format!("Failed to send hello: {}", e)))?;

        let reply = timeout(self.config.handshake_timeout, read_packet(&mut stream))
            .await
            .map_err(|_| ChatError::Network("Handshake timeout".to_string()))??;

        let connected = match reply {
            Some(Packet::HelloAck {
                user_id,
                protocol_version,
            }) => {
                // Unusable server, same class as an unreachable one
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ChatError::Network(format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, protocol_version
                    )));
                }
                Connected {
                    user_id,
                    protocol_version,
                }
            }
            Some(Packet::HelloReject { reason }) => return Err(ChatError::Auth(reason)),
            Some(other) => {
                return Err(ChatError::Protocol(format!(
                    "Expected hello_ack, got {}",
                    other.packet_type()
                )))
            }
            None => {
                return Err(ChatError::Network(
                    "Server closed connection during handshake".to_string(),
                ))
            }
        };

        let (reader, writer) = stream.into_split();
        Ok((connected, reader, writer))
    }

    fn spawn_tasks(&self, reader: OwnedReadHalf, generation: u64) {
        let read_task = {
            let session = self.clone();
            tokio::spawn(async move { session.run_reader(reader, generation).await })
        };
        let keepalive_task = {
            let session = self.clone();
            tokio::spawn(async move { session.run_keepalive(generation).await })
        };

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(read_task);
        tasks.push(keepalive_task);
    }

    /// Read packets until the connection ends, forwarding named events
    async fn run_reader(&self, mut reader: OwnedReadHalf, generation: u64) {
        loop {
            let packet = match read_packet(&mut reader).await {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    info!("Connection closed by server");
                    break;
                }
                Err(e) => {
                    warn!("Read error, dropping connection: {}", e);
                    break;
                }
            };

            *self.last_activity.lock() = Instant::now();

            match packet {
                Packet::Event { event, data } => {
                    let inbound = SessionEvent::Inbound(RawEvent { event, data });
                    if self.events_tx.send(inbound).is_err() {
                        debug!("Event consumer gone, stopping reader");
                        break;
                    }
                }
                Packet::Ping { timestamp } => {
                    debug!("Received ping");
                    if let Err(e) = self.write(&Packet::Pong { timestamp }).await {
                        warn!("Failed to answer ping: {}", e);
                        break;
                    }
                }
                Packet::Pong { .. } => {
                    debug!("Received pong");
                }
                Packet::Close { reason } => {
                    info!("Server closed connection: {}", reason);
                    break;
                }
                other => {
                    debug!("Ignoring unexpected {} after handshake", other);
                }
            }
        }

        self.teardown(generation).await;
    }

    /// Ping the server after a period of read silence
    async fn run_keepalive(&self, generation: u64) {
        let period = self.config.keepalive_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }

            let idle = self.last_activity.lock().elapsed();
            if idle < period {
                continue;
            }

            let ping = Packet::Ping {
                timestamp: chrono::Utc::now().timestamp(),
            };
            if let Err(e) = self.write(&ping).await {
                warn!("Keepalive ping failed: {}", e);
                break;
            }
        }
    }

    /// Clear connection resources if `generation` is still current.
    /// Runs on the reader task, which ends right after.
    async fn teardown(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().await.take();
        self.set_state(ConnectionState::Disconnected);

        // Must not await past this point: the reader is among the aborted
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ChatError::Network("Not connected".to_string()))?;
        write_packet(writer, packet)
            .await
            .map_err(|e| ChatError::Network(format!("Write failed: {}", e)))
    }

    /// Emit a named event with an arbitrary JSON payload
    pub async fn emit_raw(&self, event: &str, data: Value) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::Network(format!("Cannot emit {}: not connected", event)));
        }
        self.write(&Packet::Event {
            event: event.to_string(),
            data,
        })
        .await
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let close = Packet::Close {
                reason: "client disconnect".to_string(),
            };
            if let Err(e) = write_packet(&mut writer, &close).await {
                debug!("Close notification not delivered: {}", e);
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and refuse any further connect attempts
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        info!("Transport session disposed");
    }

    fn set_state(&self, state: ConnectionState) {
        let events_tx = &self.events_tx;
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                // Queued under the watch lock so transitions keep their order
                let _ = events_tx.send(SessionEvent::StateChanged(state));
                true
            }
        });
        if changed {
            debug!("Connection state -> {}", state);
        }
    }
}

#[async_trait]
impl Emitter for TransportSession {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        let name = event.name();
        self.emit_raw(name, event.payload()).await
    }
}
