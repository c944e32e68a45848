/// Chat client: wires the transport session, store, send pipeline, router
/// and typing tracker together and runs the single dispatch loop.
///
/// Inbound events are processed one at a time on the dispatch task. Sends
/// from the UI run independently and only meet the dispatch task inside the
/// conversation store.
use crate::config::Config;
use crate::error::Result;
use crate::facade::{NotificationFacade, Subscription};
use crate::protocol::OutboundEvent;
use crate::router::EventRouter;
use crate::send::SendPipeline;
use crate::store::ConversationStore;
use crate::transport::{Connected, Emitter, SessionEvent, TransportSession};
use crate::typing::{LocalSignal, TypingTracker};
use crate::types::{ConnectionState, ConversationKey, Message};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub struct ChatClient {
    config: Config,
    session: TransportSession,
    store: Arc<ConversationStore>,
    facade: Arc<NotificationFacade>,
    pipeline: SendPipeline,
    router: Arc<EventRouter>,
    typing: Arc<Mutex<TypingTracker>>,
    /// Wakes the dispatch loop when a typing deadline was added from outside it
    wake: Arc<Notify>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let session = TransportSession::new(config.clone());
        let store = Arc::new(ConversationStore::new());
        let facade = Arc::new(NotificationFacade::new(config.event_capacity));
        let typing = Arc::new(Mutex::new(TypingTracker::new(config.typing_idle_timeout)));
        let emitter: Arc<dyn Emitter> = Arc::new(session.clone());

        let pipeline = SendPipeline::new(
            config.user_id.clone(),
            store.clone(),
            emitter,
            facade.clone(),
        );
        let router = Arc::new(EventRouter::new(
            config.user_id.clone(),
            store.clone(),
            pipeline.clone(),
            typing.clone(),
            facade.clone(),
        ));

        Ok(Self {
            config,
            session,
            store,
            facade,
            pipeline,
            router,
            typing,
            wake: Arc::new(Notify::new()),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn conversation_key(&self, peer_id: &str) -> ConversationKey {
        ConversationKey::between(&self.config.user_id, peer_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Connect and authenticate. Conversations joined earlier are joined
    /// again so their history is re-merged.
    pub async fn connect(&self) -> Result<Connected> {
        self.ensure_dispatcher();
        // The old connection may be gone before its Disconnected was dispatched
        self.pipeline.abandon_in_flight(
            || self.session.state() == ConnectionState::Disconnected,
            CONNECTION_LOST,
        );
        let connected = self.session.connect().await?;

        for key in self.store.conversations() {
            if let Some(peer_id) = key.peer_of(&self.config.user_id) {
                let rejoin = OutboundEvent::JoinChat {
                    peer_id: peer_id.to_string(),
                };
                if let Err(e) = self.session.emit(rejoin).await {
                    warn!("Rejoin of {} failed: {}", key, e);
                }
            }
        }

        Ok(connected)
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// Open a conversation and request its history
    pub async fn join(&self, peer_id: &str) -> Result<ConversationKey> {
        let key = self.conversation_key(peer_id);
        self.store.open(&key);
        self.session
            .emit(OutboundEvent::JoinChat {
                peer_id: peer_id.to_string(),
            })
            .await?;
        info!("Joined {}", key);
        Ok(key)
    }

    /// Leave a conversation. Its timeline stays in memory.
    pub async fn leave(&self, peer_id: &str) -> Result<()> {
        let (was_typing, announced) = self.typing.lock().clear(peer_id);
        if was_typing {
            self.facade.on_typing_changed(peer_id, false);
        }
        if announced {
            self.session
                .emit(OutboundEvent::TypingStop {
                    peer_id: peer_id.to_string(),
                })
                .await?;
        }
        self.session
            .emit(OutboundEvent::LeaveChat {
                peer_id: peer_id.to_string(),
            })
            .await
    }

    /// Optimistically send `content` to `peer_id`; returns the local id
    pub fn send(&self, peer_id: &str, content: &str) -> Result<String> {
        self.pipeline.send(&self.conversation_key(peer_id), content)
    }

    /// Re-submit a Failed message
    pub fn retry(&self, peer_id: &str, local_id: &str) -> Result<()> {
        self.pipeline.retry(&self.conversation_key(peer_id), local_id)
    }

    /// Discard an entry, typically a Failed message
    pub fn remove(&self, peer_id: &str, id: &str) -> Option<Message> {
        let key = self.conversation_key(peer_id);
        let removed = self.store.remove(&key, id)?;
        self.facade.on_message_removed(key, id);
        Some(removed)
    }

    /// Report the composer text for a conversation; emits debounced
    /// `typing_start` / `typing_stop`
    pub async fn set_composing(&self, peer_id: &str, text: &str) -> Result<()> {
        let signal = self.typing.lock().local_input(peer_id, text, Instant::now());
        self.wake.notify_one();

        let peer_id = peer_id.to_string();
        match signal {
            Some(LocalSignal::Start) => self.session.emit(OutboundEvent::TypingStart { peer_id }).await,
            Some(LocalSignal::Stop) => self.session.emit(OutboundEvent::TypingStop { peer_id }).await,
            None => Ok(()),
        }
    }

    pub fn snapshot(&self, peer_id: &str) -> Vec<Message> {
        self.store.snapshot(&self.conversation_key(peer_id))
    }

    pub fn is_peer_typing(&self, peer_id: &str) -> bool {
        self.typing.lock().is_peer_typing(peer_id)
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.typing.lock().is_online(peer_id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.facade.subscribe()
    }

    /// Events for one conversation view; drop it when the view closes
    pub fn subscribe_conversation(&self, peer_id: &str) -> Subscription {
        self.facade.subscribe_conversation(self.conversation_key(peer_id))
    }

    /// Stop dispatching, close the connection and end all subscriptions
    pub async fn dispose(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.session.dispose().await;
        self.facade.on_connection_state_changed(ConnectionState::Disconnected);
        self.facade.close();
        info!("Chat client for {} disposed", self.config.user_id);
    }

    fn ensure_dispatcher(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        if let Some(events) = self.session.take_events() {
            *dispatcher = Some(self.spawn_dispatcher(events));
        }
    }

    fn spawn_dispatcher(&self, events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        let dispatch = DispatchLoop {
            router: self.router.clone(),
            pipeline: self.pipeline.clone(),
            typing: self.typing.clone(),
            facade: self.facade.clone(),
            session: self.session.clone(),
            wake: self.wake.clone(),
        };
        tokio::spawn(dispatch.run(events))
    }
}

const CONNECTION_LOST: &str = "Connection lost before the server acknowledged";

struct DispatchLoop {
    router: Arc<EventRouter>,
    pipeline: SendPipeline,
    typing: Arc<Mutex<TypingTracker>>,
    facade: Arc<NotificationFacade>,
    session: TransportSession,
    wake: Arc<Notify>,
}

impl DispatchLoop {
    async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        debug!("Dispatch loop started");
        loop {
            let deadline = self.typing.lock().next_deadline();

            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Inbound(raw)) => {
                        self.router.dispatch(&raw.event, raw.data);
                    }
                    Some(SessionEvent::StateChanged(state)) => self.on_state_changed(state),
                    None => break,
                },
                _ = wait_until(deadline) => self.expire_typing(),
                _ = self.wake.notified() => {},
            }
        }
        debug!("Dispatch loop stopped");
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.facade.on_connection_state_changed(state);
        if state == ConnectionState::Disconnected {
            // Skipped when a reconnect already started; connect() cleared them
            let session = &self.session;
            self.pipeline.abandon_in_flight(
                || session.state() == ConnectionState::Disconnected,
                CONNECTION_LOST,
            );
        }
    }

    fn expire_typing(&self) {
        let expired = self.typing.lock().expire(Instant::now());

        for peer_id in expired.peers {
            self.facade.on_typing_changed(&peer_id, false);
        }
        for peer_id in expired.local {
            let session = self.session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.emit(OutboundEvent::TypingStop { peer_id }).await {
                    debug!("Idle typing_stop not sent: {}", e);
                }
            });
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
