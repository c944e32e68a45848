/// Event router: decodes named server events and hands each one to exactly
/// one component. Nothing here returns an error to the transport; bad input
/// is logged and dropped.
use crate::facade::NotificationFacade;
use crate::history::HistoryReconciler;
use crate::protocol::{InboundEvent, WireMessage};
use crate::send::SendPipeline;
use crate::store::{AppendOutcome, ConversationStore};
use crate::typing::TypingTracker;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a raw event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Unknown,
    Malformed,
}

pub struct EventRouter {
    user_id: String,
    store: Arc<ConversationStore>,
    pipeline: SendPipeline,
    history: HistoryReconciler,
    typing: Arc<Mutex<TypingTracker>>,
    facade: Arc<NotificationFacade>,
}

impl EventRouter {
    pub fn new(
        user_id: String,
        store: Arc<ConversationStore>,
        pipeline: SendPipeline,
        typing: Arc<Mutex<TypingTracker>>,
        facade: Arc<NotificationFacade>,
    ) -> Self {
        let history = HistoryReconciler::new(user_id.clone(), store.clone(), facade.clone());
        Self {
            user_id,
            store,
            pipeline,
            history,
            typing,
            facade,
        }
    }

    /// Decode and route one named event
    pub fn dispatch(&self, event: &str, data: Value) -> Dispatch {
        match InboundEvent::decode(event, data) {
            Ok(Some(inbound)) => {
                debug!("Dispatching {}", inbound.name());
                self.route(inbound);
                Dispatch::Handled
            }
            Ok(None) => {
                warn!("Unknown event '{}' dropped", event);
                Dispatch::Unknown
            }
            Err(e) => {
                warn!("Dropping '{}': {}", event, e);
                Dispatch::Malformed
            }
        }
    }

    pub fn route(&self, event: InboundEvent) {
        match event {
            InboundEvent::ChatHistory(history) => {
                self.history.reconcile_wire(history);
            }
            InboundEvent::NewMessage(wire) => self.on_new_message(wire),
            InboundEvent::MessageAck(ack) => self.pipeline.acknowledge(ack),
            InboundEvent::TypingStart { peer_id } => {
                let started = self.typing.lock().typing_start(&peer_id, Instant::now());
                if started {
                    self.facade.on_typing_changed(&peer_id, true);
                }
            }
            InboundEvent::TypingStop { peer_id } => {
                let stopped = self.typing.lock().typing_stop(&peer_id);
                if stopped {
                    self.facade.on_typing_changed(&peer_id, false);
                }
            }
            InboundEvent::PresenceOnline { peer_id } => self.on_presence(&peer_id, true),
            InboundEvent::PresenceOffline { peer_id } => self.on_presence(&peer_id, false),
            InboundEvent::ServerError { message } => {
                warn!("Server error: {}", message);
                self.facade.on_server_warning(message);
            }
        }
    }

    fn on_new_message(&self, wire: WireMessage) {
        let id = wire.id.clone();
        let message = match wire.into_message(&self.user_id) {
            Ok(message) => message,
            Err(e) => {
                warn!("new_message {} dropped: {}", id, e);
                return;
            }
        };

        if !message.conversation_key.involves(&self.user_id) {
            warn!(
                "new_message {} for {} does not involve {}; dropped",
                id, message.conversation_key, self.user_id
            );
            return;
        }

        let key = message.conversation_key.clone();
        match self.store.append(&key, message.clone()) {
            AppendOutcome::Appended => self.facade.on_message(message),
            AppendOutcome::DuplicateIgnored => debug!("new_message {} already in {}", id, key),
        }
    }

    fn on_presence(&self, peer_id: &str, online: bool) {
        let changed = self.typing.lock().set_presence(peer_id, online);
        if changed {
            self.facade.on_presence_changed(peer_id, online);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::facade::ChatEvent;
    use crate::protocol::OutboundEvent;
    use crate::transport::Emitter;
    use crate::types::{ConversationKey, DeliveryState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct NullEmitter;

    #[async_trait]
    impl Emitter for NullEmitter {
        async fn emit(&self, _event: OutboundEvent) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        router: EventRouter,
        store: Arc<ConversationStore>,
        pipeline: SendPipeline,
        facade: Arc<NotificationFacade>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConversationStore::new());
        let facade = Arc::new(NotificationFacade::new(64));
        let typing = Arc::new(Mutex::new(TypingTracker::new(Duration::from_secs(3))));
        let pipeline = SendPipeline::new(
            "alice".into(),
            store.clone(),
            Arc::new(NullEmitter),
            facade.clone(),
        );
        let router = EventRouter::new("alice".into(), store.clone(), pipeline.clone(), typing, facade.clone());
        Fixture {
            router,
            store,
            pipeline,
            facade,
        }
    }

    fn key() -> ConversationKey {
        ConversationKey::between("alice", "bob")
    }

    fn new_message(id: &str, millis: i64) -> Value {
        json!({
            "id": id,
            "senderId": "bob",
            "recipientId": "alice",
            "content": format!("msg {}", id),
            "timestamp": millis,
        })
    }

    #[test]
    fn test_unknown_and_malformed_are_dropped() {
        let f = fixture();
        assert_eq!(f.router.dispatch("friend_added", json!({})), Dispatch::Unknown);
        assert_eq!(f.router.dispatch("new_message", json!({ "id": 1 })), Dispatch::Malformed);
        assert_eq!(f.router.dispatch("typing_start", json!(null)), Dispatch::Malformed);
        assert!(f.store.conversations().is_empty());
    }

    #[test]
    fn test_server_error_is_a_warning() {
        let f = fixture();
        let mut sub = f.facade.subscribe();
        f.router.dispatch("server_error", json!({ "message": "rate limited" }));
        assert_eq!(
            sub.try_recv(),
            Some(ChatEvent::ServerWarning {
                message: "rate limited".into()
            })
        );
    }

    #[test]
    fn test_live_message_before_history() {
        let f = fixture();
        assert_eq!(f.router.dispatch("new_message", new_message("7", 7_000)), Dispatch::Handled);
        f.router.dispatch(
            "chat_history",
            json!({
                "peerId": "bob",
                "messages": [new_message("6", 6_000), new_message("7", 7_000)],
            }),
        );

        let ids: Vec<_> = f.store.snapshot(&key()).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["6", "7"]);
    }

    #[test]
    fn test_blank_history_entry_skipped_not_whole_batch() {
        let f = fixture();
        let mut sub = f.facade.subscribe();
        let mut blank = new_message("2", 2_000);
        blank["content"] = json!("  ");
        let mut unnamed = new_message("", 2_500);
        unnamed["content"] = json!("who am i");

        let outcome = f.router.dispatch(
            "chat_history",
            json!({
                "peerId": "bob",
                "messages": [new_message("1", 1_000), blank, unnamed, new_message("3", 3_000)],
            }),
        );

        assert_eq!(outcome, Dispatch::Handled);
        let ids: Vec<_> = f.store.snapshot(&key()).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["1", "3"]);
        match sub.try_recv() {
            Some(ChatEvent::HistoryReady { messages, .. }) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_message_for_other_users_dropped() {
        let f = fixture();
        let mut data = new_message("1", 1_000);
        data["recipientId"] = json!("carol");
        f.router.dispatch("new_message", data);
        assert!(f.store.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_send_ack_then_history_scenario() {
        let f = fixture();
        let (local_id, handle) = f.pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();
        assert_eq!(f.store.len(&key()), 1);

        f.router.dispatch(
            "message_ack",
            json!({ "localId": local_id, "id": "42", "status": "ok", "timestamp": 5_000 }),
        );
        let snapshot = f.store.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "42");
        assert_eq!(snapshot[0].delivery_state, DeliveryState::Sent);

        f.router.dispatch(
            "chat_history",
            json!({
                "peerId": "bob",
                "messages": [{
                    "id": "42", "senderId": "alice", "recipientId": "bob",
                    "content": "hi", "timestamp": 5_000,
                }],
            }),
        );
        let snapshot = f.store.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].originated_locally);
    }

    #[tokio::test]
    async fn test_echo_then_ack_leaves_one_entry() {
        let f = fixture();
        let (local_id, handle) = f.pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();

        f.router.dispatch(
            "new_message",
            json!({
                "id": "42", "senderId": "alice", "recipientId": "bob",
                "content": "hi", "timestamp": 5_000,
            }),
        );
        f.router.dispatch("message_ack", json!({ "localId": local_id, "id": "42", "status": "ok" }));

        let snapshot = f.store.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "42");
        assert_eq!(snapshot[0].delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn test_typing_and_presence_notify_on_change_only() {
        let f = fixture();
        let mut sub = f.facade.subscribe();

        f.router.dispatch("typing_start", json!({ "peerId": "bob" }));
        f.router.dispatch("typing_start", json!({ "peerId": "bob" }));
        f.router.dispatch("typing_stop", json!({ "peerId": "bob" }));
        f.router.dispatch("presence_online", json!({ "peerId": "bob" }));
        f.router.dispatch("presence_online", json!({ "peerId": "bob" }));

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                ChatEvent::TypingChanged { peer_id: "bob".into(), typing: true },
                ChatEvent::TypingChanged { peer_id: "bob".into(), typing: false },
                ChatEvent::PresenceChanged { peer_id: "bob".into(), online: true },
            ]
        );
    }
}
