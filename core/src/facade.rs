/// Notification facade: the only surface the UI consumes.
///
/// Events fan out over a broadcast channel. Dropping a `Subscription`
/// unsubscribes; closing the facade ends every subscription.
use crate::types::{ConnectionState, ConversationKey, Message};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

/// Real-time events delivered to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message entered a timeline (live or local echo)
    NewMessage { message: Message },
    /// An existing entry changed id or delivery state
    MessageUpdated { previous_id: String, message: Message },
    /// An entry was discarded from its timeline
    MessageRemoved {
        conversation_key: ConversationKey,
        id: String,
    },
    /// History for a conversation was merged
    HistoryReady {
        conversation_key: ConversationKey,
        messages: Vec<Message>,
    },
    TypingChanged { peer_id: String, typing: bool },
    PresenceChanged { peer_id: String, online: bool },
    ConnectionStateChanged { state: ConnectionState },
    /// A send attempt failed; the entry stays in the timeline as Failed
    SendFailed {
        conversation_key: ConversationKey,
        local_id: String,
        reason: String,
    },
    /// Non-fatal `server_error` from the server, verbatim
    ServerWarning { message: String },
}

impl ChatEvent {
    /// Whether this event belongs to the given conversation.
    /// Connection state and server warnings concern every view.
    pub fn concerns(&self, key: &ConversationKey) -> bool {
        match self {
            ChatEvent::NewMessage { message } | ChatEvent::MessageUpdated { message, .. } => {
                &message.conversation_key == key
            }
            ChatEvent::HistoryReady {
                conversation_key, ..
            }
            | ChatEvent::MessageRemoved {
                conversation_key, ..
            }
            | ChatEvent::SendFailed {
                conversation_key, ..
            } => conversation_key == key,
            ChatEvent::TypingChanged { peer_id, .. }
            | ChatEvent::PresenceChanged { peer_id, .. } => key.involves(peer_id),
            ChatEvent::ConnectionStateChanged { .. } | ChatEvent::ServerWarning { .. } => true,
        }
    }
}

pub struct NotificationFacade {
    tx: Mutex<Option<broadcast::Sender<ChatEvent>>>,
}

impl NotificationFacade {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.receiver(),
            filter: None,
        }
    }

    /// Subscribe to the events of one conversation view
    pub fn subscribe_conversation(&self, key: ConversationKey) -> Subscription {
        Subscription {
            rx: self.receiver(),
            filter: Some(key),
        }
    }

    fn receiver(&self) -> broadcast::Receiver<ChatEvent> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already closed: hand out a receiver that ends immediately
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub fn publish(&self, event: ChatEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // No subscribers is fine
            if tx.send(event).is_err() {
                trace!("Event dropped, no subscribers");
            }
        }
    }

    pub fn on_message(&self, message: Message) {
        self.publish(ChatEvent::NewMessage { message });
    }

    pub fn on_message_updated(&self, previous_id: &str, message: Message) {
        self.publish(ChatEvent::MessageUpdated {
            previous_id: previous_id.to_string(),
            message,
        });
    }

    pub fn on_message_removed(&self, conversation_key: ConversationKey, id: &str) {
        self.publish(ChatEvent::MessageRemoved {
            conversation_key,
            id: id.to_string(),
        });
    }

    pub fn on_history_ready(&self, conversation_key: ConversationKey, messages: Vec<Message>) {
        self.publish(ChatEvent::HistoryReady {
            conversation_key,
            messages,
        });
    }

    pub fn on_typing_changed(&self, peer_id: &str, typing: bool) {
        self.publish(ChatEvent::TypingChanged {
            peer_id: peer_id.to_string(),
            typing,
        });
    }

    pub fn on_presence_changed(&self, peer_id: &str, online: bool) {
        self.publish(ChatEvent::PresenceChanged {
            peer_id: peer_id.to_string(),
            online,
        });
    }

    pub fn on_connection_state_changed(&self, state: ConnectionState) {
        self.publish(ChatEvent::ConnectionStateChanged { state });
    }

    pub fn on_send_failed(&self, conversation_key: ConversationKey, local_id: &str, reason: String) {
        self.publish(ChatEvent::SendFailed {
            conversation_key,
            local_id: local_id.to_string(),
            reason,
        });
    }

    pub fn on_server_warning(&self, message: String) {
        self.publish(ChatEvent::ServerWarning { message });
    }

    /// End all subscriptions
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Receiving end held by a UI view
pub struct Subscription {
    rx: broadcast::Receiver<ChatEvent>,
    filter: Option<ConversationKey>,
}

impl Subscription {
    /// Next event, or `None` once the facade is closed.
    /// Lagging subscribers skip the overwritten events.
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<ChatEvent> {
        use tokio::sync::broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} events skipped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &ChatEvent) -> bool {
        self.filter.as_ref().map_or(true, |key| event.concerns(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conversation_filter() {
        let facade = NotificationFacade::new(16);
        let mut bob_view = facade.subscribe_conversation(ConversationKey::between("alice", "bob"));

        facade.on_typing_changed("carol", true);
        facade.on_typing_changed("bob", true);

        assert_eq!(
            bob_view.recv().await,
            Some(ChatEvent::TypingChanged {
                peer_id: "bob".into(),
                typing: true
            })
        );
        assert!(bob_view.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let facade = NotificationFacade::new(16);
        let mut sub = facade.subscribe();
        facade.close();
        assert!(sub.recv().await.is_none());
        assert!(facade.subscribe().recv().await.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(ChatEvent::PresenceChanged {
            peer_id: "bob".into(),
            online: true,
        })
        .unwrap();
        assert_eq!(json["type"], "presence_changed");
        assert_eq!(json["online"], true);
    }
}
