/// History reconciler: merges the `chat_history` snapshot requested on join
/// with whatever live traffic already reached the store.
use crate::facade::NotificationFacade;
use crate::protocol::WireHistory;
use crate::store::ConversationStore;
use crate::types::{ConversationKey, Message};
use std::sync::Arc;
use tracing::{info, warn};

pub struct HistoryReconciler {
    user_id: String,
    store: Arc<ConversationStore>,
    facade: Arc<NotificationFacade>,
}

impl HistoryReconciler {
    pub fn new(user_id: String, store: Arc<ConversationStore>, facade: Arc<NotificationFacade>) -> Self {
        Self {
            user_id,
            store,
            facade,
        }
    }

    /// Merge `batch` into the timeline for `key` and announce the result.
    /// Repeated calls re-merge rather than append.
    pub fn reconcile(&self, key: &ConversationKey, batch: Vec<Message>) -> Vec<Message> {
        let again = self.store.is_reconciled(key);
        let merged = self.store.reconcile(key, batch);
        info!(
            "History for {} {} ({} messages)",
            key,
            if again { "re-merged" } else { "ready" },
            merged.len()
        );
        self.facade.on_history_ready(key.clone(), merged.clone());
        merged
    }

    /// Decode a wire batch and reconcile it. Entries without an id, with
    /// blank content, with unusable timestamps or that belong to another
    /// conversation are dropped one by one; the rest still merge.
    pub fn reconcile_wire(&self, history: WireHistory) -> Vec<Message> {
        let key = ConversationKey::between(&self.user_id, &history.peer_id);
        let mut batch = Vec::with_capacity(history.messages.len());

        for wire in history.messages {
            let id = wire.id.clone();
            if let Err(reason) = wire.check() {
                warn!("History entry '{}' dropped: {}", id, reason);
                continue;
            }
            match wire.into_message(&self.user_id) {
                Ok(message) if message.conversation_key == key => batch.push(message),
                Ok(message) => {
                    warn!(
                        "History entry {} belongs to {}, not {}; dropped",
                        id, message.conversation_key, key
                    );
                }
                Err(e) => warn!("History entry {} dropped: {}", id, e),
            }
        }

        self.reconcile(&key, batch)
    }
}
