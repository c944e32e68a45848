/// Optimistic send pipeline.
///
/// A message shows up in its timeline as Pending before any network I/O.
/// The emit then runs in the background; a transport failure marks the entry
/// Failed, and a later `message_ack` confirms or fails it. Nothing is retried
/// automatically.
use crate::error::{ChatError, Result};
use crate::facade::NotificationFacade;
use crate::protocol::{OutboundEvent, WireAck};
use crate::store::{ConversationStore, ReplaceOutcome};
use crate::transport::Emitter;
use crate::types::{ConversationKey, DeliveryState, Message};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct InFlight {
    local_id: String,
    key: ConversationKey,
}

#[derive(Clone)]
pub struct SendPipeline {
    user_id: String,
    store: Arc<ConversationStore>,
    emitter: Arc<dyn Emitter>,
    facade: Arc<NotificationFacade>,
    /// Sends awaiting an ack, oldest first
    in_flight: Arc<Mutex<VecDeque<InFlight>>>,
}

impl SendPipeline {
    pub fn new(
        user_id: String,
        store: Arc<ConversationStore>,
        emitter: Arc<dyn Emitter>,
        facade: Arc<NotificationFacade>,
    ) -> Self {
        Self {
            user_id,
            store,
            emitter,
            facade,
            in_flight: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append `content` as a Pending message and emit it in the background.
    /// Returns the local id the entry carries until it is acknowledged.
    pub fn send(&self, key: &ConversationKey, content: &str) -> Result<String> {
        let (local_id, _) = self.submit(key, content)?;
        Ok(local_id)
    }

    pub(crate) fn submit(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(String, JoinHandle<()>)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("Message content is empty".to_string()));
        }
        let peer_id = key
            .peer_of(&self.user_id)
            .ok_or_else(|| {
                ChatError::Validation(format!("{} is not a participant of {}", self.user_id, key))
            })?
            .to_string();

        let local_id = format!("local-{}", Uuid::new_v4());
        let message = Message {
            id: local_id.clone(),
            conversation_key: key.clone(),
            sender_id: self.user_id.clone(),
            recipient_id: peer_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            delivery_state: DeliveryState::Pending,
            originated_locally: true,
        };

        self.store.append(key, message.clone());
        self.facade.on_message(message);
        debug!("Queued {} to {}", local_id, peer_id);

        let handle = self.dispatch(key.clone(), peer_id, content.to_string(), local_id.clone());
        Ok((local_id, handle))
    }

    /// Re-submit a Failed entry under the same local id
    pub fn retry(&self, key: &ConversationKey, local_id: &str) -> Result<()> {
        self.resubmit(key, local_id).map(|_| ())
    }

    pub(crate) fn resubmit(&self, key: &ConversationKey, local_id: &str) -> Result<JoinHandle<()>> {
        let message = self
            .store
            .mark_pending(key, local_id, Utc::now())
            .ok_or_else(|| {
                ChatError::Validation(format!("No failed message {} in {}", local_id, key))
            })?;

        self.facade.on_message_updated(local_id, message.clone());
        info!("Retrying {}", local_id);

        Ok(self.dispatch(
            key.clone(),
            message.recipient_id,
            message.content,
            local_id.to_string(),
        ))
    }

    fn dispatch(
        &self,
        key: ConversationKey,
        peer_id: String,
        content: String,
        local_id: String,
    ) -> JoinHandle<()> {
        self.in_flight.lock().push_back(InFlight {
            local_id: local_id.clone(),
            key: key.clone(),
        });

        let pipeline = self.clone();
        tokio::spawn(async move {
            let event = OutboundEvent::SendMessage {
                peer_id,
                content,
                local_id: local_id.clone(),
            };
            if let Err(e) = pipeline.emitter.emit(event).await {
                warn!("Send {} failed: {}", local_id, e);
                pipeline.forget(&local_id);
                pipeline.fail(&key, &local_id, e.to_string());
            }
        })
    }

    /// Reconcile a `message_ack` with the pending entry it confirms
    pub fn acknowledge(&self, ack: WireAck) {
        let Some(target) = self.resolve(ack.local_id.as_deref()) else {
            warn!("Ack for {} matches no pending send", ack.id);
            return;
        };

        if !ack.is_success() {
            self.fail(&target.key, &target.local_id, format!("Server status: {}", ack.status));
            return;
        }

        let confirmed_at = match ack.timestamp.map(|ts| ts.to_utc()).transpose() {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Ack {} carries a bad timestamp: {}", ack.id, e);
                None
            }
        };

        match self
            .store
            .replace_pending(&target.key, &target.local_id, &ack.id, confirmed_at)
        {
            ReplaceOutcome::Replaced(message) | ReplaceOutcome::Merged(message) => {
                debug!("{} confirmed as {}", target.local_id, message.id);
                self.facade.on_message_updated(&target.local_id, message);
            }
            ReplaceOutcome::Conflict => {
                warn!("Ack for {} reuses id {} of another message", target.local_id, ack.id);
                self.fail(
                    &target.key,
                    &target.local_id,
                    format!("Server id {} already in use", ack.id),
                );
            }
            ReplaceOutcome::NotFound => {
                debug!("{} no longer in timeline, ack ignored", target.local_id);
            }
        }
    }

    /// Fail every send still awaiting an ack. Acks are matched per
    /// connection, so none of them can be confirmed once it is gone.
    ///
    /// `still_down` is checked under the queue lock; when it returns false
    /// nothing is touched.
    pub fn abandon_in_flight(&self, still_down: impl FnOnce() -> bool, reason: &str) -> usize {
        let abandoned: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            if !still_down() {
                return 0;
            }
            in_flight.drain(..).collect()
        };

        for send in &abandoned {
            self.fail(&send.key, &send.local_id, reason.to_string());
        }
        if !abandoned.is_empty() {
            info!("{} unacknowledged sends marked failed: {}", abandoned.len(), reason);
        }
        abandoned.len()
    }

    /// Find which send an ack refers to. Acks without a local id match the
    /// oldest send still in flight.
    fn resolve(&self, local_id: Option<&str>) -> Option<InFlight> {
        let mut in_flight = self.in_flight.lock();
        match local_id {
            Some(id) => {
                if let Some(pos) = in_flight.iter().position(|f| f.local_id == id) {
                    return in_flight.remove(pos);
                }
                drop(in_flight);
                // Emit reported failure but the server got it anyway
                self.store
                    .conversations()
                    .into_iter()
                    .find(|key| self.store.get(key, id).is_some())
                    .map(|key| InFlight {
                        local_id: id.to_string(),
                        key,
                    })
            }
            None => in_flight.pop_front(),
        }
    }

    fn forget(&self, local_id: &str) {
        self.in_flight.lock().retain(|f| f.local_id != local_id);
    }

    fn fail(&self, key: &ConversationKey, local_id: &str, reason: String) {
        if let Some(message) = self.store.mark_failed(key, local_id) {
            self.facade.on_message_updated(local_id, message);
            self.facade.on_send_failed(key.clone(), local_id, reason);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::ChatEvent;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingEmitter {
        sent: Mutex<Vec<OutboundEvent>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Emitter for RecordingEmitter {
        async fn emit(&self, event: OutboundEvent) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ChatError::Network("Not connected".to_string()));
            }
            self.sent.lock().push(event);
            Ok(())
        }
    }

    fn key() -> ConversationKey {
        ConversationKey::between("alice", "bob")
    }

    fn pipeline(emitter: Arc<RecordingEmitter>) -> (SendPipeline, Arc<ConversationStore>, Arc<NotificationFacade>) {
        let store = Arc::new(ConversationStore::new());
        let facade = Arc::new(NotificationFacade::new(64));
        let pipeline = SendPipeline::new("alice".to_string(), store.clone(), emitter, facade.clone());
        (pipeline, store, facade)
    }

    fn ack(local_id: Option<&str>, id: &str, status: &str) -> WireAck {
        WireAck {
            local_id: local_id.map(str::to_string),
            id: id.to_string(),
            status: status.to_string(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_empty_content_rejected_before_network() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, _) = pipeline(emitter.clone());

        let err = pipeline.send(&key(), "   \n").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert_eq!(store.len(&key()), 0);
        assert_eq!(pipeline.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_non_participant_rejected() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, _, _) = pipeline(emitter);
        let other = ConversationKey::between("bob", "carol");
        assert!(matches!(pipeline.send(&other, "hi"), Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn test_local_echo_precedes_emit() {
        let gate = Arc::new(Notify::new());
        let emitter = Arc::new(RecordingEmitter {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (pipeline, store, facade) = pipeline(emitter.clone());
        let mut sub = facade.subscribe();

        let (local_id, handle) = pipeline.submit(&key(), "  hi  ").unwrap();

        let snapshot = store.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, local_id);
        assert_eq!(snapshot[0].content, "hi");
        assert_eq!(snapshot[0].delivery_state, DeliveryState::Pending);
        assert!(emitter.sent.lock().is_empty());
        assert!(matches!(sub.try_recv(), Some(ChatEvent::NewMessage { .. })));

        gate.notify_one();
        handle.await.unwrap();
        let sent = emitter.sent.lock().clone();
        assert_eq!(
            sent,
            vec![OutboundEvent::SendMessage {
                peer_id: "bob".into(),
                content: "hi".into(),
                local_id: local_id.clone(),
            }]
        );
        // Still pending until the ack arrives
        assert_eq!(store.get(&key(), &local_id).unwrap().delivery_state, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn test_emit_failure_marks_failed() {
        let emitter = Arc::new(RecordingEmitter {
            fail: true,
            ..Default::default()
        });
        let (pipeline, store, facade) = pipeline(emitter);
        let mut sub = facade.subscribe();

        let (local_id, handle) = pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();

        let entry = store.get(&key(), &local_id).unwrap();
        assert_eq!(entry.delivery_state, DeliveryState::Failed);
        assert_eq!(pipeline.pending_count(), 0);

        let mut saw_failure = false;
        while let Some(event) = sub.try_recv() {
            if let ChatEvent::SendFailed { local_id: id, .. } = event {
                assert_eq!(id, local_id);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_ack_confirms_single_entry() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, _) = pipeline(emitter);

        let (local_id, handle) = pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();
        pipeline.acknowledge(ack(Some(&local_id), "42", "ok"));

        let snapshot = store.snapshot(&key());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "42");
        assert_eq!(snapshot[0].delivery_state, DeliveryState::Sent);
        assert!(snapshot[0].originated_locally);
    }

    #[tokio::test]
    async fn test_ack_without_local_id_is_fifo() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, _) = pipeline(emitter);

        let (first, h1) = pipeline.submit(&key(), "one").unwrap();
        let (second, h2) = pipeline.submit(&key(), "two").unwrap();
        assert_ne!(first, second);
        h1.await.unwrap();
        h2.await.unwrap();

        pipeline.acknowledge(ack(None, "100", "ok"));
        assert!(store.get(&key(), &first).is_none());
        assert_eq!(store.get(&key(), "100").unwrap().content, "one");
        assert!(store.get(&key(), &second).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_rejected_ack_marks_failed() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, _) = pipeline(emitter);

        let (local_id, handle) = pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();
        pipeline.acknowledge(ack(Some(&local_id), "", "blocked"));

        assert_eq!(store.get(&key(), &local_id).unwrap().delivery_state, DeliveryState::Failed);
    }

    #[tokio::test]
    async fn test_retry_after_failure() {
        let emitter = Arc::new(RecordingEmitter {
            fail: true,
            ..Default::default()
        });
        let (failing, store, facade) = pipeline(emitter);
        let (local_id, handle) = failing.submit(&key(), "hi").unwrap();
        handle.await.unwrap();

        let working = Arc::new(RecordingEmitter::default());
        let pipeline = SendPipeline::new("alice".to_string(), store.clone(), working.clone(), facade);
        pipeline.resubmit(&key(), &local_id).unwrap().await.unwrap();

        assert!(store.get(&key(), &local_id).unwrap().is_pending());
        assert_eq!(working.sent.lock().len(), 1);

        // Retrying a message that has not failed is refused
        assert!(pipeline.retry(&key(), &local_id).is_err());
    }

    #[tokio::test]
    async fn test_reused_server_id_fails_second_send() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, facade) = pipeline(emitter);
        let mut sub = facade.subscribe();

        let (first, h1) = pipeline.submit(&key(), "first").unwrap();
        let (second, h2) = pipeline.submit(&key(), "second").unwrap();
        h1.await.unwrap();
        h2.await.unwrap();

        pipeline.acknowledge(ack(Some(&first), "7", "ok"));
        pipeline.acknowledge(ack(Some(&second), "7", "ok"));

        let snapshot = store.snapshot(&key());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].content, "first");
        assert_eq!(snapshot[0].delivery_state, DeliveryState::Sent);
        assert_eq!(snapshot[1].id, second);
        assert_eq!(snapshot[1].delivery_state, DeliveryState::Failed);

        let mut failed = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let ChatEvent::SendFailed { local_id, .. } = event {
                failed.push(local_id);
            }
        }
        assert_eq!(failed, vec![second]);
    }

    #[tokio::test]
    async fn test_abandon_in_flight_fails_unacked_sends() {
        let emitter = Arc::new(RecordingEmitter::default());
        let (pipeline, store, _) = pipeline(emitter);

        let (first, h1) = pipeline.submit(&key(), "one").unwrap();
        h1.await.unwrap();

        // Reconnected before the loss was noticed: leave the queue alone
        assert_eq!(pipeline.abandon_in_flight(|| false, "Connection lost"), 0);
        assert_eq!(pipeline.pending_count(), 1);

        assert_eq!(pipeline.abandon_in_flight(|| true, "Connection lost"), 1);
        assert_eq!(pipeline.pending_count(), 0);
        assert_eq!(store.get(&key(), &first).unwrap().delivery_state, DeliveryState::Failed);

        // A localId-less ack now belongs to the next send only
        let (second, h2) = pipeline.submit(&key(), "two").unwrap();
        h2.await.unwrap();
        pipeline.acknowledge(ack(None, "100", "ok"));
        assert_eq!(store.get(&key(), "100").unwrap().content, "two");
        assert!(store.get(&key(), &second).is_none());

        // And the failed one can still be retried
        pipeline.retry(&key(), &first).unwrap();
        assert!(store.get(&key(), &first).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_late_ack_for_failed_send_still_confirms() {
        let emitter = Arc::new(RecordingEmitter {
            fail: true,
            ..Default::default()
        });
        let (pipeline, store, _) = pipeline(emitter);
        let (local_id, handle) = pipeline.submit(&key(), "hi").unwrap();
        handle.await.unwrap();

        pipeline.acknowledge(ack(Some(&local_id), "9", "ok"));
        assert_eq!(store.get(&key(), "9").unwrap().delivery_state, DeliveryState::Sent);
    }
}
