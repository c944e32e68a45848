/// Conversation store: ordered, deduplicated per-conversation timelines.
///
/// Every mutation goes through the single store lock, so readers always see a
/// fully applied timeline. Entries are ordered by `(timestamp, arrival seq)`;
/// the arrival sequence is assigned once, when an id first enters the store,
/// and is what breaks timestamp ties.
use crate::types::{ConversationKey, DeliveryState, Message};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    DuplicateIgnored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The pending entry now carries the server identity
    Replaced(Message),
    /// The confirmed id was already present (echo arrived first); the pending
    /// entry was dropped and the existing one marked Sent
    Merged(Message),
    /// The confirmed id already belongs to a different message; nothing changed
    Conflict,
    /// No entry with that local id
    NotFound,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
}

impl Entry {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.message.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct Timeline {
    entries: Vec<Entry>,
    history_reconciled: bool,
}

impl Timeline {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    /// Insert keeping `(timestamp, seq)` order
    fn insert_sorted(&mut self, entry: Entry) -> usize {
        let key = entry.sort_key();
        let index = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(index, entry);
        index
    }

    /// Move the entry at `index` if its key no longer fits between its neighbours
    fn resettle(&mut self, index: usize) {
        let key = self.entries[index].sort_key();
        let fits_left = index == 0 || self.entries[index - 1].sort_key() <= key;
        let fits_right =
            index + 1 >= self.entries.len() || key <= self.entries[index + 1].sort_key();
        if fits_left && fits_right {
            return;
        }
        let entry = self.entries.remove(index);
        self.insert_sorted(entry);
    }

    fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    timelines: HashMap<ConversationKey, Timeline>,
    next_seq: u64,
}

impl StoreInner {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Sole owner of all conversation timelines
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: Mutex<StoreInner>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the timeline for `key` if it does not exist yet
    pub fn open(&self, key: &ConversationKey) {
        self.inner.lock().timelines.entry(key.clone()).or_default();
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.inner.lock().timelines.contains_key(key)
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<_> = self.inner.lock().timelines.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Append a message; an id already in the timeline is a no-op
    pub fn append(&self, key: &ConversationKey, message: Message) -> AppendOutcome {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let timeline = inner.timelines.entry(key.clone()).or_default();

        if timeline.position(&message.id).is_some() {
            debug!("Duplicate message {} ignored in {}", message.id, key);
            return AppendOutcome::DuplicateIgnored;
        }

        timeline.insert_sorted(Entry { message, seq });
        inner.next_seq += 1;
        AppendOutcome::Appended
    }

    /// Swap a local entry's identity and timestamp for the server-confirmed ones.
    ///
    /// The entry keeps its arrival sequence, so it only moves when the
    /// confirmed timestamp requires it.
    pub fn replace_pending(
        &self,
        key: &ConversationKey,
        local_id: &str,
        confirmed_id: &str,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> ReplaceOutcome {
        let mut inner = self.inner.lock();
        let Some(timeline) = inner.timelines.get_mut(key) else {
            return ReplaceOutcome::NotFound;
        };
        let Some(index) = timeline.position(local_id) else {
            return ReplaceOutcome::NotFound;
        };

        if local_id != confirmed_id {
            if let Some(existing) = timeline.position(confirmed_id) {
                // Only a server echo of this very message may absorb it
                let echo = &timeline.entries[existing].message;
                if echo.delivery_state != DeliveryState::Sent
                    || echo.content != timeline.entries[index].message.content
                {
                    debug!(
                        "Pending {} cannot take id {} in {}: already used by another message",
                        local_id, confirmed_id, key
                    );
                    return ReplaceOutcome::Conflict;
                }
                let pending = timeline.entries.remove(index);
                let existing = if existing > index { existing - 1 } else { existing };
                let entry = &mut timeline.entries[existing];
                entry.message.delivery_state = DeliveryState::Sent;
                entry.message.originated_locally |= pending.message.originated_locally;
                debug!("Pending {} merged into echoed {} in {}", local_id, confirmed_id, key);
                return ReplaceOutcome::Merged(entry.message.clone());
            }
        }

        let entry = &mut timeline.entries[index];
        entry.message.id = confirmed_id.to_string();
        if let Some(ts) = confirmed_at {
            entry.message.timestamp = ts;
        }
        entry.message.delivery_state = DeliveryState::Sent;
        let confirmed = entry.message.clone();
        timeline.resettle(index);
        ReplaceOutcome::Replaced(confirmed)
    }

    /// Mark a pending entry Failed. The entry stays in the timeline.
    pub fn mark_failed(&self, key: &ConversationKey, local_id: &str) -> Option<Message> {
        self.transition(key, local_id, DeliveryState::Pending, DeliveryState::Failed, None)
    }

    /// Put a failed entry back to Pending for a retry, stamped with `now`
    pub fn mark_pending(
        &self,
        key: &ConversationKey,
        local_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        self.transition(key, local_id, DeliveryState::Failed, DeliveryState::Pending, Some(now))
    }

    fn transition(
        &self,
        key: &ConversationKey,
        id: &str,
        from: DeliveryState,
        to: DeliveryState,
        restamp: Option<DateTime<Utc>>,
    ) -> Option<Message> {
        let mut inner = self.inner.lock();
        // A restamped entry counts as a new arrival
        let seq = restamp.map(|_| inner.next_seq());
        let timeline = inner.timelines.get_mut(key)?;
        let index = timeline.position(id)?;

        let entry = &mut timeline.entries[index];
        if entry.message.delivery_state != from {
            return None;
        }
        entry.message.delivery_state = to;
        if let (Some(ts), Some(seq)) = (restamp, seq) {
            entry.message.timestamp = ts;
            entry.seq = seq;
        }
        let updated = entry.message.clone();
        timeline.resettle(index);
        Some(updated)
    }

    /// Remove an entry, typically a Failed message the user discarded
    pub fn remove(&self, key: &ConversationKey, id: &str) -> Option<Message> {
        let mut inner = self.inner.lock();
        let timeline = inner.timelines.get_mut(key)?;
        let index = timeline.position(id)?;
        Some(timeline.entries.remove(index).message)
    }

    pub fn get(&self, key: &ConversationKey, id: &str) -> Option<Message> {
        let inner = self.inner.lock();
        let timeline = inner.timelines.get(key)?;
        timeline
            .position(id)
            .map(|i| timeline.entries[i].message.clone())
    }

    /// Ordered copy of a timeline, empty if the conversation is unknown
    pub fn snapshot(&self, key: &ConversationKey) -> Vec<Message> {
        self.inner
            .lock()
            .timelines
            .get(key)
            .map(Timeline::messages)
            .unwrap_or_default()
    }

    pub fn len(&self, key: &ConversationKey) -> usize {
        self.inner
            .lock()
            .timelines
            .get(key)
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }

    pub fn is_reconciled(&self, key: &ConversationKey) -> bool {
        self.inner
            .lock()
            .timelines
            .get(key)
            .map(|t| t.history_reconciled)
            .unwrap_or(false)
    }

    /// Merge a history batch into the timeline and replace it atomically.
    ///
    /// Entries present in both keep their arrival sequence and take the
    /// history's server values. Live entries missing from history are kept.
    /// Reconciling the same batch again yields the same timeline.
    pub fn reconcile(&self, key: &ConversationKey, history: Vec<Message>) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let mut entries = inner
            .timelines
            .get_mut(key)
            .map(|t| std::mem::take(&mut t.entries))
            .unwrap_or_default();

        let mut index: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.message.id.clone(), i))
            .collect();

        let mut added = 0usize;
        for mut message in history {
            message.delivery_state = DeliveryState::Sent;
            let existing = index.get(&message.id).copied();
            match existing {
                Some(i) => {
                    let entry = &mut entries[i];
                    message.originated_locally |= entry.message.originated_locally;
                    entry.message = message;
                }
                None => {
                    let seq = inner.next_seq();
                    index.insert(message.id.clone(), entries.len());
                    entries.push(Entry { message, seq });
                    added += 1;
                }
            }
        }

        entries.sort_by_key(Entry::sort_key);

        let timeline = inner.timelines.entry(key.clone()).or_default();
        timeline.entries = entries;
        timeline.history_reconciled = true;
        debug!(
            "Reconciled {}: {} new from history, {} total",
            key,
            added,
            timeline.entries.len()
        );
        timeline.messages()
    }
}
