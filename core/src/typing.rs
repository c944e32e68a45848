/// Typing and presence tracking.
///
/// Each peer is either Idle or PeerTyping with a single deadline. A
/// `typing_start` (re)arms the deadline; `typing_stop` or the deadline passing
/// returns the peer to Idle. The outgoing side is debounced the same way: one
/// `typing_start` per burst of input, one `typing_stop` when the text empties
/// or the input goes quiet.
///
/// The tracker holds no timers. Callers pass `now` in and poll
/// `next_deadline` from whatever scheduler they run.
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// What the local side should announce to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSignal {
    Start,
    Stop,
}

/// Deadlines that passed in one `expire` call
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// Peers whose typing indicator timed out
    pub peers: Vec<String>,
    /// Peers we should now send `typing_stop` to
    pub local: Vec<String>,
}

impl Expired {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.local.is_empty()
    }
}

#[derive(Debug)]
pub struct TypingTracker {
    idle_timeout: Duration,
    /// Peers currently typing, with their idle deadline
    peer_typing: HashMap<String, Instant>,
    online: HashSet<String>,
    /// Peers we announced typing to, with our own idle deadline
    announced: HashMap<String, Instant>,
}

impl TypingTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            peer_typing: HashMap::new(),
            online: HashSet::new(),
            announced: HashMap::new(),
        }
    }

    /// Returns true when the peer went from Idle to PeerTyping
    pub fn typing_start(&mut self, peer_id: &str, now: Instant) -> bool {
        let deadline = now + self.idle_timeout;
        self.peer_typing.insert(peer_id.to_string(), deadline).is_none()
    }

    /// Returns true when the peer was typing
    pub fn typing_stop(&mut self, peer_id: &str) -> bool {
        self.peer_typing.remove(peer_id).is_some()
    }

    pub fn is_peer_typing(&self, peer_id: &str) -> bool {
        self.peer_typing.contains_key(peer_id)
    }

    /// Returns true when the presence actually changed
    pub fn set_presence(&mut self, peer_id: &str, online: bool) -> bool {
        if online {
            self.online.insert(peer_id.to_string())
        } else {
            self.online.remove(peer_id)
        }
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.online.contains(peer_id)
    }

    /// Feed the current composer text for a conversation
    pub fn local_input(&mut self, peer_id: &str, text: &str, now: Instant) -> Option<LocalSignal> {
        if text.trim().is_empty() {
            return self
                .announced
                .remove(peer_id)
                .map(|_| LocalSignal::Stop);
        }

        let deadline = now + self.idle_timeout;
        match self.announced.insert(peer_id.to_string(), deadline) {
            Some(_) => None,
            None => Some(LocalSignal::Start),
        }
    }

    pub fn is_announced(&self, peer_id: &str) -> bool {
        self.announced.contains_key(peer_id)
    }

    /// Drop all typing state for a peer (conversation closed).
    /// Returns (peer was typing, we had announced typing).
    pub fn clear(&mut self, peer_id: &str) -> (bool, bool) {
        (
            self.peer_typing.remove(peer_id).is_some(),
            self.announced.remove(peer_id).is_some(),
        )
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peer_typing
            .values()
            .chain(self.announced.values())
            .min()
            .copied()
    }

    /// Remove every deadline at or before `now`
    pub fn expire(&mut self, now: Instant) -> Expired {
        let mut expired = Expired::default();

        self.peer_typing.retain(|peer, deadline| {
            let keep = *deadline > now;
            if !keep {
                expired.peers.push(peer.clone());
            }
            keep
        });
        self.announced.retain(|peer, deadline| {
            let keep = *deadline > now;
            if !keep {
                expired.local.push(peer.clone());
            }
            keep
        });

        expired.peers.sort();
        expired.local.sort();
        expired
    }
}
