/// Courtside Chat - live chat synchronization engine
///
/// Keeps one authenticated connection to the messaging server, merges history
/// and live traffic into ordered per-conversation timelines, echoes outgoing
/// messages optimistically, and tracks typing and presence.

pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod history;
pub mod protocol;
pub mod router;
pub mod send;
pub mod store;
pub mod transport;
pub mod typing;
pub mod types;

pub use client::ChatClient;
pub use config::Config;
pub use error::{ChatError, Result};
pub use facade::{ChatEvent, NotificationFacade, Subscription};
pub use store::{AppendOutcome, ConversationStore, ReplaceOutcome};
pub use transport::{Connected, Emitter, SessionEvent, TransportSession};
pub use types::{ConnectionState, ConversationKey, DeliveryState, Message};
