/// Wire protocol: length-prefixed JSON packets carrying named chat events
use crate::error::{ChatError, Result};
use crate::types::{ConversationKey, DeliveryState, Message};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted packet body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Packets exchanged on the connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Packet {
    /// First packet sent by the client, carries the session credential
    #[serde(rename = "hello")]
    Hello {
        credential: String,
        user_id: String,
        protocol_version: u8,
    },

    /// Server accepted the credential
    #[serde(rename = "hello_ack")]
    HelloAck { user_id: String, protocol_version: u8 },

    /// Server refused the credential
    #[serde(rename = "hello_reject")]
    HelloReject { reason: String },

    /// Named application event
    #[serde(rename = "event")]
    Event { event: String, data: Value },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Connection close notification
    #[serde(rename = "close")]
    Close { reason: String },
}

impl Packet {
    /// Serialize packet to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize packet from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => "hello",
            Packet::HelloAck { .. } => "hello_ack",
            Packet::HelloReject { .. } => "hello_reject",
            Packet::Event { .. } => "event",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
            Packet::Close { .. } => "close",
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Event { event, .. } => write!(f, "Packet(event:{})", event),
            other => write!(f, "Packet({})", other.packet_type()),
        }
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn from_packet(packet: &Packet) -> std::result::Result<Self, serde_json::Error> {
        let payload = packet.to_bytes()?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u32(self.length);
        buf.put_slice(&self.payload);
        buf
    }
}

/// Read one packet. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChatError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ChatError::Protocol(format!(
            "Frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let packet = Packet::from_bytes(&payload)
        .map_err(|e| ChatError::Protocol(format!("Invalid packet: {}", e)))?;
    Ok(Some(packet))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_packet(packet)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

// ─── Event payloads ──────────────────────────────────────────────────────────

/// Server timestamps arrive either as RFC 3339 text or epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(DateTime<Utc>),
}

impl WireTimestamp {
    pub fn to_utc(self) -> Result<DateTime<Utc>> {
        match self {
            WireTimestamp::Text(ts) => Ok(ts),
            WireTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| ChatError::Protocol(format!("Timestamp out of range: {}", ms))),
        }
    }
}

/// Message as carried by `new_message` and inside `chat_history`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: WireTimestamp,
}

impl WireMessage {
    /// Reject entries without an id or with blank content
    pub fn check(&self) -> std::result::Result<(), &'static str> {
        if self.id.trim().is_empty() {
            return Err("empty id");
        }
        if self.content.trim().is_empty() {
            return Err("blank content");
        }
        Ok(())
    }

    /// Convert into a confirmed timeline message as seen by `local_user`
    pub fn into_message(self, local_user: &str) -> Result<Message> {
        let timestamp = self.timestamp.to_utc()?;
        Ok(Message {
            conversation_key: ConversationKey::between(&self.sender_id, &self.recipient_id),
            originated_locally: self.sender_id == local_user,
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            content: self.content,
            timestamp,
            delivery_state: DeliveryState::Sent,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireHistory {
    pub peer_id: String,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireAck {
    #[serde(default)]
    pub local_id: Option<String>,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

impl WireAck {
    pub fn is_success(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "sent")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct PeerPayload {
    peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ServerErrorPayload {
    message: String,
}

/// Every inbound event the engine understands
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ChatHistory(WireHistory),
    NewMessage(WireMessage),
    MessageAck(WireAck),
    TypingStart { peer_id: String },
    TypingStop { peer_id: String },
    PresenceOnline { peer_id: String },
    PresenceOffline { peer_id: String },
    ServerError { message: String },
}

impl InboundEvent {
    /// Decode a named event.
    ///
    /// Returns `Ok(None)` for event names this client does not know and
    /// `ChatError::Protocol` when a known event lacks required fields.
    pub fn decode(event: &str, data: Value) -> Result<Option<Self>> {
        let decoded = match event {
            // History entries are checked one by one when merged
            "chat_history" => InboundEvent::ChatHistory(from_value(event, data)?),
            "new_message" => {
                let message: WireMessage = from_value(event, data)?;
                message.check().map_err(|e| malformed(event, e))?;
                InboundEvent::NewMessage(message)
            }
            "message_ack" => {
                let ack: WireAck = from_value(event, data)?;
                if ack.is_success() && ack.id.trim().is_empty() {
                    return Err(malformed(event, "success ack without id"));
                }
                InboundEvent::MessageAck(ack)
            }
            "typing_start" => {
                let p: PeerPayload = from_value(event, data)?;
                InboundEvent::TypingStart { peer_id: p.peer_id }
            }
            "typing_stop" => {
                let p: PeerPayload = from_value(event, data)?;
                InboundEvent::TypingStop { peer_id: p.peer_id }
            }
            "presence_online" => {
                let p: PeerPayload = from_value(event, data)?;
                InboundEvent::PresenceOnline { peer_id: p.peer_id }
            }
            "presence_offline" => {
                let p: PeerPayload = from_value(event, data)?;
                InboundEvent::PresenceOffline { peer_id: p.peer_id }
            }
            "server_error" => {
                let p: ServerErrorPayload = from_value(event, data)?;
                InboundEvent::ServerError { message: p.message }
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::ChatHistory(_) => "chat_history",
            InboundEvent::NewMessage(_) => "new_message",
            InboundEvent::MessageAck(_) => "message_ack",
            InboundEvent::TypingStart { .. } => "typing_start",
            InboundEvent::TypingStop { .. } => "typing_stop",
            InboundEvent::PresenceOnline { .. } => "presence_online",
            InboundEvent::PresenceOffline { .. } => "presence_offline",
            InboundEvent::ServerError { .. } => "server_error",
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| ChatError::Protocol(format!("Malformed {} payload: {}", event, e)))
}

fn malformed(event: &str, reason: impl fmt::Display) -> ChatError {
    ChatError::Protocol(format!("Malformed {} payload: {}", event, reason))
}

/// Events the client emits
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    JoinChat { peer_id: String },
    LeaveChat { peer_id: String },
    SendMessage {
        peer_id: String,
        content: String,
        local_id: String,
    },
    TypingStart { peer_id: String },
    TypingStop { peer_id: String },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinChat { .. } => "join_chat",
            OutboundEvent::LeaveChat { .. } => "leave_chat",
            OutboundEvent::SendMessage { .. } => "send_message",
            OutboundEvent::TypingStart { .. } => "typing_start",
            OutboundEvent::TypingStop { .. } => "typing_stop",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::JoinChat { peer_id }
            | OutboundEvent::LeaveChat { peer_id }
            | OutboundEvent::TypingStart { peer_id }
            | OutboundEvent::TypingStop { peer_id } => json!({ "peerId": peer_id }),
            OutboundEvent::SendMessage {
                peer_id,
                content,
                local_id,
            } => json!({
                "peerId": peer_id,
                "content": content,
                "localId": local_id,
            }),
        }
    }

    pub fn into_packet(self) -> Packet {
        Packet::Event {
            event: self.name().to_string(),
            data: self.payload(),
        }
    }
}
