// WebSocket message types for room subscriptions and live notifications.
//
// Every frame in either direction is a JSON object `{type, room_id, data}`.
// Clients send `join` / `leave` control frames; the server pushes
// `new-message`, `delete-message` and `delete-thread` notifications.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::RoomId;

/// Subprotocol offered during the upgrade handshake.
pub const SUBPROTOCOL: &str = "wompwomp";

/// Client -> Server: room subscription change.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
}

impl ControlFrame {
    pub const fn room_id(self) -> RoomId {
        match self {
            Self::Join { room_id } | Self::Leave { room_id } => room_id,
        }
    }

    pub const fn type_str(self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
        }
    }
}

/// Server -> Client event tags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    NewMessage,
    DeleteMessage,
    DeleteThread,
}

impl NotificationKind {
    pub const ALL: [Self; 3] = [Self::NewMessage, Self::DeleteMessage, Self::DeleteThread];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new-message",
            Self::DeleteMessage => "delete-message",
            Self::DeleteThread => "delete-thread",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server -> Client: a state change announced to every member of `room_id`.
///
/// `data` is whatever record the mutation produced (a message, a thread, or an
/// empty string for threads removed by the expiry sweep).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification<T> {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub room_id: RoomId,
    pub data: T,
}

impl<T> Notification<T> {
    pub fn new(kind: NotificationKind, room_id: RoomId, data: T) -> Self {
        Self { kind, room_id, data }
    }

    pub fn new_message(room_id: RoomId, data: T) -> Self {
        Self::new(NotificationKind::NewMessage, room_id, data)
    }

    pub fn delete_message(room_id: RoomId, data: T) -> Self {
        Self::new(NotificationKind::DeleteMessage, room_id, data)
    }

    pub fn delete_thread(room_id: RoomId, data: T) -> Self {
        Self::new(NotificationKind::DeleteThread, room_id, data)
    }
}

/// Client-side view of any frame, for consumers that dispatch on `type`
/// before deciding how to read `data`. The relay itself never decodes
/// through this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WsMessage {
    pub fn notification_kind(&self) -> Option<NotificationKind> {
        NotificationKind::ALL.into_iter().find(|kind| kind.as_str() == self.frame_type)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("`{0}` frame is missing room_id")]
    MissingRoomId(&'static str),
}

#[derive(Deserialize)]
struct RawControlFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    room_id: Option<RoomId>,
}

/// Decodes one client frame. Any `data` field is ignored.
pub fn decode_control_frame(raw: &str) -> Result<ControlFrame, FrameDecodeError> {
    let frame = serde_json::from_str::<RawControlFrame>(raw)?;
    match (frame.frame_type.as_str(), frame.room_id) {
        ("join", Some(room_id)) => Ok(ControlFrame::Join { room_id }),
        ("leave", Some(room_id)) => Ok(ControlFrame::Leave { room_id }),
        ("join", None) => Err(FrameDecodeError::MissingRoomId("join")),
        ("leave", None) => Err(FrameDecodeError::MissingRoomId("leave")),
        _ => Err(FrameDecodeError::UnknownType(frame.frame_type)),
    }
}

/// Client-side encoder for join/leave frames.
pub fn encode_control_frame(frame: ControlFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&frame)
}

pub fn encode_notification<T: Serialize>(
    notification: &Notification<T>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(notification)
}
