// Records announced to room members. Field names match the REST API payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A room is keyed by the id of the thread it follows.
pub type RoomId = i64;

pub type MessageId = i64;

pub type UserId = i64;

/// A chat thread pinned to a geographic coordinate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: RoomId,
    pub lat: f64,
    pub long: f64,
    /// Opening text, duplicated as the thread's first message.
    pub message: String,
    pub replies: i64,
    pub user_id: UserId,
    pub username: String,
    pub user_image: String,
    pub created_at: DateTime<Utc>,
}

/// A reply posted to a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub image: String,
    pub thread_id: RoomId,
    pub reported: i64,
    /// The message created together with its thread. It goes away only with the thread.
    pub is_first: bool,
    pub user_id: UserId,
    pub username: String,
    pub user_image: String,
    pub created_at: DateTime<Utc>,
}

/// Who posted a thread or message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_image: String,
}
