// In-memory thread and message store.
//
// Stands in for the relational persistence layer. Every mutation commits
// before it returns, so callers can announce the change right after.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use globechat_common::types::{Author, Message, MessageId, RoomId, Thread};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("thread {0} not found")]
    ThreadNotFound(RoomId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("message {0} opens its thread and can only be removed with it")]
    FirstMessage(MessageId),
    #[error("message must have text or an image")]
    EmptyMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewThread {
    pub lat: f64,
    pub long: f64,
    pub message: String,
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub thread_id: RoomId,
    pub text: String,
    pub image: String,
    pub author: Author,
}

#[derive(Debug)]
struct StoreState {
    threads: BTreeMap<RoomId, Thread>,
    messages: BTreeMap<MessageId, Message>,
    next_thread_id: RoomId,
    next_message_id: MessageId,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            threads: BTreeMap::new(),
            messages: BTreeMap::new(),
            next_thread_id: 1,
            next_message_id: 1,
        }
    }
}

impl StoreState {
    fn insert_message(
        &mut self,
        thread_id: RoomId,
        text: String,
        image: String,
        author: &Author,
        is_first: bool,
        created_at: DateTime<Utc>,
    ) -> Message {
        let id = self.next_message_id;
        self.next_message_id += 1;

        let message = Message {
            id,
            text,
            image,
            thread_id,
            reported: 0,
            is_first,
            user_id: author.user_id,
            username: author.username.clone(),
            user_image: author.user_image.clone(),
            created_at,
        };
        self.messages.insert(id, message.clone());
        message
    }
}

#[derive(Debug, Default)]
pub struct ChatStore {
    state: RwLock<StoreState>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a thread together with its first message.
    pub async fn create_thread(&self, new_thread: NewThread) -> Result<Thread, StoreError> {
        self.create_thread_at(new_thread, Utc::now()).await
    }

    pub(crate) async fn create_thread_at(
        &self,
        new_thread: NewThread,
        created_at: DateTime<Utc>,
    ) -> Result<Thread, StoreError> {
        if new_thread.message.trim().is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let mut state = self.state.write().await;
        let id = state.next_thread_id;
        state.next_thread_id += 1;

        let thread = Thread {
            id,
            lat: new_thread.lat,
            long: new_thread.long,
            message: new_thread.message.clone(),
            replies: 0,
            user_id: new_thread.author.user_id,
            username: new_thread.author.username.clone(),
            user_image: new_thread.author.user_image.clone(),
            created_at,
        };
        state.threads.insert(id, thread.clone());
        state.insert_message(
            id,
            new_thread.message,
            String::new(),
            &new_thread.author,
            true,
            created_at,
        );

        Ok(thread)
    }

    pub async fn thread(&self, thread_id: RoomId) -> Result<Thread, StoreError> {
        self.state
            .read()
            .await
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or(StoreError::ThreadNotFound(thread_id))
    }

    /// Messages of one thread, oldest first.
    pub async fn messages_for_thread(&self, thread_id: RoomId) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        if !state.threads.contains_key(&thread_id) {
            return Err(StoreError::ThreadNotFound(thread_id));
        }

        Ok(state
            .messages
            .values()
            .filter(|message| message.thread_id == thread_id)
            .cloned()
            .collect())
    }

    pub async fn create_message(&self, new_message: NewMessage) -> Result<Message, StoreError> {
        if new_message.text.trim().is_empty() && new_message.image.trim().is_empty() {
            return Err(StoreError::EmptyMessage);
        }

        let mut state = self.state.write().await;
        let thread = state
            .threads
            .get_mut(&new_message.thread_id)
            .ok_or(StoreError::ThreadNotFound(new_message.thread_id))?;
        thread.replies += 1;

        Ok(state.insert_message(
            new_message.thread_id,
            new_message.text,
            new_message.image,
            &new_message.author,
            false,
            Utc::now(),
        ))
    }

    /// Removes a reply and returns it. A thread's first message is refused.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let message =
            state.messages.get(&message_id).ok_or(StoreError::MessageNotFound(message_id))?;
        if message.is_first {
            return Err(StoreError::FirstMessage(message_id));
        }

        let thread_id = message.thread_id;
        let removed =
            state.messages.remove(&message_id).ok_or(StoreError::MessageNotFound(message_id))?;
        if let Some(thread) = state.threads.get_mut(&thread_id) {
            thread.replies = (thread.replies - 1).max(0);
        }
        Ok(removed)
    }

    pub async fn report_message(&self, message_id: MessageId) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let message =
            state.messages.get_mut(&message_id).ok_or(StoreError::MessageNotFound(message_id))?;
        message.reported += 1;
        Ok(message.clone())
    }

    /// Removes a thread and all of its messages. Returns the thread record.
    pub async fn delete_thread(&self, thread_id: RoomId) -> Result<Thread, StoreError> {
        let mut state = self.state.write().await;
        let thread = state.threads.remove(&thread_id).ok_or(StoreError::ThreadNotFound(thread_id))?;
        state.messages.retain(|_, message| message.thread_id != thread_id);
        Ok(thread)
    }

    /// Ids of threads created before `cutoff`, ascending.
    pub async fn expired_thread_ids(&self, cutoff: DateTime<Utc>) -> Vec<RoomId> {
        self.state
            .read()
            .await
            .threads
            .values()
            .filter(|thread| thread.created_at < cutoff)
            .map(|thread| thread.id)
            .collect()
    }
}
