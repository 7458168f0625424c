//! In-memory view of messages, newest first.

use std::cmp::Reverse;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::queue::Message;

/// Messages ordered by timestamp, newest first.
///
/// The sort is stable, so messages with equal timestamps keep arrival
/// order. Re-inserting an id replaces the stored record in place.
#[derive(Debug, Default)]
pub struct OrderedView {
    messages: Mutex<Vec<Message>>,
}

impl OrderedView {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `message` and re-sorts.
    ///
    /// Returns true if the id was new.
    pub fn upsert(&self, message: Message) -> bool {
        let mut messages = self.lock();
        let inserted = match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message;
                false
            }
            None => {
                messages.push(message);
                true
            }
        };
        messages.sort_by_key(|m| Reverse(m.timestamp));
        inserted
    }

    /// Replaces the whole view.
    pub fn load(&self, mut loaded: Vec<Message>) {
        loaded.sort_by_key(|m| Reverse(m.timestamp));
        *self.lock() = loaded;
    }

    /// Returns every message, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().clone()
    }

    /// Returns the messages of one conversation, newest first.
    #[must_use]
    pub fn conversation(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Returns the message with `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Message> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    /// Returns whether `id` is in the view.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().iter().any(|m| m.id == id)
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
