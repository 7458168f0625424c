//! Message persistence and the outgoing retry queue.
//!
//! [`MessageStorage`] owns the `messages` and `retry_queue` tables.
//! [`RetryManager`] decides whether a failed send is retried and when, and
//! feeds per-relay publish outcomes back into the health monitor.

mod error;
mod retry;
mod storage;
mod types;

pub use error::{QueueError, Result};
pub use retry::{RetryDecision, RetryManager};
pub use storage::MessageStorage;
pub use types::{conversation_id, Direction, Message, MessageStatus, RetryEntry};
