//! `SQLite` storage for messages and the retry queue.
//!
//! Message records and retry entries live on the device only. Outgoing
//! records keep the signed envelope so a retry republishes exactly what was
//! signed the first time.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{QueueError, Result};
use super::types::{Direction, Message, MessageStatus, RetryEntry};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_key, recipient_key, plaintext, \
     timestamp, direction, status, relay_results, retry_count, next_retry_at, envelope";

/// `SQLite`-based storage for message records.
///
/// Thread-safe wrapper around a `SQLite` connection.
pub struct MessageStorage {
    conn: Mutex<Connection>,
}

impl MessageStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or initialized.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Creates an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_key TEXT NOT NULL,
                recipient_key TEXT NOT NULL,
                plaintext TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                relay_results TEXT NOT NULL DEFAULT '[]',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER,
                envelope TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_status
                ON messages (status);

            CREATE TABLE IF NOT EXISTS retry_queue (
                message_id TEXT PRIMARY KEY,
                retry_count INTEGER NOT NULL,
                next_retry_at INTEGER NOT NULL,
                FOREIGN KEY (message_id) REFERENCES messages(id)
            );
            ",
        )?;

        Ok(())
    }

    // ==================== Messages ====================

    /// Inserts or updates a message.
    ///
    /// Identity fields (keys, plaintext, timestamp, direction) are fixed at
    /// first insert; later saves update delivery state only.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_message(&self, message: &Message) -> Result<()> {
        let relay_results = serde_json::to_string(&message.relay_results)?;
        let envelope = message
            .envelope
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().timestamp_millis();

        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO messages (id, conversation_id, sender_key, recipient_key, plaintext,
                timestamp, direction, status, relay_results, retry_count, next_retry_at,
                envelope, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                relay_results = excluded.relay_results,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at,
                envelope = COALESCE(excluded.envelope, messages.envelope),
                updated_at = excluded.updated_at
            ",
            params![
                &message.id,
                &message.conversation_id,
                &message.sender_key,
                &message.recipient_key,
                &message.plaintext,
                message.timestamp,
                message.direction.as_str(),
                message.status.as_str(),
                &relay_results,
                message.retry_count,
                message.next_retry_at.map(|at| at.timestamp_millis()),
                envelope,
                now,
            ],
        )?;

        Ok(())
    }

    /// Inserts a message unless one with the same id exists.
    ///
    /// Returns true if the row was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn insert_if_absent(&self, message: &Message) -> Result<bool> {
        let relay_results = serde_json::to_string(&message.relay_results)?;
        let envelope = message
            .envelope
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now().timestamp_millis();

        let conn = self.lock()?;
        let inserted = conn.execute(
            r"
            INSERT OR IGNORE INTO messages (id, conversation_id, sender_key, recipient_key,
                plaintext, timestamp, direction, status, relay_results, retry_count,
                next_retry_at, envelope, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ",
            params![
                &message.id,
                &message.conversation_id,
                &message.sender_key,
                &message.recipient_key,
                &message.plaintext,
                message.timestamp,
                message.direction.as_str(),
                message.status.as_str(),
                &relay_results,
                message.retry_count,
                message.next_retry_at.map(|at| at.timestamp_millis()),
                envelope,
                now,
            ],
        )?;

        Ok(inserted == 1)
    }

    /// Retrieves a message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the row is
    /// corrupt.
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                RawMessage::from_row,
            )
            .optional()?;
        raw.map(RawMessage::into_message).transpose()
    }

    /// Returns true if a message with `id` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn contains(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM messages WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns every message, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_messages(&self) -> Result<Vec<Message>> {
        self.query_messages(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY timestamp DESC, rowid ASC"),
            params![],
        )
    }

    /// Returns the messages of one conversation, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                 ORDER BY timestamp DESC, rowid ASC"
            ),
            params![conversation_id],
        )
    }

    /// Returns the messages with `status`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn messages_by_status(&self, status: MessageStatus) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1 \
                 ORDER BY timestamp DESC, rowid ASC"
            ),
            params![status.as_str()],
        )
    }

    /// Returns the newest incoming message timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn latest_incoming_timestamp(&self) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE direction = ?1",
            params![Direction::Incoming.as_str()],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Returns the number of stored messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn message_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| QueueError::InvalidData(e.to_string()))
    }

    // ==================== Retry Queue ====================

    /// Inserts or replaces the retry entry for a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn upsert_retry_entry(&self, entry: &RetryEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO retry_queue (message_id, retry_count, next_retry_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(message_id) DO UPDATE SET
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at
            ",
            params![
                &entry.message_id,
                entry.retry_count,
                entry.next_retry_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Removes the retry entry for a message.
    ///
    /// Returns true if an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_retry_entry(&self, message_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM retry_queue WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(removed > 0)
    }

    /// Returns every retry entry, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn retry_entries(&self) -> Result<Vec<RetryEntry>> {
        self.query_retry_entries(
            "SELECT message_id, retry_count, next_retry_at FROM retry_queue \
             ORDER BY next_retry_at ASC, message_id ASC",
            params![],
        )
    }

    /// Returns the retry entries due at or before `now`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn due_retry_entries(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>> {
        self.query_retry_entries(
            "SELECT message_id, retry_count, next_retry_at FROM retry_queue \
             WHERE next_retry_at <= ?1 ORDER BY next_retry_at ASC, message_id ASC",
            params![now.timestamp_millis()],
        )
    }

    /// Returns the number of queued retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn retry_queue_len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM retry_queue", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| QueueError::InvalidData(e.to_string()))
    }

    // ==================== Helpers ====================

    fn query_messages(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, RawMessage::from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        Ok(messages)
    }

    fn query_retry_entries(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RetryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (message_id, retry_count, next_retry_at) = row?;
            entries.push(RetryEntry {
                message_id,
                retry_count,
                next_retry_at: from_millis(next_retry_at)?,
            });
        }
        Ok(entries)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| QueueError::Storage(format!("Failed to acquire database lock: {e}")))
    }
}

impl std::fmt::Debug for MessageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStorage").finish_non_exhaustive()
    }
}

/// A message row before enum and JSON columns are decoded.
struct RawMessage {
    id: String,
    conversation_id: String,
    sender_key: String,
    recipient_key: String,
    plaintext: String,
    timestamp: i64,
    direction: String,
    status: String,
    relay_results: String,
    retry_count: u32,
    next_retry_at: Option<i64>,
    envelope: Option<String>,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_key: row.get(2)?,
            recipient_key: row.get(3)?,
            plaintext: row.get(4)?,
            timestamp: row.get(5)?,
            direction: row.get(6)?,
            status: row.get(7)?,
            relay_results: row.get(8)?,
            retry_count: row.get(9)?,
            next_retry_at: row.get(10)?,
            envelope: row.get(11)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_key: self.sender_key,
            recipient_key: self.recipient_key,
            plaintext: self.plaintext,
            timestamp: self.timestamp,
            direction: self.direction.parse()?,
            status: self.status.parse()?,
            relay_results: serde_json::from_str(&self.relay_results)?,
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at.map(from_millis).transpose()?,
            envelope: self
                .envelope
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::InvalidData(format!("timestamp out of range: {ms}")))
}
