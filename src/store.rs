use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{Chat, Message};

/// Recent-history lists are trimmed to this many entries.
pub const MAX_HISTORY_SIZE: i64 = 1000;

const CHANNEL_LIST_KEY: &str = "channel.list";

fn chat_key(name: &str) -> String {
    format!("chat.{name}")
}

fn history_key(name: &str) -> String {
    format!("history.chat.{name}")
}

fn last_seq_key(name: &str) -> String {
    format!("last_seq.chat.{name}")
}

fn client_last_seq_key(uid: &str, name: &str) -> String {
    format!("client.last_seq.{uid}.{name}")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: chat not found")]
    NotFound,
    #[error("store: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("store: codec: {0}")]
    Codec(String),
}

/// Persistence port for chats, per-channel recent history and sequence
/// bookkeeping.
pub trait ChatStore: Send + Sync {
    /// Atomic: the channel enters the public directory only if the chat
    /// blob itself was written.
    fn save(&self, chat: &Chat) -> Result<(), StoreError>;
    fn get(&self, name: &str) -> Result<Chat, StoreError>;
    /// Public channels only; order unspecified.
    fn list_channels(&self) -> Result<Vec<String>, StoreError>;
    /// Last `n` messages in order plus the sequence one past the highest
    /// seen, which is the subscribe-resume point. Empty history returns
    /// `(vec![], 0)`.
    fn get_recent(&self, name: &str, n: i64) -> Result<(Vec<Message>, u64), StoreError>;
    fn append_message(&self, name: &str, msg: &Message) -> Result<(), StoreError>;
    /// Monotonic: only ever raises the stored value.
    fn update_last_client_seq(&self, uid: &str, name: &str, seq: u64) -> Result<(), StoreError>;
    fn get_unread_count(&self, uid: &str, name: &str) -> u64;
}

/// SQLite-backed store. The schema is a direct transcription of the
/// key-value layout: `kv` for blobs and counters, `sets` for the channel
/// directory, `lists` for recent history.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<SqliteStore, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.lock().unwrap().execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sets (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            );

            CREATE TABLE IF NOT EXISTS lists (
                key TEXT NOT NULL,
                pos INTEGER NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (key, pos)
            );",
        )?;
        Ok(())
    }

    /// Counters are stored as decimal strings; a missing key reads as 0.
    fn read_counter(conn: &Connection, key: &str) -> u64 {
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
            r.get::<_, String>(0)
        })
        .optional()
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
    }

    fn bump_counter(conn: &Connection, key: &str, seq: u64) -> Result<(), StoreError> {
        if seq <= Self::read_counter(conn, key) {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, seq.to_string()],
        )?;
        Ok(())
    }
}

impl ChatStore for SqliteStore {
    fn save(&self, chat: &Chat) -> Result<(), StoreError> {
        let data = chat.encode().map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![chat_key(&chat.name), data],
        )?;
        // Only public channels are listed in the directory.
        if chat.secret.is_empty() {
            tx.execute(
                "INSERT OR IGNORE INTO sets (key, member) VALUES (?1, ?2)",
                params![CHANNEL_LIST_KEY, chat.name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Chat, StoreError> {
        let conn = self.conn.lock().unwrap();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![chat_key(name)],
                |r| r.get(0),
            )
            .optional()?;
        let data = data.ok_or(StoreError::NotFound)?;
        Chat::decode(&data).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn list_channels(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT member FROM sets WHERE key = ?1")?;
        let names = stmt
            .query_map(params![CHANNEL_LIST_KEY], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn get_recent(&self, name: &str, n: i64) -> Result<(Vec<Message>, u64), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT value FROM lists WHERE key = ?1 ORDER BY pos DESC LIMIT ?2")?;
        let mut rows = stmt
            .query_map(params![history_key(name), n], |r| r.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();

        if rows.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let mut seq = 0u64;
        let msgs = rows
            .iter()
            .map(|raw| match Message::decode(raw) {
                Ok(m) => {
                    seq = seq.max(m.seq);
                    m
                }
                // An undecodable entry becomes a stub; the stream continues.
                Err(_) => Message {
                    text: "message unavailable!".to_string(),
                    ..Message::default()
                },
            })
            .collect();
        Ok((msgs, seq + 1))
    }

    fn append_message(&self, name: &str, msg: &Message) -> Result<(), StoreError> {
        // A payload is appended even when encoding fails, so downstream
        // consumers observe a dense sequence.
        let data = msg.encode().unwrap_or_else(|_| {
            Message {
                meta: HashMap::new(),
                time: msg.time,
                seq: msg.seq,
                text: "message unavailable, unable to encode".to_string(),
                from_uid: "store".to_string(),
                from_name: String::new(),
            }
            .encode()
            .unwrap_or_default()
        });

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let key = history_key(name);
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(pos), -1) + 1 FROM lists WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO lists (key, pos, value) VALUES (?1, ?2, ?3)",
            params![key, next, data],
        )?;
        tx.execute(
            "DELETE FROM lists WHERE key = ?1 AND pos <= ?2",
            params![key, next - MAX_HISTORY_SIZE],
        )?;
        Self::bump_counter(&tx, &last_seq_key(name), msg.seq)?;
        tx.commit()?;
        Ok(())
    }

    fn update_last_client_seq(&self, uid: &str, name: &str, seq: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::bump_counter(&conn, &client_last_seq_key(uid, name), seq)
    }

    fn get_unread_count(&self, uid: &str, name: &str) -> u64 {
        let conn = self.conn.lock().unwrap();
        let last = Self::read_counter(&conn, &last_seq_key(name));
        let client = Self::read_counter(&conn, &client_last_seq_key(uid, name));
        last.saturating_sub(client)
    }
}
