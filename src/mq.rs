use async_trait::async_trait;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::now_ns;

/// Queue group used by the history materialiser.
pub const INGEST_GROUP: &str = "ingest";

/// Buffer of the per-subject live fan-out. A subscriber that falls this
/// far behind refills from the log instead of losing messages.
const TAIL_BUFFER: usize = 256;
/// Per-subscription delivery buffer. A full buffer backpressures the
/// delivery task.
const DELIVERY_BUFFER: usize = 64;

pub fn subject(channel: &str) -> String {
    format!("chat.{channel}")
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum MqError {
    #[error("mq: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for MqError {
    fn from(err: rusqlite::Error) -> MqError {
        MqError::Backend(err.to_string())
    }
}

/// A live subscription. Deliveries arrive strictly in sequence order.
/// `close` stops delivery and waits until the delivery task has stopped.
pub struct Subscription {
    receiver: mpsc::Receiver<Delivery>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        // Unblocks a delivery task waiting on a full buffer.
        self.receiver.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

/// Durable, per-subject sequenced log with three subscription flavors.
/// Sequences are assigned on commit, starting at 1 per subject.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, MqError>;
    /// Every message with `seq >= start`, in order, then the live tail.
    async fn subscribe_seq(
        &self,
        subject: &str,
        tag: &str,
        start: u64,
    ) -> Result<Subscription, MqError>;
    /// Delivery starts at the first message stamped at or after `since_ns`.
    async fn subscribe_timestamp(
        &self,
        subject: &str,
        tag: &str,
        since_ns: i64,
    ) -> Result<Subscription, MqError>;
    /// Competing consumers: each message goes to exactly one subscriber in
    /// the group. Only messages published while the group is live.
    async fn subscribe_queue(&self, subject: &str, group: &str) -> Result<Subscription, MqError>;
}

struct QueueMember {
    id: u64,
    sender: mpsc::Sender<Delivery>,
}

struct QueueGroup {
    members: Vec<QueueMember>,
    next: usize,
}

/// In-process implementation of the log: appends go to SQLite, live
/// subscribers tail a per-subject broadcast channel, queue groups get
/// round-robin competing-consumer delivery.
pub struct EmbeddedLog {
    conn: Arc<Mutex<Connection>>,
    tails: Mutex<HashMap<String, broadcast::Sender<Delivery>>>,
    groups: Arc<Mutex<HashMap<(String, String), QueueGroup>>>,
    member_ids: AtomicU64,
}

impl EmbeddedLog {
    pub fn open(path: &str) -> Result<EmbeddedLog, MqError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS log (
                subject TEXT NOT NULL,
                seq INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (subject, seq)
            );",
        )?;
        Ok(EmbeddedLog {
            conn: Arc::new(Mutex::new(conn)),
            tails: Mutex::new(HashMap::new()),
            groups: Arc::new(Mutex::new(HashMap::new())),
            member_ids: AtomicU64::new(1),
        })
    }

    fn tail_sender(&self, subject: &str) -> broadcast::Sender<Delivery> {
        self.tails
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(TAIL_BUFFER).0)
            .clone()
    }

    fn read_from(conn: &Connection, subject: &str, start: u64) -> Result<Vec<Delivery>, MqError> {
        let mut stmt = conn
            .prepare("SELECT seq, payload FROM log WHERE subject = ?1 AND seq >= ?2 ORDER BY seq ASC")?;
        let rows = stmt
            .query_map(params![subject, start as i64], |r| {
                Ok(Delivery {
                    seq: r.get::<_, i64>(0)? as u64,
                    payload: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn read_since(conn: &Connection, subject: &str, since_ns: i64) -> Result<Vec<Delivery>, MqError> {
        let mut stmt = conn
            .prepare("SELECT seq, payload FROM log WHERE subject = ?1 AND ts >= ?2 ORDER BY seq ASC")?;
        let rows = stmt
            .query_map(params![subject, since_ns], |r| {
                Ok(Delivery {
                    seq: r.get::<_, i64>(0)? as u64,
                    payload: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replays `replay`, then forwards the live tail, deduping the overlap
    /// between the two by sequence number.
    fn spawn_delivery(
        &self,
        subject: String,
        replay: Vec<Delivery>,
        mut tail: broadcast::Receiver<Delivery>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let conn = Arc::clone(&self.conn);

        let task = tokio::spawn(async move {
            let mut last: Option<u64> = None;
            for d in replay {
                let seq = d.seq;
                if tx.send(d).await.is_err() {
                    return;
                }
                last = Some(seq);
            }
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    res = tail.recv() => match res {
                        Ok(d) => {
                            if last.map_or(true, |l| d.seq > l) {
                                let seq = d.seq;
                                if tx.send(d).await.is_err() {
                                    return;
                                }
                                last = Some(seq);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Fell behind the live buffer: refill from the log.
                            warn!(subject = %subject, missed = n, "subscription lagged, refilling from log");
                            let from = last.map_or(0, |l| l + 1);
                            let missed = {
                                let conn = conn.lock().unwrap();
                                Self::read_from(&conn, &subject, from).unwrap_or_default()
                            };
                            for d in missed {
                                let seq = d.seq;
                                if tx.send(d).await.is_err() {
                                    return;
                                }
                                last = Some(seq);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription {
            receiver: rx,
            stop: Some(stop_tx),
            task: Some(task),
            unregister: None,
        }
    }

    /// Delivers `d` to one member of every queue group on `subject`,
    /// dropping members whose receivers are gone.
    async fn dispatch_queue(&self, subject: &str, d: &Delivery) {
        let keys: Vec<(String, String)> = {
            self.groups
                .lock()
                .unwrap()
                .keys()
                .filter(|(s, _)| s == subject)
                .cloned()
                .collect()
        };
        for key in keys {
            loop {
                let (id, sender) = {
                    let mut groups = self.groups.lock().unwrap();
                    let Some(group) = groups.get_mut(&key) else { break };
                    if group.members.is_empty() {
                        break;
                    }
                    let idx = group.next % group.members.len();
                    group.next = group.next.wrapping_add(1);
                    let member = &group.members[idx];
                    (member.id, member.sender.clone())
                };
                if sender.send(d.clone()).await.is_ok() {
                    break;
                }
                let mut groups = self.groups.lock().unwrap();
                if let Some(group) = groups.get_mut(&key) {
                    group.members.retain(|m| m.id != id);
                }
            }
        }
    }
}

#[async_trait]
impl MessageQueue for EmbeddedLog {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, MqError> {
        let ts = now_ns();
        let seq = {
            let conn = self.conn.lock().unwrap();
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM log WHERE subject = ?1",
                params![subject],
                |r| r.get(0),
            )?;
            conn.execute(
                "INSERT INTO log (subject, seq, ts, payload) VALUES (?1, ?2, ?3, ?4)",
                params![subject, next, ts, payload],
            )?;
            next as u64
        };

        let delivery = Delivery { seq, payload };
        let tail = self.tails.lock().unwrap().get(subject).cloned();
        if let Some(tail) = tail {
            // No live subscribers is not an error.
            let _ = tail.send(delivery.clone());
        }
        self.dispatch_queue(subject, &delivery).await;
        Ok(seq)
    }

    async fn subscribe_seq(
        &self,
        subject: &str,
        _tag: &str,
        start: u64,
    ) -> Result<Subscription, MqError> {
        // Tail first, then read the backlog: the overlap is deduped in the
        // delivery task, and nothing published in between is missed.
        let tail = self.tail_sender(subject).subscribe();
        let replay = {
            let conn = self.conn.lock().unwrap();
            Self::read_from(&conn, subject, start)?
        };
        Ok(self.spawn_delivery(subject.to_string(), replay, tail))
    }

    async fn subscribe_timestamp(
        &self,
        subject: &str,
        _tag: &str,
        since_ns: i64,
    ) -> Result<Subscription, MqError> {
        let tail = self.tail_sender(subject).subscribe();
        let replay = {
            let conn = self.conn.lock().unwrap();
            Self::read_since(&conn, subject, since_ns)?
        };
        Ok(self.spawn_delivery(subject.to_string(), replay, tail))
    }

    async fn subscribe_queue(&self, subject: &str, group: &str) -> Result<Subscription, MqError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let id = self.member_ids.fetch_add(1, Ordering::Relaxed);
        let key = (subject.to_string(), group.to_string());
        self.groups
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| QueueGroup {
                members: Vec::new(),
                next: 0,
            })
            .members
            .push(QueueMember { id, sender: tx });

        let groups = Arc::clone(&self.groups);
        let unregister = Box::new(move || {
            let mut groups = groups.lock().unwrap();
            if let Some(group) = groups.get_mut(&key) {
                group.members.retain(|m| m.id != id);
            }
        });
        Ok(Subscription {
            receiver: rx,
            stop: None,
            task: None,
            unregister: Some(unregister),
        })
    }
}
