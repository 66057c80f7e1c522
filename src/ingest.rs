use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{Message, now_ns};
use crate::mq::{INGEST_GROUP, MessageQueue, MqError, subject};
use crate::store::ChatStore;

struct ActiveIngest {
    refs: usize,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Materialises every message published on a channel into the store's
/// recent-history list, exactly once per channel regardless of how many
/// subscribers are connected. Concurrent `run` calls for one channel
/// share a single queue-group subscription behind a reference count.
pub struct Ingest {
    mq: Arc<dyn MessageQueue>,
    store: Arc<dyn ChatStore>,
    active: Mutex<HashMap<String, ActiveIngest>>,
}

impl Ingest {
    pub fn new(mq: Arc<dyn MessageQueue>, store: Arc<dyn ChatStore>) -> Ingest {
        Ingest {
            mq,
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Takes one reference on the channel's materialiser, starting it if
    /// this is the first. The guard must be released on teardown; the
    /// subscription closes when the count returns to zero.
    pub async fn run(self: &Arc<Self>, channel: &str) -> Result<IngestGuard, MqError> {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.get_mut(channel) {
            entry.refs += 1;
            return Ok(IngestGuard {
                ingest: Arc::clone(self),
                channel: channel.to_string(),
                released: false,
            });
        }

        let mut sub = self.mq.subscribe_queue(&subject(channel), INGEST_GROUP).await?;
        let store = Arc::clone(&self.store);
        let name = channel.to_string();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    d = sub.recv() => {
                        let Some(d) = d else { break };
                        let mut msg = Message::decode(&d.payload).unwrap_or_else(|_| Message {
                            from_uid: "ingest".to_string(),
                            text: "ingest: message unavailable: decoding error".to_string(),
                            time: now_ns(),
                            ..Message::default()
                        });
                        msg.seq = d.seq;
                        // One bounded retry; the loop must never stall on a
                        // failing store.
                        if let Err(err) = store.append_message(&name, &msg) {
                            warn!(channel = %name, seq = d.seq, %err, "history append failed, retrying");
                            if let Err(err) = store.append_message(&name, &msg) {
                                warn!(channel = %name, seq = d.seq, %err, "history append retry failed, dropping");
                            }
                        }
                    }
                }
            }
            sub.close().await;
        });

        active.insert(
            channel.to_string(),
            ActiveIngest {
                refs: 1,
                stop: stop_tx,
                task,
            },
        );
        Ok(IngestGuard {
            ingest: Arc::clone(self),
            channel: channel.to_string(),
            released: false,
        })
    }

    /// Live reference count for a channel's materialiser.
    pub async fn refs(&self, channel: &str) -> usize {
        self.active.lock().await.get(channel).map_or(0, |e| e.refs)
    }

    async fn release(&self, channel: &str) {
        let closed = {
            let mut active = self.active.lock().await;
            match active.get_mut(channel) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => active.remove(channel),
                None => None,
            }
        };
        if let Some(entry) = closed {
            let _ = entry.stop.send(true);
            let _ = entry.task.await;
            debug!(channel = %channel, "ingest stopped");
        }
    }
}

/// One reference on a channel materialiser.
pub struct IngestGuard {
    ingest: Arc<Ingest>,
    channel: String,
    released: bool,
}

impl IngestGuard {
    pub async fn release(mut self) {
        self.released = true;
        let ingest = Arc::clone(&self.ingest);
        let channel = std::mem::take(&mut self.channel);
        ingest.release(&channel).await;
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ingest = Arc::clone(&self.ingest);
        let channel = std::mem::take(&mut self.channel);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                ingest.release(&channel).await;
            });
        }
    }
}
