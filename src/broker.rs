use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::ingest::{Ingest, IngestGuard};
use crate::models::{Message, now_ns};
use crate::mq::{MessageQueue, MqError, Subscription, subject};
use crate::store::ChatStore;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker: {0}")]
    Mq(#[from] MqError),
    #[error("broker: unable to encode message: {0}")]
    Encode(String),
    #[error("broker: unable to run ingest for chat: {0}")]
    Ingest(MqError),
}

/// Composes the log subscription and the ingest lifecycle. Decodes
/// deliveries, stamps their sequence numbers and filters out echoes of the
/// subscriber's own sends.
pub struct Broker {
    mq: Arc<dyn MessageQueue>,
    store: Arc<dyn ChatStore>,
    ingest: Arc<Ingest>,
}

/// Combined closer for a broker subscription: tears down the log
/// subscription, then releases the ingest reference.
pub struct BrokerSubscription {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    guard: Option<IngestGuard>,
}

impl BrokerSubscription {
    pub async fn close(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(guard) = self.guard.take() {
            guard.release().await;
        }
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // A remaining guard releases its ingest reference on drop.
    }
}

impl Broker {
    pub fn new(mq: Arc<dyn MessageQueue>, store: Arc<dyn ChatStore>, ingest: Arc<Ingest>) -> Broker {
        Broker { mq, store, ingest }
    }

    /// Subscribes `uid` to a channel starting at `start` (inclusive).
    /// Echoes of the subscriber's own sends are not forwarded; their
    /// sequence advances the client's last-seen marker instead.
    pub async fn subscribe(
        &self,
        channel: &str,
        uid: &str,
        start: u64,
        out: mpsc::Sender<Message>,
    ) -> Result<BrokerSubscription, BrokerError> {
        let sub = self.mq.subscribe_seq(&subject(channel), uid, start).await?;
        self.spawn_forwarder(channel, uid, sub, out, true).await
    }

    /// As `subscribe`, starting from the current wall clock. Own echoes are
    /// dropped without bookkeeping: there is no historical anchor to
    /// advance past.
    pub async fn subscribe_new(
        &self,
        channel: &str,
        uid: &str,
        out: mpsc::Sender<Message>,
    ) -> Result<BrokerSubscription, BrokerError> {
        let sub = self
            .mq
            .subscribe_timestamp(&subject(channel), uid, now_ns())
            .await?;
        self.spawn_forwarder(channel, uid, sub, out, false).await
    }

    /// Binary-encodes and publishes; the log assigns the sequence.
    pub async fn send(&self, channel: &str, msg: &Message) -> Result<(), BrokerError> {
        let data = msg.encode().map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.mq.publish(&subject(channel), data).await?;
        Ok(())
    }

    async fn spawn_forwarder(
        &self,
        channel: &str,
        uid: &str,
        mut sub: Subscription,
        out: mpsc::Sender<Message>,
        track_echo: bool,
    ) -> Result<BrokerSubscription, BrokerError> {
        let guard = match self.ingest.run(channel).await {
            Ok(guard) => guard,
            Err(err) => {
                sub.close().await;
                return Err(BrokerError::Ingest(err));
            }
        };

        let store = Arc::clone(&self.store);
        let channel = channel.to_string();
        let uid = uid.to_string();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    d = sub.recv() => {
                        let Some(d) = d else { break };
                        let mut msg = Message::decode(&d.payload).unwrap_or_else(|_| Message {
                            from_uid: "broker".to_string(),
                            text: "broker: message unavailable: decoding error".to_string(),
                            time: now_ns(),
                            ..Message::default()
                        });
                        msg.seq = d.seq;
                        if msg.from_uid != uid {
                            // Blocks while the subscriber's writer is busy;
                            // that is the backpressure path to the log.
                            if out.send(msg).await.is_err() {
                                break;
                            }
                        } else if track_echo {
                            if let Err(err) = store.update_last_client_seq(&uid, &channel, d.seq) {
                                warn!(channel = %channel, %uid, %err, "last-seen update failed");
                            }
                        }
                    }
                }
            }
            sub.close().await;
        });

        Ok(BrokerSubscription {
            stop: stop_tx,
            task: Some(task),
            guard: Some(guard),
        })
    }
}
