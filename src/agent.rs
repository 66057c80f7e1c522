use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rocket_ws as ws;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError};
use crate::limits::{Limit, Policy, ValidationError};
use crate::models::{Message, User, now_ns};
use crate::store::{ChatStore, StoreError};

/// Inbound text above this many bytes is rejected.
pub const MAX_TEXT_BYTES: usize = 1024;
/// Widest window served by a single history request.
const MAX_HISTORY_COUNT: u64 = 512;
/// Messages pushed to a client that connects without a resume point.
const RECENT_COUNT: i64 = 100;
/// Bounds the drain of a history batch whose window reaches past the
/// channel head.
const HISTORY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame type codes of the client protocol envelope.
pub mod frame_type {
    pub const CHAT: u8 = 0;
    pub const HISTORY: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const INFO: u8 = 3;
    pub const HISTORY_REQ: u8 = 4;
}

/// JSON envelope of every frame after the init request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    pub fn chat(msg: &Message) -> Frame {
        Frame {
            kind: frame_type::CHAT,
            data: serde_json::to_value(msg).ok(),
            error: None,
        }
    }

    pub fn history(msgs: &[Message]) -> Frame {
        Frame {
            kind: frame_type::HISTORY,
            data: serde_json::to_value(msgs).ok(),
            error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Frame {
        Frame {
            kind: frame_type::ERROR,
            data: None,
            error: Some(text.into()),
        }
    }
}

/// First frame on a fresh connection; a plain object, not enveloped.
#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub channel: String,
    pub uid: String,
    pub secret: String,
    #[serde(default)]
    pub last_seq: Option<u64>,
}

/// Validates an init request against the charset and length policies.
pub fn bind_init(req: &InitRequest, policy: &Policy) -> Result<(), ValidationError> {
    policy.check_name("uid", &req.uid)?;
    policy.check_name("secret", &req.secret)?;
    policy.check_name("channel", &req.channel)?;
    policy.check_len_all(&[
        (&req.uid, Limit::Uid),
        (&req.secret, Limit::Secret),
        (&req.channel, Limit::Chan),
    ])
}

#[derive(Debug, Deserialize)]
struct InboundChat {
    #[serde(default)]
    meta: HashMap<String, String>,
    #[serde(default)]
    seq: u64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct HistoryRequest {
    to: u64,
}

enum PushRecentError {
    Store(StoreError),
    Transport,
}

/// Per-connection state machine. Owns the socket for the lifetime of the
/// connection and runs the reader and writer loops around the broker's
/// out-channel.
pub struct Agent {
    broker: Arc<Broker>,
    store: Arc<dyn ChatStore>,
}

impl Agent {
    pub fn new(broker: Arc<Broker>, store: Arc<dyn ChatStore>) -> Agent {
        Agent { broker, store }
    }

    /// Drives a validated connection: join, pick a resume strategy, then
    /// run the loops until the peer goes away.
    pub async fn handle<R, W>(&self, reader: R, mut writer: W, init: InitRequest)
    where
        R: Stream<Item = Result<ws::Message, ws::result::Error>> + Unpin + Send,
        W: Sink<ws::Message> + Unpin + Send + 'static,
        W::Error: Send,
    {
        let mut chat = match self.store.get(&init.channel) {
            Ok(chat) => chat,
            Err(err) => {
                write_fatal(&mut writer, format!("agent: unable to find chat: {err}")).await;
                return;
            }
        };
        let user = match chat.join(&init.uid, &init.secret) {
            Ok(user) => user,
            Err(err) => {
                write_fatal(&mut writer, format!("agent: unable to join chat: {err}")).await;
                return;
            }
        };

        let (mc_tx, mc_rx) = mpsc::channel::<Message>(1);
        let sub = if let Some(last) = init.last_seq {
            self.broker
                .subscribe(&init.channel, &user.uid, last, mc_tx.clone())
                .await
        } else {
            match self.push_recent(&mut writer, &init.channel, &user.uid).await {
                Ok(Some(seq)) => {
                    self.broker
                        .subscribe(&init.channel, &user.uid, seq, mc_tx.clone())
                        .await
                }
                Ok(None) => {
                    self.broker
                        .subscribe(&init.channel, &user.uid, 0, mc_tx.clone())
                        .await
                }
                Err(PushRecentError::Transport) => return,
                Err(PushRecentError::Store(err)) => {
                    write_err(
                        &mut writer,
                        format!("agent: unable to fetch chat history: {err}"),
                    )
                    .await;
                    self.broker
                        .subscribe_new(&init.channel, &user.uid, mc_tx.clone())
                        .await
                }
            }
        };
        drop(mc_tx);

        let sub = match sub {
            Ok(sub) => sub,
            Err(err) => {
                write_fatal(
                    &mut writer,
                    format!(
                        "agent: unable to subscribe to chat updates due to: {err}. closing connection"
                    ),
                )
                .await;
                return;
            }
        };

        self.run_loops(reader, writer, sub, mc_rx, init.channel, user)
            .await;
    }

    /// Pushes the recent history snapshot and returns the resume point,
    /// or `None` when the channel has no history yet.
    async fn push_recent<W>(
        &self,
        writer: &mut W,
        channel: &str,
        uid: &str,
    ) -> Result<Option<u64>, PushRecentError>
    where
        W: Sink<ws::Message> + Unpin + Send,
    {
        let (msgs, seq) = self
            .store
            .get_recent(channel, RECENT_COUNT)
            .map_err(PushRecentError::Store)?;
        if msgs.is_empty() {
            return Ok(None);
        }
        if let Some(last) = msgs.last()
            && let Err(err) = self.store.update_last_client_seq(uid, channel, last.seq)
        {
            warn!(channel = %channel, %uid, %err, "last-seen update failed");
        }
        write_frame(writer, &Frame::history(&msgs))
            .await
            .map_err(|_| PushRecentError::Transport)?;
        Ok(Some(seq))
    }

    async fn run_loops<R, W>(
        &self,
        mut reader: R,
        writer: W,
        sub: crate::broker::BrokerSubscription,
        mut mc_rx: mpsc::Receiver<Message>,
        channel: String,
        user: User,
    ) where
        R: Stream<Item = Result<ws::Message, ws::result::Error>> + Unpin + Send,
        W: Sink<ws::Message> + Unpin + Send + 'static,
        W::Error: Send,
    {
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(32);
        let (done_tx, mut done_rx) = watch::channel(false);

        let store = Arc::clone(&self.store);
        let writer_channel = channel.clone();
        let writer_uid = user.uid.clone();
        let mut writer = writer;
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = done_rx.changed() => break,
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    msg = mc_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let seq = msg.seq;
                        if write_frame(&mut writer, &Frame::chat(&msg)).await.is_err() {
                            break;
                        }
                        if let Err(err) =
                            store.update_last_client_seq(&writer_uid, &writer_channel, seq)
                        {
                            warn!(channel = %writer_channel, uid = %writer_uid, %err,
                                "last-seen update failed");
                        }
                    }
                }
            }
            let _ = writer.close().await;
        });

        while let Some(item) = reader.next().await {
            match item {
                Ok(ws::Message::Text(text)) => {
                    self.handle_client_frame(&text, &channel, &user, &frame_tx)
                        .await;
                }
                Ok(ws::Message::Close(_)) => break,
                Ok(_) => {}
                Err(ws::result::Error::ConnectionClosed | ws::result::Error::AlreadyClosed) => {
                    break;
                }
                Err(err) => {
                    // Non-fatal: report and keep reading.
                    let _ = frame_tx.send(Frame::error(err.to_string())).await;
                }
            }
        }

        let _ = done_tx.send(true);
        let _ = writer_task.await;
        sub.close().await;
        debug!(channel = %channel, uid = %user.uid, "connection closed");
    }

    async fn handle_client_frame(
        &self,
        raw: &str,
        channel: &str,
        user: &User,
        out: &mpsc::Sender<Frame>,
    ) {
        let frame: Frame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = out
                    .send(Frame::error(format!("invalid message format: {err}")))
                    .await;
                return;
            }
        };
        match frame.kind {
            frame_type::CHAT => self.handle_chat(frame.data, channel, user, out).await,
            frame_type::HISTORY_REQ => self.handle_history_req(frame.data, channel, out).await,
            _ => {}
        }
    }

    async fn handle_chat(
        &self,
        data: Option<Value>,
        channel: &str,
        user: &User,
        out: &mpsc::Sender<Frame>,
    ) {
        let req: InboundChat = match serde_json::from_value(data.unwrap_or(Value::Null)) {
            Ok(req) => req,
            Err(err) => {
                let _ = out
                    .send(Frame::error(format!("invalid text message format: {err}")))
                    .await;
                return;
            }
        };
        if req.text.is_empty() {
            let _ = out.send(Frame::error("sent empty message")).await;
            return;
        }
        if req.text.len() > MAX_TEXT_BYTES {
            let _ = out
                .send(Frame::error(
                    "exceeded max message length of 1024 characters",
                ))
                .await;
            return;
        }

        let msg = Message {
            meta: req.meta,
            time: now_ns(),
            seq: req.seq,
            text: req.text,
            from_uid: user.uid.clone(),
            from_name: user.display_name.clone(),
        };
        if let Err(err) = self.broker.send(channel, &msg).await {
            let _ = out
                .send(Frame::error(format!(
                    "could not forward your message. try again: {err}"
                )))
                .await;
        }
    }

    async fn handle_history_req(&self, data: Option<Value>, channel: &str, out: &mpsc::Sender<Frame>) {
        let req: HistoryRequest = match serde_json::from_value(data.unwrap_or(Value::Null)) {
            Ok(req) => req,
            Err(err) => {
                let _ = out
                    .send(Frame::error(format!(
                        "invalid history request message format: {err}"
                    )))
                    .await;
                return;
            }
        };
        if req.to == 0 {
            return;
        }
        match self.build_history_batch(channel, req.to).await {
            Ok(msgs) => {
                let _ = out.send(Frame::history(&msgs)).await;
            }
            Err(err) => {
                let _ = out
                    .send(Frame::error(format!("could not fetch chat history: {err}")))
                    .await;
            }
        }
    }

    /// Replays `[to - 512, to)` through a throwaway subscription. The
    /// empty uid disables the echo filter so the batch is complete. The
    /// drain is bounded: a window past the channel head returns what
    /// exists instead of waiting for future messages.
    async fn build_history_batch(&self, channel: &str, to: u64) -> Result<Vec<Message>, BrokerError> {
        let offset = to.saturating_sub(MAX_HISTORY_COUNT);
        let (tx, mut rx) = mpsc::channel::<Message>(32);
        let sub = self.broker.subscribe(channel, "", offset, tx).await?;

        let mut msgs = Vec::new();
        loop {
            match tokio::time::timeout(HISTORY_DRAIN_TIMEOUT, rx.recv()).await {
                Ok(Some(msg)) if msg.seq >= to => break,
                Ok(Some(msg)) => msgs.push(msg),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        // The forwarder may still be mid-send; dropping the receiver lets
        // it wind down so the close below does not wait on it.
        drop(rx);
        sub.close().await;
        Ok(msgs)
    }
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ()>
where
    W: Sink<ws::Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    writer.send(ws::Message::Text(text)).await.map_err(|_| ())
}

/// Writes a non-fatal error frame; the connection stays up.
pub(crate) async fn write_err<W>(writer: &mut W, text: impl Into<String>)
where
    W: Sink<ws::Message> + Unpin,
{
    let _ = write_frame(writer, &Frame::error(text)).await;
}

/// Writes an error frame, then closes the socket.
pub(crate) async fn write_fatal<W>(writer: &mut W, text: impl Into<String>)
where
    W: Sink<ws::Message> + Unpin,
{
    let _ = write_frame(writer, &Frame::error(text)).await;
    let _ = writer.close().await;
}
