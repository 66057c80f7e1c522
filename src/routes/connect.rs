use futures_util::{Sink, Stream, StreamExt};
use rocket::{State, get};
use rocket_ws as ws;
use std::sync::Arc;

use crate::agent::{Agent, InitRequest, bind_init, write_fatal};
use crate::broker::Broker;
use crate::config::Config;
use crate::limits::Policy;
use crate::store::ChatStore;

/// GET /connect — upgrades to the chat socket protocol. The first frame
/// must be an init request; everything after it is enveloped.
#[get("/connect")]
pub fn connect(
    ws: ws::WebSocket,
    broker: &State<Arc<Broker>>,
    store: &State<Arc<dyn ChatStore>>,
    cfg: &State<Config>,
) -> ws::Channel<'static> {
    let broker = Arc::clone(broker);
    let store = Arc::clone(store);
    let policy = cfg.policy.clone();
    ws.channel(move |stream| {
        Box::pin(async move {
            let (mut sink, mut reader) = stream.split();
            let Some(init) = wait_init(&mut reader, &mut sink, &policy).await else {
                return Ok(());
            };
            Agent::new(broker, store).handle(reader, sink, init).await;
            Ok(())
        })
    })
}

/// Reads frames until the init request arrives. Returns `None` when the
/// peer goes away or the request is invalid (an error frame has been
/// written and the socket closed).
async fn wait_init<R, W>(reader: &mut R, sink: &mut W, policy: &Policy) -> Option<InitRequest>
where
    R: Stream<Item = Result<ws::Message, ws::result::Error>> + Unpin,
    W: Sink<ws::Message> + Unpin,
{
    loop {
        match reader.next().await? {
            Ok(ws::Message::Text(text)) => {
                let init: InitRequest = match serde_json::from_str(&text) {
                    Ok(init) => init,
                    Err(err) => {
                        write_fatal(sink, format!("invalid init message: {err}")).await;
                        return None;
                    }
                };
                if let Err(err) = bind_init(&init, policy) {
                    write_fatal(sink, err.to_string()).await;
                    return None;
                }
                return Some(init);
            }
            Ok(ws::Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}
