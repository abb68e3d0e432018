//! Websocket push-event source feeding the engine's event loop.

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::protocol::RawEvent;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, trace, warn};

/// One websocket text frame: either a push event or a reply to a client
/// action such as the authentication challenge.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(RawEvent),
    Reply { seq_reply: Option<i64>, status: String },
}

pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("event").is_some() {
        return serde_json::from_value(value).map(Frame::Event);
    }
    Ok(Frame::Reply {
        seq_reply: value.get("seq_reply").and_then(Value::as_i64),
        status: value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn authentication_challenge(token: &str) -> String {
    json!({
        "seq": 1,
        "action": "authentication_challenge",
        "data": { "token": token },
    })
    .to_string()
}

/// Connects to `url`, authenticates when a token is given, and forwards
/// every push event to `sender` in delivery order. The returned task ends
/// when the socket closes or the receiver is dropped.
pub async fn spawn_event_source(
    url: &str,
    auth_token: Option<&str>,
    sender: mpsc::Sender<RawEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    let (ws_stream, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();
    if let Some(token) = auth_token {
        ws_writer
            .send(Message::Text(authentication_challenge(token)))
            .await
            .context("failed to send websocket authentication challenge")?;
    }
    info!(%url, "transport: event stream connected");

    Ok(tokio::spawn(async move {
        let _writer = ws_writer;
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match parse_frame(&text) {
                    Ok(Frame::Event(event)) => {
                        if sender.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Reply { seq_reply, status }) => {
                        trace!(?seq_reply, %status, "transport: action reply");
                    }
                    Err(err) => warn!(error = %err, "transport: invalid frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "transport: websocket read failed");
                    break;
                }
            }
        }
        info!("transport: event stream closed");
    }))
}
