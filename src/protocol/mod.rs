//! Native tool protocol: newline-delimited JSON frames over stdio or TCP.
//!
//! A client handshakes once to get a tier, then issues `call`, `list_tools`,
//! and `cancel` frames. Calls run concurrently; responses carry the call's
//! `id` and may arrive out of order. Closing the stream cancels every call
//! still in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchError, Dispatcher, Session, Tier, ToolInfo, ToolInvocation};

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Handshake {
        tier: Tier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Call {
        id: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    ListTools {
        id: String,
    },
    Cancel {
        id: String,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Handshake {
        session: String,
        tier: Tier,
    },
    Result {
        id: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Error {
        /// Absent for errors not tied to a call (bad frames, handshake).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: WireError,
    },
    Tools {
        id: String,
        tools: Vec<ToolInfo>,
    },
}

/// Structured error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<&DispatchError> for WireError {
    fn from(err: &DispatchError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl ServerFrame {
    fn error(id: Option<String>, err: &DispatchError) -> Self {
        Self::Error {
            id,
            error: WireError::from(err),
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Serve one client over any byte stream until it disconnects.
///
/// # Errors
///
/// Returns an error if reading from the stream fails.
pub async fn serve_stream<R, W>(dispatcher: Arc<Dispatcher>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(Session::new());
    let in_flight: InFlight = Arc::default();
    let (tx, rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer_task = tokio::spawn(write_frames(writer, rx));

    tracing::debug!(session = %session.id(), "client connected");
    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientFrame>(line) {
            Ok(frame) => handle_frame(&dispatcher, &session, &in_flight, &tx, frame),
            Err(e) => {
                let err = DispatchError::Protocol(format!("malformed frame: {e}"));
                send(&tx, ServerFrame::error(None, &err));
            }
        }
    };

    session.close();
    tracing::debug!(session = %session.id(), "client disconnected");
    drop(tx);
    if let Err(e) = writer_task.await {
        tracing::warn!(error = %e, "frame writer task failed");
    }
    result
}

fn handle_frame(
    dispatcher: &Arc<Dispatcher>,
    session: &Arc<Session>,
    in_flight: &InFlight,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Handshake { tier, token } => {
            let auth = &dispatcher.services().config().auth;
            let reply = if auth.permits(tier, token.as_deref()) {
                match session.handshake(tier) {
                    Ok(()) => {
                        tracing::info!(session = %session.id(), %tier, "session handshaken");
                        ServerFrame::Handshake {
                            session: session.id().to_string(),
                            tier,
                        }
                    }
                    Err(e) => ServerFrame::error(None, &e),
                }
            } else {
                tracing::warn!(session = %session.id(), %tier, "authentication failed");
                ServerFrame::error(None, &DispatchError::AuthenticationFailed(tier))
            };
            send(tx, reply);
        }
        ClientFrame::ListTools { id } => {
            let reply = match session.tier() {
                Some(tier) => ServerFrame::Tools {
                    id,
                    tools: dispatcher.list_tools(tier),
                },
                None => ServerFrame::error(Some(id), &DispatchError::Protocol("handshake required".into())),
            };
            send(tx, reply);
        }
        ClientFrame::Cancel { id } => {
            if let Some(token) = in_flight.lock().get(&id) {
                token.cancel();
            }
        }
        ClientFrame::Call {
            id,
            tool,
            arguments,
            timeout_ms,
        } => {
            let cancel = session.cancel_token().child_token();
            {
                let mut calls = in_flight.lock();
                if calls.contains_key(&id) {
                    let err = DispatchError::Protocol(format!("call id '{id}' is already in flight"));
                    send(tx, ServerFrame::error(Some(id), &err));
                    return;
                }
                calls.insert(id.clone(), cancel.clone());
            }

            let mut invocation = ToolInvocation::new(&tool, arguments);
            invocation.correlation_id.clone_from(&id);
            invocation.timeout = timeout_ms.map(Duration::from_millis);

            let dispatcher = Arc::clone(dispatcher);
            let session = Arc::clone(session);
            let in_flight = Arc::clone(in_flight);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = dispatcher.call_cancellable(&session, invocation, cancel).await;
                in_flight.lock().remove(&id);
                let reply = match outcome {
                    Ok(output) => ServerFrame::Result {
                        id,
                        result: output.result,
                        warnings: output.warnings,
                    },
                    Err(e) => ServerFrame::error(Some(id), &e),
                };
                send(&tx, reply);
            });
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<ServerFrame>, frame: ServerFrame) {
    if tx.send(frame).is_err() {
        tracing::debug!("frame writer gone; dropping frame");
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<ServerFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode frame");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "client stream closed");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

/// Serve a single client on stdin/stdout.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn serve_stdio(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    serve_stream(dispatcher, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Accept TCP clients on `addr`, one session per connection.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve_tcp(dispatcher: Arc<Dispatcher>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_stream(dispatcher, reader, writer).await {
                tracing::warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_type_tags() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"call","id":"1","tool":"search","arguments":{"query":"apple"}}"#)
                .unwrap();
        match frame {
            ClientFrame::Call {
                id, tool, arguments, ..
            } => {
                assert_eq!(id, "1");
                assert_eq!(tool, "search");
                assert_eq!(arguments["query"], "apple");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn handshake_token_is_optional() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"handshake","tier":"write"}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Handshake {
                tier: Tier::Write,
                token: None
            }
        ));
    }

    #[test]
    fn unknown_tier_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"handshake","tier":"root"}"#).is_err());
    }

    #[test]
    fn error_frames_carry_kind() {
        let err = DispatchError::TierViolation {
            tool: "reindex".into(),
            required: Tier::Admin,
            actual: Tier::Read,
        };
        let value = serde_json::to_value(ServerFrame::error(Some("7".into()), &err)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], "7");
        assert_eq!(value["error"]["kind"], "TierViolation");
        assert_eq!(value.get("warnings"), None);
    }
}
