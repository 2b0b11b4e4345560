//! Worker WebSocket endpoint
//!
//! Glues one socket to one session: the first frame must be a `hello`; the
//! session layer authenticates it and issues the session id. Afterwards the
//! reader loop feeds heartbeats and command results into the session
//! manager while a writer task drains the session's outbound channel.
//! Protocol violations terminate the session and close the socket; the
//! worker is expected to reconnect with a fresh hello.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{DispatcherFrame, WorkerFrame};
use crate::session::Session;

use super::server::AppState;

/// How long a fresh connection may take to present its hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound channel depth per connection
const OUTBOUND_BUFFER: usize = 64;

/// GET /ws/worker
pub async fn worker_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(state, socket))
}

async fn handle_worker_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must be a hello, promptly.
    let hello = match tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
            Ok(WorkerFrame::Hello(hello)) => hello,
            Ok(_) => {
                warn!("Worker channel opened with a non-hello frame");
                let _ = sink.close().await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "Malformed first frame on worker channel");
                let _ = sink.close().await;
                return;
            }
        },
        _ => {
            debug!("Worker channel closed before hello");
            let _ = sink.close().await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<DispatcherFrame>(OUTBOUND_BUFFER);
    let (session, ack) = match state.dispatcher.sessions().open(hello, out_tx).await {
        Ok(opened) => opened,
        Err(err) => {
            info!(kind = err.kind(), "Rejected worker hello");
            let _ = sink.close().await;
            return;
        }
    };

    // Single writer task: the session's outbound channel serializes all
    // frame writes, so dispatch order on the wire matches enqueue order.
    let writer_closed = session.closed();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { break };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                () = writer_closed.cancelled() => break,
            }
        }
        let _ = sink.close().await;
    });

    if session
        .send(DispatcherFrame::HelloAck(ack))
        .await
        .is_err()
    {
        state
            .dispatcher
            .sessions()
            .terminate(&session.session_id, "hello-ack undeliverable");
        writer.abort();
        return;
    }

    read_loop(&state, &session, &mut stream).await;

    state
        .dispatcher
        .sessions()
        .terminate(&session.session_id, "channel closed");
    // The cancelled token stops the writer; abort is only a backstop.
    writer.abort();
}

async fn read_loop(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    stream: &mut futures::stream::SplitStream<WebSocket>,
) {
    let closed = session.closed();
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            () = closed.cancelled() => return,
        };

        let Some(Ok(message)) = message else { return };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            // Pings are answered by the transport; nothing else is expected.
            _ => continue,
        };

        let frame: WorkerFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "Malformed frame; closing session"
                );
                return;
            }
        };

        match frame {
            WorkerFrame::Heartbeat(heartbeat) => {
                match state
                    .dispatcher
                    .sessions()
                    .handle_heartbeat(&session.session_id, &heartbeat)
                {
                    Ok(ack) => {
                        if session.send(DispatcherFrame::HeartbeatAck(ack)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(
                            session_id = %session.session_id,
                            kind = err.kind(),
                            "Heartbeat rejected; closing session"
                        );
                        return;
                    }
                }
            }
            WorkerFrame::CommandResult(result) => {
                if let Err(err) = state
                    .dispatcher
                    .sessions()
                    .handle_result(&session.session_id, result)
                {
                    warn!(
                        session_id = %session.session_id,
                        kind = err.kind(),
                        "Result rejected; closing session"
                    );
                    return;
                }
            }
            WorkerFrame::Hello(_) => {
                // A second hello on a live channel is a protocol violation;
                // reconnection happens on a fresh channel.
                warn!(
                    session_id = %session.session_id,
                    "Unexpected hello on live session; closing"
                );
                return;
            }
        }
    }
}
