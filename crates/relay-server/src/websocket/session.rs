//! WebSocket session lifecycle. Handles a single connected peer from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Span, debug, info, instrument, warn};

use super::admission::AdmissionError;
use super::connection::{Connection, Outbound, Role};
use super::registry::HubRegistry;
use super::router::handle_inbound;
use crate::metrics::{
    WS_ADMISSION_REJECTS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL,
};

/// Run a relay session for an admitted peer.
///
/// 1. Registers the connection under its role
/// 2. Forwards queued frames (relayed text, probes, close) to the socket
/// 3. Rate-limits and routes inbound text frames
/// 4. Tears the connection down when the transport closes or is terminated
#[instrument(skip_all, fields(role = %role, conn_id = tracing::field::Empty))]
pub async fn run_session(
    socket: WebSocket,
    role: Role,
    hub: Arc<HubRegistry>,
    close_grace: Duration,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (conn, outbound_rx) = hub.admit(role);
    let _ = Span::current().record("conn_id", conn.id.as_str());

    info!("peer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let writer = tokio::spawn(write_outbound(
        ws_tx,
        outbound_rx,
        Arc::clone(&conn),
        close_grace,
    ));

    loop {
        let msg = tokio::select! {
            () = conn.terminated() => {
                debug!("connection terminated");
                break;
            }
            msg = ws_rx.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                let _ = handle_inbound(&hub, &conn, text.as_str(), Instant::now());
            }
            Some(Ok(Message::Binary(data))) => {
                // Non-UTF-8 payloads still count against the rate limit and
                // are then discarded as invalid JSON.
                let text = String::from_utf8_lossy(&data);
                let _ = handle_inbound(&hub, &conn, &text, Instant::now());
            }
            Some(Ok(Message::Pong(_))) => conn.mark_alive(),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "peer sent close frame");
                break;
            }
            Some(Err(error)) => {
                debug!(%error, "transport error");
                break;
            }
            None => break,
        }
    }

    hub.teardown(&conn);
    writer.abort();
    histogram!(WS_CONNECTION_DURATION_SECONDS)
        .record(conn.connected_at.elapsed().as_secs_f64());
    info!(dropped = conn.drop_count(), "peer disconnected");
}

/// Drain `rx` into the socket until the connection ends.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    conn: Arc<Connection>,
    close_grace: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = conn.terminated() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = match frame {
            Outbound::Text(text) => ws_tx.send(Message::Text(text.to_string().into())).await,
            Outbound::Probe => ws_tx.send(Message::Ping(Vec::new().into())).await,
            Outbound::Close(reason) => {
                let close = Message::Close(Some(CloseFrame {
                    code: reason.code(),
                    reason: reason.to_string().into(),
                }));
                if let Err(error) = ws_tx.send(close).await {
                    debug!(%error, "failed to send close frame");
                } else if tokio::time::timeout(close_grace, conn.terminated())
                    .await
                    .is_err()
                {
                    debug!(?close_grace, "peer did not finish close handshake");
                }
                break;
            }
        };

        if let Err(error) = result {
            debug!(%error, "socket write failed");
            break;
        }
    }
    // Unblock the reader so the session can tear down.
    conn.terminate();
}

/// Refuse a connection that failed admission: close with a policy violation
/// and the reason, before any message exchange.
#[instrument(skip_all, fields(reason = %error))]
pub async fn reject(mut socket: WebSocket, error: AdmissionError, close_grace: Duration) {
    counter!(WS_ADMISSION_REJECTS_TOTAL, "reason" => reject_label(error)).increment(1);
    warn!("rejecting connection");

    let close = Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::POLICY,
        reason: error.to_string().into(),
    }));
    if socket.send(close).await.is_err() {
        return;
    }
    // Give the peer a chance to acknowledge before the socket is dropped.
    let _ = tokio::time::timeout(close_grace, async {
        while let Some(Ok(_)) = socket.recv().await {}
    })
    .await;
}

fn reject_label(error: AdmissionError) -> &'static str {
    match error {
        AdmissionError::MissingIdentifier => "missing",
        AdmissionError::ConflictingIdentifiers => "conflicting",
    }
}
