//! Best-effort writes. A failed send or close is logged and never propagated,
//! so one broken socket cannot abort the handling of its peer.

use super::protocol::ServerMessage;
use axum::extract::ws::{self, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, time::Duration};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tracing::{debug, error};

/// How long a closing side waits for its peer to answer the close frame.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Sends `msg`, returning whether it was written.
pub(crate) async fn send_best_effort<S, M>(sink: &mut S, msg: M, what: &'static str) -> bool
where
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    match sink.send(msg).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, what, "Best-effort send failed");
            false
        }
    }
}

/// Writes out anything queued on `sink`, such as the automatic reply to a
/// close frame the peer sent.
pub(crate) async fn flush_best_effort<S, M>(sink: &mut S, what: &'static str)
where
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    if let Err(e) = sink.flush().await {
        debug!(error = %e, what, "Best-effort flush failed");
    }
}

/// Discards incoming frames until the peer completes the close handshake or
/// [`CLOSE_GRACE`] runs out.
pub(crate) async fn await_close_reply<S, T, E>(stream: &mut S, what: &'static str)
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    let drain = async { while let Some(Ok(_)) = stream.next().await {} };
    if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
        debug!(what, "Peer did not answer close in time");
    }
}

/// Serializes and sends a `ServerMessage` to the client.
pub(crate) async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => send_best_effort(socket, ws::Message::Text(text.into()), "client envelope").await,
        Err(e) => {
            error!(error = %e, "Failed to serialize client envelope");
            false
        }
    }
}

/// Translates a provider close frame into one the client may receive.
///
/// Codes reserved for local use (1005, 1006, 1015) must not be sent on the
/// wire, so those become a close without a status.
pub(crate) fn client_close_frame(frame: Option<UpstreamCloseFrame>) -> Option<ws::CloseFrame> {
    let frame = frame?;
    let code = u16::from(frame.code);
    if matches!(code, 1005 | 1006 | 1015) {
        return None;
    }
    Some(ws::CloseFrame {
        code,
        reason: frame.reason.as_str().to_owned().into(),
    })
}
