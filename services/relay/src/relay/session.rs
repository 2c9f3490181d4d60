//! Manages one relay session: a browser connection paired with at most one
//! provider connection, torn down together.

use super::{
    downstream::ClientFrame,
    protocol::ServerMessage,
    send::{await_close_reply, client_close_frame, flush_best_effort, send_best_effort, send_json},
    settings::{self, ClientQuery, SessionSettings},
    upstream::{self, UpstreamEvent, UpstreamSocket},
};
use crate::{config::Config, error::SessionError, state::AppState};
use axum::{
    extract::{
        RawQuery, State,
        ws::{self, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade a `/realtime` request to a relay session.
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<Arc<AppState>>,
) -> Response {
    let query = ClientQuery::parse(query.as_deref());
    let config = state.config.clone();
    ws.on_upgrade(move |socket| RelaySession::new(config, socket).run(query))
}

/// The state owned by one session. Nothing here is shared with other sessions.
pub struct RelaySession {
    id: Uuid,
    config: Arc<Config>,
    client: WebSocket,
}

impl RelaySession {
    pub fn new(config: Arc<Config>, client: WebSocket) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            client,
        }
    }

    /// Runs the session until either side goes away.
    #[instrument(name = "relay_session", skip_all, fields(session_id))]
    pub async fn run(mut self, query: ClientQuery) {
        tracing::Span::current().record("session_id", &self.id.to_string());
        info!(sample_rate = ?query.sample_rate, "Client connected");

        let (settings, upstream) = match self.open_upstream(&query).await {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                info!("Client closed before upstream was ready");
                flush_best_effort(&mut self.client, "close reply").await;
                return;
            }
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        info!("Upstream connection open");
        send_json(
            &mut self.client,
            &ServerMessage::ProxyOpen {
                params: settings.thresholds.params(),
                upstream: settings.upstream_url.to_string(),
            },
        )
        .await;

        self.relay(upstream).await;
        info!("Relay session finished");
    }

    /// Resolves the session settings and connects to the provider.
    ///
    /// Client frames that arrive while connecting are dropped. If the client
    /// leaves first the pending connect is cancelled and `None` is returned.
    async fn open_upstream(
        &mut self,
        query: &ClientQuery,
    ) -> Result<Option<(SessionSettings, UpstreamSocket)>, SessionError> {
        let settings = SessionSettings::resolve(&self.config, query)?;
        info!(upstream = %settings.upstream_url, "Upstream URL with params");

        let api_key = settings::api_key(&self.config)?;
        let request = upstream::build_request(&settings.upstream_url, api_key)?;

        info!("Connecting to upstream");
        let connect = upstream::connect(request);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Ok(Some((settings, result?))),
                msg = self.client.recv() => match msg {
                    Some(Ok(ws::Message::Close(_))) | None => return Ok(None),
                    Some(Err(e)) => {
                        warn!(error = %e, "Client error while connecting upstream");
                        return Ok(None);
                    }
                    Some(Ok(_)) => debug!("Upstream not open, ignoring client message"),
                },
            }
        }
    }

    /// Pipes frames in both directions. Each frame is fully written before
    /// the next one is read, which keeps per-direction order and lets the
    /// transports apply backpressure.
    async fn relay(&mut self, mut upstream: UpstreamSocket) {
        loop {
            tokio::select! {
                msg = self.client.recv() => match msg {
                    Some(Ok(msg)) => match ClientFrame::from(msg) {
                        ClientFrame::Audio(data) => {
                            send_best_effort(&mut upstream, WsMessage::Binary(data), "audio").await;
                        }
                        ClientFrame::Control(text) => {
                            send_best_effort(&mut upstream, WsMessage::Text(text.into()), "control").await;
                        }
                        ClientFrame::Unparseable => debug!("Dropping malformed client message"),
                        ClientFrame::Heartbeat => {}
                        ClientFrame::Close(frame) => {
                            info!(code = ?frame.as_ref().map(|f| f.code), "Client closed");
                            flush_best_effort(&mut self.client, "close reply").await;
                            close_upstream(&mut upstream).await;
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        error!(error = %e, "Client error");
                        close_upstream(&mut upstream).await;
                        return;
                    }
                    None => {
                        info!("Client disconnected");
                        close_upstream(&mut upstream).await;
                        return;
                    }
                },
                msg = upstream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.forward_upstream(text.as_str().to_owned()).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.forward_upstream(String::from_utf8_lossy(&data).into_owned()).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(code = ?frame.as_ref().map(|f| u16::from(f.code)), "Upstream closed");
                        flush_best_effort(&mut upstream, "close reply").await;
                        self.close_client(client_close_frame(frame)).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Upstream error");
                        send_json(
                            &mut self.client,
                            &ServerMessage::ProxyError { message: e.to_string() },
                        )
                        .await;
                        self.close_client(None).await;
                        return;
                    }
                    None => {
                        info!("Upstream disconnected");
                        self.close_client(None).await;
                        return;
                    }
                },
            }
        }
    }

    async fn forward_upstream(&mut self, text: String) {
        match UpstreamEvent::decode(text, self.config.upstream_debug).into_client_text() {
            Ok(Some(out)) => {
                send_best_effort(&mut self.client, ws::Message::Text(out.into()), "upstream event")
                    .await;
            }
            Ok(None) => debug!("Dropping unrecognized upstream event"),
            Err(e) => error!(error = %e, "Forward error"),
        }
    }

    /// Reports a setup failure to the client and closes its socket.
    async fn fail(&mut self, e: SessionError) {
        error!(error = %e, "Session failed");
        send_json(&mut self.client, &e.envelope()).await;
        self.close_client(None).await;
    }

    /// Starts the close handshake with the client and waits briefly for its reply.
    async fn close_client(&mut self, frame: Option<ws::CloseFrame>) {
        if send_best_effort(&mut self.client, ws::Message::Close(frame), "close").await {
            await_close_reply(&mut self.client, "client").await;
        }
    }
}

async fn close_upstream(upstream: &mut UpstreamSocket) {
    if send_best_effort(upstream, WsMessage::Close(None), "close").await {
        await_close_reply(upstream, "upstream").await;
    }
}
