use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::flow::Flow;
use crate::proxy::{empty_body, ProxyBody};

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out bus for captured flows.
///
/// Publishing never blocks the request path: subscribers that lag lose
/// messages, subscribers whose socket writes fail are dropped. With the
/// observer disabled, publishing is a no-op and `/ws` answers `400`.
#[derive(Clone)]
pub struct Observer {
    enabled: bool,
    tx: broadcast::Sender<Arc<Flow>>,
}

impl Observer {
    pub fn new(enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { enabled, tx }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Best-effort publish; errors (no subscribers) are ignored.
    pub fn publish(&self, flow: Flow) {
        if !self.enabled {
            return;
        }
        let _ = self.tx.send(Arc::new(flow));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Flow>> {
        self.tx.subscribe()
    }

    /// Handle `GET /ws`: upgrade to a WebSocket and stream one JSON message
    /// per flow until the peer goes away.
    pub fn handle_ws<B: Send + 'static>(&self, req: Request<B>) -> Response<ProxyBody> {
        if !self.enabled {
            return status_response(StatusCode::BAD_REQUEST);
        }

        let Some(accept) = websocket_accept(&req) else {
            return status_response(StatusCode::BAD_REQUEST);
        };

        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("websocket upgrade failed: {e}");
                    return;
                }
            };
            let io = TokioIo::new(upgraded);
            let mut ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
            debug!("observer subscriber connected");

            loop {
                tokio::select! {
                    flow = rx.recv() => match flow {
                        Ok(flow) => {
                            let Ok(text) = serde_json::to_string(flow.as_ref()) else {
                                continue;
                            };
                            if ws.send(Message::text(text)).await.is_err() {
                                debug!("observer subscriber write failed, dropping");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("observer subscriber lagged, skipped {missed} flows");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(empty_body())
            .expect("static response")
    }
}

/// Validate the upgrade headers and compute `Sec-WebSocket-Accept`.
fn websocket_accept<B>(req: &Request<B>) -> Option<String> {
    let connection = req.headers().get(header::CONNECTION)?.to_str().ok()?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return None;
    }
    let upgrade = req.headers().get(header::UPGRADE)?.to_str().ok()?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    let key = req.headers().get(header::SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("static response")
}
