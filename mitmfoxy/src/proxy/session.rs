use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::proxy::dialer::Dialer;
use crate::proxy::ProxyBody;

/// What is known about the client side of a session.
#[derive(Debug, Default, Clone)]
pub struct ClientConn {
    pub is_tls: bool,
    pub server_name: Option<String>,
    pub alpn: Option<Vec<u8>>,
}

/// The proxy-to-origin half of a session. Re-populated for every plaintext
/// request; created once per CONNECT tunnel and shared by all requests
/// multiplexed over it.
pub struct ServerConn {
    pub id: Uuid,
    pub addr: String,
    pub alpn: Option<Vec<u8>>,
    pub client: UpstreamClient,
}

/// Handle for issuing requests on an already-established upstream
/// connection. HTTP/1.1 requests serialize through a lock (and hyper's own
/// readiness); HTTP/2 senders clone per multiplexed request.
#[derive(Clone)]
pub enum UpstreamClient {
    Http1(Arc<AsyncMutex<http1::SendRequest<ProxyBody>>>),
    Http2(http2::SendRequest<ProxyBody>),
}

impl UpstreamClient {
    pub fn http1(sender: http1::SendRequest<ProxyBody>) -> Self {
        Self::Http1(Arc::new(AsyncMutex::new(sender)))
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, Self::Http2(_))
    }

    pub async fn send(
        &self,
        req: Request<ProxyBody>,
        target: &str,
    ) -> Result<Response<Incoming>, ProxyError> {
        let upstream_err = |e: hyper::Error| ProxyError::UpstreamHttp {
            target: target.to_string(),
            reason: e.to_string(),
        };
        match self {
            Self::Http1(sender) => {
                let mut sender = sender.lock().await;
                sender.ready().await.map_err(upstream_err)?;
                sender.send_request(req).await.map_err(upstream_err)
            }
            Self::Http2(sender) => {
                let mut sender = sender.clone();
                sender.ready().await.map_err(upstream_err)?;
                sender.send_request(req).await.map_err(upstream_err)
            }
        }
    }
}

/// Per-accepted-socket state, shared by every handler that touches the
/// connection. The dialer is a capability clone, not a reference back to
/// the front end.
pub struct Session {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    pub dialer: Dialer,
    client: Mutex<ClientConn>,
    server: AsyncMutex<Option<ServerConn>>,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, dialer: Dialer) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            dialer,
            client: Mutex::new(ClientConn::default()),
            server: AsyncMutex::new(None),
        })
    }

    /// Snapshot of the client-side facts.
    pub fn client(&self) -> ClientConn {
        self.client.lock().expect("client state lock poisoned").clone()
    }

    /// Record that the client side is an intercepted TLS stream.
    pub fn set_client_tls(&self, server_name: String, alpn: Option<Vec<u8>>) {
        let mut client = self.client.lock().expect("client state lock poisoned");
        client.is_tls = true;
        client.server_name = Some(server_name);
        client.alpn = alpn;
    }

    /// (Re)populate the upstream slot.
    pub async fn set_server(&self, conn: ServerConn) {
        *self.server.lock().await = Some(conn);
    }

    /// Clone out the current upstream handle and its target address.
    pub async fn upstream(&self) -> Option<(UpstreamClient, String)> {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|s| (s.client.clone(), s.addr.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pool::ServerConnPool;

    #[tokio::test]
    async fn test_client_snapshot_tracks_tls_state() {
        let dialer = Dialer::new(Arc::new(ServerConnPool::default()));
        let session = Session::new("127.0.0.1:4000".parse().unwrap(), dialer);

        assert!(!session.client().is_tls);
        session.set_client_tls("example.test".to_string(), Some(b"h2".to_vec()));

        let client = session.client();
        assert!(client.is_tls);
        assert_eq!(client.server_name.as_deref(), Some("example.test"));
        assert_eq!(client.alpn.as_deref(), Some(b"h2".as_slice()));
    }

    #[tokio::test]
    async fn test_upstream_slot_starts_empty() {
        let dialer = Dialer::new(Arc::new(ServerConnPool::default()));
        let session = Session::new("127.0.0.1:4000".parse().unwrap(), dialer);
        assert!(session.upstream().await.is_none());
    }
}
