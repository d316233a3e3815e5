pub mod dialer;
pub mod http;
pub mod pool;
pub mod session;
pub mod tee;
pub mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ::http::{Method, Request, Response, Uri};
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::cert::CertStore;
use crate::error::ProxyError;
use crate::observer::Observer;
pub use dialer::Dialer;
pub use pool::ServerConnPool;
pub use session::Session;

/// Body type used throughout the proxy. Carrying [`ProxyError`] means
/// mid-stream transport failures surface through the error taxonomy
/// instead of raw hyper errors.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Proxy configuration, filled in by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port, bound on all interfaces.
    pub port: u16,
    /// Root CA certificate PEM path.
    pub ca_cert_path: PathBuf,
    /// Root CA private key PEM path.
    pub ca_key_path: PathBuf,
    /// Expose captured flows on the `/ws` WebSocket endpoint.
    pub websocket: bool,
    /// Skip certificate verification when dialing origins. Interception of
    /// self-signed test origins depends on this; default on.
    pub trust_any_upstream: bool,
    /// Cap on captured body bytes per direction; flows over the cap are
    /// marked truncated. `None` captures everything.
    pub max_capture_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8989,
            ca_cert_path: PathBuf::from("ca/ca.crt"),
            ca_key_path: PathBuf::from("ca/ca.key"),
            websocket: false,
            trust_any_upstream: true,
            max_capture_bytes: None,
        }
    }
}

/// Shared state handed to every connection handler.
pub(crate) struct ProxyCtx {
    pub config: Config,
    pub certs: Arc<CertStore>,
    pub pool: Arc<ServerConnPool>,
    pub observer: Observer,
    pub cancel: watch::Receiver<bool>,
}

/// The proxy front end: accept loop plus per-request dispatch.
pub struct Proxy {
    config: Config,
    certs: Arc<CertStore>,
    pool: Arc<ServerConnPool>,
    observer: Observer,
}

/// Request handlers, keyed by URI scheme. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Tls,
}

impl Scheme {
    fn for_name(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Tls),
            _ => None,
        }
    }
}

impl Proxy {
    /// Build the proxy, loading (or initializing) the CA material. A CA
    /// that exists but cannot be parsed is fatal.
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        let certs = Arc::new(CertStore::load_or_init(
            &config.ca_cert_path,
            &config.ca_key_path,
        )?);
        let observer = Observer::new(config.websocket);
        Ok(Self {
            config,
            certs,
            pool: Arc::new(ServerConnPool::default()),
            observer,
        })
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.certs.ca_cert_pem()
    }

    /// Accept loop. Runs until the cancellation channel fires; `ready`
    /// receives the bound address once the socket is listening.
    pub async fn run(
        &self,
        mut cancel: watch::Receiver<bool>,
        ready: oneshot::Sender<SocketAddr>,
    ) -> Result<()> {
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind proxy on {listen_addr}"))?;
        let local_addr = listener.local_addr().context("failed to read bound address")?;

        info!("proxy listening on {local_addr}");
        let _ = ready.send(local_addr);

        let ctx = Arc::new(ProxyCtx {
            config: self.config.clone(),
            certs: self.certs.clone(),
            pool: self.pool.clone(),
            observer: self.observer.clone(),
            cancel: cancel.clone(),
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result.context("failed to accept connection")?;
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        serve_client(ctx, stream, peer_addr).await;
                    });
                }
                _ = cancel.changed() => {
                    info!("proxy received shutdown signal");
                    break;
                }
            }
        }

        self.pool.close_all();
        Ok(())
    }
}

async fn serve_client(ctx: Arc<ProxyCtx>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
    let session = Session::new(peer_addr, Dialer::new(ctx.pool.clone()));
    let service = service_fn({
        let ctx = ctx.clone();
        let session = session.clone();
        move |req| {
            let ctx = ctx.clone();
            let session = session.clone();
            async move {
                let resp = match route(&ctx, &session, req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(peer = %session.peer_addr, "request failed: {e}");
                        error_response(&e)
                    }
                };
                Ok::<_, std::convert::Infallible>(resp)
            }
        }
    });

    if let Err(e) = server_http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("connection from {peer_addr} ended: {e}");
    }
}

/// Per-request dispatch: CONNECT enters the TLS handler, absolute-form
/// requests go to their scheme's handler, origin-form `GET /ws` reaches the
/// observer, everything else is a client error.
async fn route(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        return tls::handle_connect(ctx, session, req).await;
    }

    if is_absolute(req.uri()) {
        let scheme = req.uri().scheme_str().unwrap_or("");
        return match Scheme::for_name(scheme) {
            Some(Scheme::Http) => http::handle(ctx, session, req).await,
            Some(Scheme::Tls) => tls::handle_connect(ctx, session, req).await,
            None => Err(ProxyError::UnsupportedProtocol(scheme.to_string())),
        };
    }

    if req.method() == Method::GET && req.uri().path() == "/ws" {
        return Ok(ctx.observer.handle_ws(req));
    }

    Err(ProxyError::BadRequest(
        "request must be absolute-form or CONNECT".to_string(),
    ))
}

fn is_absolute(uri: &Uri) -> bool {
    uri.scheme_str().is_some() && uri.host().is_some_and(|h| !h.is_empty())
}

pub(crate) fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(err.to_string()));
    *resp.status_mut() = err.status();
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::http::StatusCode;

    #[test]
    fn test_scheme_sum_is_closed() {
        assert_eq!(Scheme::for_name("http"), Some(Scheme::Http));
        assert_eq!(Scheme::for_name("https"), Some(Scheme::Tls));
        assert_eq!(Scheme::for_name("ftp"), None);
        assert_eq!(Scheme::for_name(""), None);
    }

    #[test]
    fn test_is_absolute() {
        assert!(is_absolute(&"http://origin.test/".parse().unwrap()));
        assert!(!is_absolute(&"/path".parse().unwrap()));
    }

    #[test]
    fn test_error_response_carries_reason() {
        let err = ProxyError::Dial {
            target: "origin.test:80".to_string(),
            reason: "connection refused".to_string(),
        };
        let resp = error_response(&err);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8989);
        assert!(!config.websocket);
        assert!(config.trust_any_upstream);
        assert!(config.max_capture_bytes.is_none());
    }
}
