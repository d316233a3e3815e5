use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::proxy::pool::ServerConnPool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens upstream TCP connections for proxied requests.
///
/// Handed to each session as a narrow capability so handlers can dial
/// without holding a reference back to the front end.
#[derive(Clone)]
pub struct Dialer {
    pool: Arc<ServerConnPool>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(pool: Arc<ServerConnPool>) -> Self {
        Self {
            pool,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Resolve the target of `uri` (scheme-defaulted port) and connect,
    /// reusing a pooled connection when one is parked for the address.
    pub async fn dial(&self, uri: &Uri) -> Result<TcpStream, ProxyError> {
        let addr = target_address(uri)?;

        if let Some(parent) = proxy_from_env(uri.scheme_str()) {
            // TODO: route through the parent proxy instead of dialing direct.
            debug!("parent proxy {parent} configured but not used");
        }

        if let Some(conn) = self.pool.get(&addr) {
            debug!("reusing pooled connection to {addr}");
            return Ok(conn);
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Dial {
                target: addr.clone(),
                reason: "connect timeout".to_string(),
            })?
            .map_err(|e| ProxyError::Dial {
                target: addr.clone(),
                reason: e.to_string(),
            })?;
        Ok(stream)
    }

    /// Park a finished connection for reuse by later requests.
    pub fn release(&self, addr: &str, stream: TcpStream) {
        self.pool.put(addr, stream);
    }
}

/// `host:port` for a request URI, filling the default port for the scheme:
/// 80 for `http`, 443 for `https`.
pub fn target_address(uri: &Uri) -> Result<String, ProxyError> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::BadRequest("request target has no host".to_string()))?;

    let port = uri.port_u16().or(match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    });
    let Some(port) = port else {
        return Err(ProxyError::UnsupportedProtocol(
            uri.scheme_str().unwrap_or("").to_string(),
        ));
    };

    // IPv6 literals need brackets in `host:port` form; `Uri::host` may or
    // may not have kept them.
    if host.starts_with('[') {
        Ok(format!("{host}:{port}"))
    } else if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

/// Parent-proxy configuration from the conventional environment variables.
/// Reserved: the value is surfaced for logging only.
fn proxy_from_env(scheme: Option<&str>) -> Option<String> {
    if std::env::var("NO_PROXY").is_ok() {
        return None;
    }
    let var = match scheme {
        Some("https") => "HTTPS_PROXY",
        _ => "HTTP_PROXY",
    };
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_http() {
        let uri: Uri = "http://origin.test/path".parse().unwrap();
        assert_eq!(target_address(&uri).unwrap(), "origin.test:80");
    }

    #[test]
    fn test_default_port_https() {
        let uri: Uri = "https://origin.test/".parse().unwrap();
        assert_eq!(target_address(&uri).unwrap(), "origin.test:443");
    }

    #[test]
    fn test_explicit_port_wins() {
        let uri: Uri = "http://origin.test:8080/".parse().unwrap();
        assert_eq!(target_address(&uri).unwrap(), "origin.test:8080");
    }

    #[test]
    fn test_ipv6_host_bracketed() {
        let uri: Uri = "http://[::1]:8080/".parse().unwrap();
        assert_eq!(target_address(&uri).unwrap(), "[::1]:8080");
    }

    #[test]
    fn test_missing_host_rejected() {
        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            target_address(&uri),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_unknown_scheme_without_port_rejected() {
        let uri: Uri = "ftp://origin.test/".parse().unwrap();
        assert!(matches!(
            target_address(&uri),
            Err(ProxyError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_connects_and_reuses_pool() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = Dialer::new(Arc::new(ServerConnPool::default()));
        let uri: Uri = format!("http://{addr}/").parse().unwrap();
        let stream = dialer.dial(&uri).await.unwrap();
        let (_server, _) = accept.await.unwrap();

        let local = stream.local_addr().unwrap();
        dialer.release(&target_address(&uri).unwrap(), stream);

        // The next dial for the same target must hand back the parked socket.
        let reused = dialer.dial(&uri).await.unwrap();
        assert_eq!(reused.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to find a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::new(Arc::new(ServerConnPool::default()));
        let uri: Uri = format!("http://{addr}/").parse().unwrap();
        let err = dialer.dial(&uri).await.unwrap_err();
        assert!(matches!(err, ProxyError::Dial { .. }), "got {err:?}");
    }
}
