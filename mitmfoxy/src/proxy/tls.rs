use std::sync::{Arc, OnceLock};

use http::{Method, Request, Response, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::Acceptor;
use rustls::{CipherSuite, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::proxy::session::{ServerConn, Session, UpstreamClient};
use crate::proxy::http as http_handler;
use crate::proxy::{empty_body, error_response, ProxyBody, ProxyCtx};

/// Handle a CONNECT request: acknowledge the tunnel, take over the raw
/// socket, and run the interception state machine on it.
pub async fn handle_connect(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() != Method::CONNECT {
        return Err(ProxyError::BadRequest(
            "https requests must arrive through CONNECT".to_string(),
        ));
    }
    let authority = req.uri().authority().cloned().ok_or_else(|| {
        ProxyError::BadRequest("CONNECT target must be host:port".to_string())
    })?;
    let host = authority.host().trim_matches(['[', ']']).to_string();
    let port = authority.port_u16().unwrap_or(443);

    let ctx = ctx.clone();
    let session = session.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel(&ctx, &session, upgraded, &host, port).await {
                    warn!(peer = %session.peer_addr, "tunnel to {host}:{port} failed: {e}");
                }
            }
            Err(e) => warn!("CONNECT upgrade failed: {e}"),
        }
    });

    // The 200 tells the client to start its TLS handshake on this socket.
    Ok(Response::new(empty_body()))
}

/// The dual-handshake state machine.
///
/// The upstream handshake must finish first: the leaf certificate needs the
/// SNI, and the ALPN advertised back to the client must be whatever the
/// origin actually committed to.
async fn tunnel(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    upgraded: Upgraded,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    let addr = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let dial_uri: Uri = format!("https://{addr}")
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("invalid CONNECT target {addr}")))?;

    // Dial the origin before touching the client's handshake; a dead target
    // fails the whole tunnel immediately.
    let tcp = session.dialer.dial(&dial_uri).await?;

    let start = LazyConfigAcceptor::new(Acceptor::default(), TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;

    let (sni, offered_alpn, offered_ciphers) = {
        let hello = start.client_hello();
        // Clients never put IP literals in SNI; the CONNECT host covers
        // that case and yields an IP-SAN leaf.
        let sni = hello
            .server_name()
            .map_or_else(|| host.to_string(), ToString::to_string);
        let alpn: Vec<Vec<u8>> = hello
            .alpn()
            .map(|protos| protos.map(<[u8]>::to_vec).collect())
            .unwrap_or_default();
        let ciphers = hello.cipher_suites().to_vec();
        (sni, alpn, ciphers)
    };

    // Upstream handshake as a task reporting through a oneshot: completes
    // with the negotiated stream, fails, or gets abandoned on shutdown.
    let upstream_tls = {
        let config = upstream_client_config(ctx, &addr, offered_alpn, &offered_ciphers)?;
        let server_name = ServerName::try_from(sni.clone()).map_err(|_| {
            ProxyError::UpstreamTls {
                target: addr.clone(),
                reason: format!("invalid server name {sni}"),
            }
        })?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let connector = TlsConnector::from(Arc::new(config));
        let target = addr.clone();
        tokio::spawn(async move {
            let result = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::UpstreamTls {
                    target,
                    reason: e.to_string(),
                });
            let _ = tx.send(result);
        });

        let mut cancel = ctx.cancel.clone();
        tokio::select! {
            result = rx => result.map_err(|_| ProxyError::UpstreamTls {
                target: addr.clone(),
                reason: "handshake task dropped".to_string(),
            })??,
            _ = cancel.changed() => {
                return Err(ProxyError::UpstreamTls {
                    target: addr,
                    reason: "canceled by shutdown".to_string(),
                });
            }
        }
    };

    let negotiated_alpn = upstream_tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(<[u8]>::to_vec);

    // Only now can the client-side config exist: leaf for the SNI, ALPN
    // pinned to the origin's choice.
    let leaf = ctx.certs.get_leaf(&sni).await?;
    let chain = vec![leaf.cert_der.clone(), ctx.certs.ca_cert_der().clone()];
    let key = PrivateKeyDer::try_from(leaf.key_der.clone())
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
    let mut server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
    if let Some(proto) = &negotiated_alpn {
        server_config.alpn_protocols = vec![proto.clone()];
    }
    server_config.send_tls13_tickets = 0;

    let client_tls = start
        .into_stream(Arc::new(server_config))
        .await
        .map_err(|e| ProxyError::ClientTls(e.to_string()))?;
    session.set_client_tls(sni, negotiated_alpn.clone());

    let upstream = match negotiated_alpn.as_deref() {
        Some(b"h2") => {
            let (sender, conn) = hyper::client::conn::http2::handshake(
                TokioExecutor::new(),
                TokioIo::new(upstream_tls),
            )
            .await
            .map_err(|e| ProxyError::UpstreamHttp {
                target: addr.clone(),
                reason: e.to_string(),
            })?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("upstream h2 connection ended: {e}");
                }
            });
            UpstreamClient::Http2(sender)
        }
        _ => {
            let (sender, conn) =
                hyper::client::conn::http1::Builder::new()
                    .handshake(TokioIo::new(upstream_tls))
                    .await
                    .map_err(|e| ProxyError::UpstreamHttp {
                        target: addr.clone(),
                        reason: e.to_string(),
                    })?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("upstream connection ended: {e}");
                }
            });
            UpstreamClient::http1(sender)
        }
    };
    session
        .set_server(ServerConn {
            id: Uuid::new_v4(),
            addr,
            alpn: negotiated_alpn,
            client: upstream,
        })
        .await;

    serve_decrypted(ctx, session, client_tls).await;
    Ok(())
}

/// Serve the decrypted client stream with an embedded HTTP server (h1 or
/// h2, whichever the client-side ALPN produced) that re-enters the shared
/// proxying routine for every request.
async fn serve_decrypted(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    client_tls: tokio_rustls::server::TlsStream<TokioIo<Upgraded>>,
) {
    let service = service_fn({
        let ctx = ctx.clone();
        let session = session.clone();
        move |req: Request<Incoming>| {
            let ctx = ctx.clone();
            let session = session.clone();
            async move {
                let resp = match http_handler::forward(&ctx, &session, req, "https").await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!("decrypted request failed: {e}");
                        error_response(&e)
                    }
                };
                Ok::<_, std::convert::Infallible>(resp)
            }
        }
    });

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    if let Err(e) = server
        .serve_connection(TokioIo::new(client_tls), service)
        .await
    {
        debug!("decrypted tunnel ended: {e}");
    }
}

fn upstream_client_config(
    ctx: &ProxyCtx,
    target: &str,
    offered_alpn: Vec<Vec<u8>>,
    offered_ciphers: &[CipherSuite],
) -> Result<ClientConfig, ProxyError> {
    let builder = ClientConfig::builder_with_provider(mirrored_provider(offered_ciphers))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::UpstreamTls {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

    let mut config = if ctx.config.trust_any_upstream {
        // Load-bearing for interception: self-signed and test origins are a
        // first-class target. Off means verification against system roots.
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAnyServerCert::new()))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_roots())
            .with_no_client_auth()
    };
    config.alpn_protocols = offered_alpn;
    Ok(config)
}

/// The default provider restricted to the cipher suites the client offered,
/// so the origin cannot negotiate something the client would not have
/// accepted. Falls back to the full provider when nothing intersects.
fn mirrored_provider(offered: &[CipherSuite]) -> Arc<CryptoProvider> {
    let base = provider();
    if offered.is_empty() {
        return base;
    }
    let mirrored: Vec<_> = base
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| offered.contains(&suite.suite()))
        .collect();
    if mirrored.is_empty() {
        return base;
    }
    let mut restricted = (*base).clone();
    restricted.cipher_suites = mirrored;
    Arc::new(restricted)
}

pub(crate) fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    roots
}

/// Accepts any upstream certificate. See `Config::trust_any_upstream`.
#[derive(Debug)]
struct TrustAnyServerCert {
    schemes: Vec<rustls::SignatureScheme>,
}

impl TrustAnyServerCert {
    fn new() -> Self {
        Self {
            schemes: provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for TrustAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirrored_provider_filters_to_offer() {
        let base = provider();
        let offered = vec![base.cipher_suites[0].suite()];
        let mirrored = mirrored_provider(&offered);
        assert_eq!(mirrored.cipher_suites.len(), 1);
        assert_eq!(mirrored.cipher_suites[0].suite(), offered[0]);
    }

    #[test]
    fn test_mirrored_provider_falls_back_on_empty_intersection() {
        // A grease-style value no provider implements.
        let offered = vec![CipherSuite::from(0x0a0a)];
        let mirrored = mirrored_provider(&offered);
        assert_eq!(
            mirrored.cipher_suites.len(),
            provider().cipher_suites.len()
        );
    }

    #[test]
    fn test_mirrored_provider_empty_offer_uses_defaults() {
        let mirrored = mirrored_provider(&[]);
        assert_eq!(
            mirrored.cipher_suites.len(),
            provider().cipher_suites.len()
        );
    }

    #[test]
    fn test_trust_any_verifier_advertises_schemes() {
        assert!(!TrustAnyServerCert::new().supported_verify_schemes().is_empty());
    }
}
