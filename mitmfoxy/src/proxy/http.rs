use std::sync::Arc;

use http::header::HOST;
use http::{HeaderMap, HeaderValue, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::flow::{Flow, FlowRequest, FlowResponse};
use crate::proxy::session::{ServerConn, Session, UpstreamClient};
use crate::proxy::{dialer, tee, ProxyBody, ProxyCtx};

/// Relay an absolute-form plaintext request.
///
/// Dials a fresh (or pooled) upstream socket, drives it with a single-shot
/// hyper client, and parks the socket back in the pool once the exchange
/// completes cleanly.
pub async fn handle(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let addr = dialer::target_address(req.uri())?;
    let stream = session.dialer.dial(req.uri()).await?;

    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::UpstreamHttp {
            target: addr.clone(),
            reason: e.to_string(),
        })?;

    // Drive the connection to completion off to the side and recover the
    // socket for the pool. Leftover buffered bytes mean the upstream spoke
    // out of turn; such a socket is not reusable.
    {
        let dialer = session.dialer.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            match conn.without_shutdown().await {
                Ok(parts) if parts.read_buf.is_empty() => {
                    dialer.release(&addr, parts.io.into_inner());
                }
                Ok(_) => {}
                Err(e) => debug!("upstream connection to {addr} ended: {e}"),
            }
        });
    }

    session
        .set_server(ServerConn {
            id: Uuid::new_v4(),
            addr,
            alpn: None,
            client: UpstreamClient::http1(sender),
        })
        .await;

    forward(ctx, session, req, "http").await
}

/// The proxying routine shared by the plaintext handler and the decrypting
/// tunnel server: re-issue the request on the session's upstream client,
/// mirror the response verbatim, and emit a flow once both bodies have
/// fully streamed.
///
/// Headers are copied as-is in both directions, hop-by-hop ones included;
/// the conn-level upstream client neither follows redirects nor re-encodes
/// content.
pub async fn forward(
    ctx: &Arc<ProxyCtx>,
    session: &Arc<Session>,
    req: Request<Incoming>,
    scheme: &str,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (upstream, target) = session
        .upstream()
        .await
        .ok_or_else(|| ProxyError::UpstreamHttp {
            target: "unknown".to_string(),
            reason: "no upstream connection for session".to_string(),
        })?;

    let (parts, body) = req.into_parts();
    let url = absolute_url(scheme, &parts.uri, &parts.headers, session)?;
    let capture = ctx.observer.enabled();
    let capture_limit = ctx.config.max_capture_bytes;

    let body = classified_body(body, &target);
    let (out_body, req_capture) = if capture {
        let (body, rx) = tee::capture(body, capture_limit);
        (body, Some(rx))
    } else {
        (body, None)
    };

    let mut out_req = Request::new(out_body);
    *out_req.method_mut() = parts.method.clone();
    *out_req.headers_mut() = parts.headers.clone();
    if upstream.is_http2() {
        // HTTP/2 carries the target in pseudo-headers, built from the URI.
        *out_req.uri_mut() = url
            .parse()
            .map_err(|_| ProxyError::BadRequest(format!("unrepresentable URL {url}")))?;
    } else {
        *out_req.uri_mut() = origin_form(&parts.uri);
        ensure_host(out_req.headers_mut(), &url);
    }

    let resp = upstream.send(out_req, &target).await?;
    let (rparts, rbody) = resp.into_parts();

    let rbody = classified_body(rbody, &target);
    let (out_body, resp_capture) = if capture {
        let (body, rx) = tee::capture(rbody, capture_limit);
        (body, Some(rx))
    } else {
        (rbody, None)
    };

    if let (Some(req_rx), Some(resp_rx)) = (req_capture, resp_capture) {
        let observer = ctx.observer.clone();
        let method = parts.method.clone();
        let req_headers = parts.headers.clone();
        let resp_headers = rparts.headers.clone();
        let (version, status) = (rparts.version, rparts.status);
        let url = url.clone();
        tokio::spawn(async move {
            // Both captures must complete; an aborted stream emits no flow.
            let (req_cap, resp_cap) = tokio::join!(req_rx, resp_rx);
            let (Ok(req_cap), Ok(resp_cap)) = (req_cap, resp_cap) else {
                return;
            };
            observer.publish(Flow::new(
                FlowRequest::new(
                    &method,
                    url,
                    &req_headers,
                    req_cap.bytes.to_vec(),
                    req_cap.truncated,
                ),
                FlowResponse::new(
                    version,
                    status,
                    &resp_headers,
                    resp_cap.bytes.to_vec(),
                    resp_cap.truncated,
                ),
            ));
        });
    }

    let mut out = Response::new(out_body);
    *out.status_mut() = rparts.status;
    *out.headers_mut() = rparts.headers;
    Ok(out)
}

/// Reconstruct the absolute URL of a request: already-absolute URIs pass
/// through; origin-form requests (off the decrypted tunnel) get the scheme
/// plus the best available authority.
fn absolute_url(
    scheme: &str,
    uri: &Uri,
    headers: &HeaderMap,
    session: &Session,
) -> Result<String, ProxyError> {
    if uri.scheme_str().is_some() && uri.host().is_some() {
        return Ok(uri.to_string());
    }

    let authority = uri
        .authority()
        .map(ToString::to_string)
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(ToString::to_string)
        })
        .or_else(|| session.client().server_name)
        .ok_or_else(|| ProxyError::BadRequest("request has no host".to_string()))?;

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Ok(format!("{scheme}://{authority}{path}"))
}

/// Route a streaming body's transport failures through the error taxonomy.
///
/// Errors before the response head are caught by the send path and become a
/// `502`; an error here means headers are already out, so hyper truncates
/// the response and drops the connection.
fn classified_body(body: Incoming, target: &str) -> ProxyBody {
    let target = target.to_string();
    body.map_err(move |e| {
        let err = ProxyError::UpstreamIo(std::io::Error::other(e));
        warn!("mid-stream failure while proxying {target}: {err}");
        err
    })
    .boxed()
}

fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

fn ensure_host(headers: &mut HeaderMap, url: &str) {
    if headers.contains_key(HOST) {
        return;
    }
    if let Some(authority) = url.parse::<Uri>().ok().and_then(|u| u.authority().cloned()) {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, value);
        }
    }
}
