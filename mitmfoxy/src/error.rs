use hyper::StatusCode;

/// Errors surfaced by the proxy engine.
///
/// Variants map onto the HTTP status returned to the client when the
/// response has not started yet: client protocol problems become `400`,
/// upstream failures become `502 Bad Gateway`. Handshake failures on the
/// hijacked tunnel have no response channel left and only close the session.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid CA certificate: {0}")]
    InvalidCa(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("upstream TLS handshake with {target} failed: {reason}")]
    UpstreamTls { target: String, reason: String },

    #[error("client TLS handshake failed: {0}")]
    ClientTls(String),

    #[error("upstream request to {target} failed: {reason}")]
    UpstreamHttp { target: String, reason: String },

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[from] std::io::Error),

    #[error("certificate generation for {server_name} failed: {reason}")]
    CertGen { server_name: String, reason: String },
}

impl ProxyError {
    /// The status reported to the client when headers have not been sent.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) | ProxyError::UnsupportedProtocol(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
