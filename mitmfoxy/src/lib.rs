//! MITM HTTP/HTTPS intercepting proxy.
//!
//! Clients use it as an ordinary HTTP proxy. Plaintext requests are relayed
//! transparently; CONNECT tunnels are terminated with a leaf certificate
//! forged from a local root CA, re-originated upstream with the client's
//! ALPN offer, and the decrypted exchanges are published as flow records to
//! an optional WebSocket observer.

pub mod cert;
pub mod error;
pub mod flow;
pub mod observer;
pub mod proxy;

pub use error::ProxyError;
pub use flow::Flow;
pub use observer::Observer;
pub use proxy::{Config, Proxy};
