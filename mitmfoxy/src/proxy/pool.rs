use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_MAX_CONNS: usize = 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct IdleConn {
    stream: TcpStream,
    idle_since: Instant,
}

/// Pool of idle upstream TCP connections keyed by `host:port`.
///
/// Checkout is LIFO and every candidate is liveness-probed first; a conn
/// that dies between the probe and its next use surfaces as an upstream
/// I/O error on the caller, which is the accepted trade-off for a probe
/// without real traffic. All operations share one lock; nothing blocks
/// under it.
pub struct ServerConnPool {
    conns: Mutex<HashMap<String, Vec<IdleConn>>>,
    max_conns: usize,
    idle_timeout: Duration,
}

impl Default for ServerConnPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNS, DEFAULT_IDLE_TIMEOUT)
    }
}

impl ServerConnPool {
    pub fn new(max_conns: usize, idle_timeout: Duration) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            max_conns,
            idle_timeout,
        }
    }

    /// Pop the most recently parked connection for `addr`, discarding any
    /// that have expired or gone dead. `None` when nothing usable is left;
    /// the key is removed once its list drains.
    pub fn get(&self, addr: &str) -> Option<TcpStream> {
        let mut conns = self.conns.lock().expect("pool lock poisoned");
        let pool = conns.get_mut(addr)?;

        let mut found = None;
        while let Some(conn) = pool.pop() {
            if conn.idle_since.elapsed() > self.idle_timeout {
                continue;
            }
            if is_live(&conn.stream) {
                found = Some(conn.stream);
                break;
            }
            debug!("dropping dead pooled connection to {addr}");
        }

        if pool.is_empty() {
            conns.remove(addr);
        }
        found
    }

    /// Park a connection for reuse. Over the per-key cap the offered
    /// connection is closed instead of stored.
    pub fn put(&self, addr: &str, stream: TcpStream) {
        let mut conns = self.conns.lock().expect("pool lock poisoned");
        let pool = conns.entry(addr.to_string()).or_default();
        if pool.len() >= self.max_conns {
            return;
        }
        pool.push(IdleConn {
            stream,
            idle_since: Instant::now(),
        });
    }

    /// Close and drop every pooled connection.
    pub fn close_all(&self) {
        self.conns.lock().expect("pool lock poisoned").clear();
    }

    #[cfg(test)]
    fn idle_count(&self, addr: &str) -> usize {
        self.conns
            .lock()
            .unwrap()
            .get(addr)
            .map_or(0, Vec::len)
    }
}

/// A parked connection should have nothing to read. `WouldBlock` means the
/// peer is quiet and the socket is open; EOF, stray bytes, or any error
/// mean it is unusable.
fn is_live(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Ok(_) | Err(_) => false,
    }
}
