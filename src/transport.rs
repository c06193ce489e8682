//! TCP socket plumbing shared by the client and server drivers.
//!
//! Keep-alive and no-delay are advisory: a socket that refuses an option
//! still carries sessions, so failures are logged as warnings and never
//! propagate. The listener side is different: `SO_REUSEADDR` must be set
//! before `bind`, so the listener is assembled through `socket2` rather
//! than the plain tokio constructor.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Keep-alive probe interval once the idle time has passed.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Number of unanswered probes before the connection is declared dead.
const KEEPALIVE_RETRIES: u32 = 5;

/// Accept backlog handed to `listen`.
const LISTEN_BACKLOG: i32 = 1024;

/// Bind a TCP listener with `SO_REUSEADDR` set, so a restarted server can
/// rebind its address while old connections linger in TIME_WAIT.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Apply `TCP_NODELAY` and `SO_KEEPALIVE` to a connected stream.
///
/// The keep-alive idle time derives from the session's inactivity timeout;
/// interval and retry count are fixed.
pub fn configure_stream(stream: &TcpStream, inactivity_timeout: Duration) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::warn!(%err, "failed to enable TCP_NODELAY");
    }

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(inactivity_timeout)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        tracing::warn!(%err, "failed to enable SO_KEEPALIVE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configure_connected_stream() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        configure_stream(&client, Duration::from_secs(30));
        configure_stream(&server, Duration::from_secs(30));

        assert!(client.nodelay().unwrap());
        assert!(server.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_listener_has_reuse_address() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let sock = SockRef::from(&listener);
        assert!(sock.reuse_address().unwrap());
    }

    #[tokio::test]
    async fn test_rebind_after_drop() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        // Leave a connection behind, then rebind the same port.
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = first.accept().await.unwrap();
        drop(server);
        drop(client);
        drop(first);

        let second = bind_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }
}
