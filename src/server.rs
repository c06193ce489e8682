//! Server driver: accept, bind, register with the session manager.
//!
//! Accepted sockets sit in a "binding" slot until their first frame. A
//! `bind_req` goes to the user's bind handler, which accepts or rejects:
//! on accept the session answers `bind_resp` ok and joins the manager's
//! active set; on reject it answers `bind_resp` fail and closes once the
//! response has flushed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::client::DEFAULT_INACTIVITY_TIMEOUT;
use crate::config::SessionConfig;
use crate::error::{FramelinkError, Result};
use crate::protocol::{BindRequest, BindResponse, CommandStatus, Request, Response};
use crate::session::{AggregateMetrics, Session, SessionManager};
use crate::transport::{bind_listener, configure_stream};

/// Decides whether a `bind_req` is accepted. Runs on the session's task.
pub type ServerBindHandler = Box<dyn FnMut(&BindRequest, &Session) -> bool + Send>;

struct ServerShared {
    system_id: String,
    inactivity_timeout: Duration,
    session_config: SessionConfig,
    manager: SessionManager,
    bind_handler: Mutex<ServerBindHandler>,
    binding_count: AtomicUsize,
}

/// TCP server driver.
pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The registry of bound sessions.
    pub fn manager(&self) -> &SessionManager {
        &self.shared.manager
    }

    /// Sessions accepted but not yet bound.
    pub fn binding_session_count(&self) -> usize {
        self.shared.binding_count.load(Ordering::Acquire)
    }

    /// Sessions past the bind handshake.
    pub fn active_session_count(&self) -> usize {
        self.shared.manager.active_count()
    }

    /// Aggregate metrics over the active set.
    pub fn metrics(&self) -> AggregateMetrics {
        self.shared.manager.metrics()
    }

    /// Stop accepting and unbind every active session.
    pub fn stop(&self) {
        self.accept_task.abort();
        self.shared.manager.close_all();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = accept_one(stream, peer, &shared) {
                    tracing::warn!(%peer, %err, "failed to start binding session");
                }
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn accept_one(stream: TcpStream, peer: SocketAddr, shared: &Arc<ServerShared>) -> Result<()> {
    configure_stream(&stream, shared.inactivity_timeout);

    let id = shared.manager.allocate_id();
    shared.binding_count.fetch_add(1, Ordering::AcqRel);

    // Decrements the binding count exactly once, whether the session binds
    // or dies first.
    let binding_settled = Arc::new(AtomicBool::new(false));

    // Filled right after build; the session is paused until `start`, so the
    // first frame cannot race the slot.
    let session_slot: Arc<Mutex<Option<Session>>> = Arc::new(Mutex::new(None));

    let request_shared = shared.clone();
    let request_slot = session_slot.clone();
    let request_settled = binding_settled.clone();
    let mut bound = false;

    let close_shared = shared.clone();
    let close_settled = binding_settled.clone();

    let session = Session::builder()
        .with_config(shared.session_config.clone())
        .with_peer_addr(peer)
        .with_request_handler(move |request, sequence| {
            let bind_req = match request {
                Request::Bind(bind_req) if !bound => bind_req,
                other => {
                    tracing::warn!(?other, "dropping request outside bind phase");
                    return;
                }
            };

            let session = match request_slot.lock().clone() {
                Some(session) => session,
                None => return,
            };

            let accept = (*request_shared.bind_handler.lock())(&bind_req, &session);
            let response = Response::Bind(BindResponse {
                system_id: request_shared.system_id.clone(),
            });

            if accept {
                bound = true;
                let _ = session.send_response(response, sequence, CommandStatus::Ok);
                request_shared.manager.insert(id, session.clone());
                if !request_settled.swap(true, Ordering::AcqRel) {
                    request_shared.binding_count.fetch_sub(1, Ordering::AcqRel);
                }
            } else {
                let _ = session.send_response(response, sequence, CommandStatus::Fail);
                session.close(Some("Bind rejected".into()));
            }
        })
        .with_close_handler(move |reason| {
            close_shared.manager.remove(id);
            if !close_settled.swap(true, Ordering::AcqRel) {
                close_shared.binding_count.fetch_sub(1, Ordering::AcqRel);
                if let Some(reason) = reason {
                    tracing::warn!(%reason, "session closed during binding");
                }
            }
        })
        .build(stream)?;

    *session_slot.lock() = Some(session.clone());
    session.start();
    Ok(())
}

/// Fluent builder for [`Server`].
pub struct ServerBuilder {
    system_id: String,
    inactivity_timeout: Duration,
    session_config: SessionConfig,
    bind_handler: Option<ServerBindHandler>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            system_id: String::new(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            session_config: SessionConfig::default(),
            bind_handler: None,
        }
    }
}

impl ServerBuilder {
    /// Identity echoed in every `bind_resp`.
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = system_id.into();
        self
    }

    /// Keep-alive idle time for accepted sockets.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Session configuration for every accepted connection.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Bind-decision handler. Required.
    pub fn with_bind_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&BindRequest, &Session) -> bool + Send + 'static,
    {
        self.bind_handler = Some(Box::new(handler));
        self
    }

    /// Bind the listener and start accepting.
    pub async fn bind(self, addr: SocketAddr) -> Result<Server> {
        let bind_handler = self.bind_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("Server requires a bind handler".into())
        })?;
        self.session_config.validate()?;

        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            system_id: self.system_id,
            inactivity_timeout: self.inactivity_timeout,
            session_config: self.session_config,
            manager: SessionManager::new(),
            bind_handler: Mutex::new(bind_handler),
            binding_count: AtomicUsize::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Server {
            shared,
            local_addr,
            accept_task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use tokio::sync::mpsc;

    async fn echo_server() -> Server {
        Server::builder()
            .with_system_id("srv")
            .with_bind_handler(|_, _| true)
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_accept_registers_session() {
        let server = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let client = Client::builder()
            .with_address(server.local_addr())
            .with_system_id("c1")
            .with_bind_handler(move |bind_resp, session| {
                let _ = tx.send((bind_resp.system_id, session));
            })
            .build()
            .unwrap();
        client.start();

        let (server_id, session) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(server_id, "srv");
        assert!(session.is_open());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.active_session_count(), 1);
        assert_eq!(server.binding_session_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_reject_closes_session() {
        let server = Server::builder()
            .with_system_id("srv")
            .with_bind_handler(|bind_req, _| bind_req.system_id == "allowed")
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let client = Client::builder()
            .with_address(server.local_addr())
            .with_system_id("denied")
            .with_auto_reconnect(false)
            .with_bind_handler(|_, _| panic!("bind must not succeed"))
            .with_error_handler(move |message| {
                let _ = err_tx.send(message);
            })
            .build()
            .unwrap();
        client.start();

        let message = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("Bind rejected"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.active_session_count(), 0);
        assert_eq!(server.binding_session_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_unbinds_active_sessions() {
        let server = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        let client = Client::builder()
            .with_address(server.local_addr())
            .with_system_id("c1")
            .with_auto_reconnect(false)
            .with_bind_handler(move |_, session| {
                let close_tx = close_tx.clone();
                session.add_close_handler(move |reason| {
                    let _ = close_tx.send(reason);
                });
                let _ = tx.send(session);
            })
            .build()
            .unwrap();
        client.start();

        let _session = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop();
        let reason = tokio::time::timeout(Duration::from_secs(5), close_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, None);
    }
}
