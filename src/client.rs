//! Client driver: connect, bind, hand the trusted session to the user.
//!
//! The driver owns the connection lifecycle up to a successful bind:
//! 1. TCP connect, socket options
//! 2. Build a session with a bind-phase response handler and start it
//! 3. Send `bind_req`, wait for exactly one `bind_resp`
//! 4. On success: pause receiving, hand the session to the bind handler,
//!    resume receiving
//!
//! A failed bind (status fail, close before bind, connect error) closes
//! the attempt, reports through the error handler, and - with
//! auto-reconnect on - retries after a delay. After a successful bind the
//! driver steps aside; reconnecting a session that closed later is the
//! caller's decision (call [`Client::start`] again, as the protocol facade
//! does).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::{FramelinkError, Result};
use crate::protocol::{BindRequest, BindResponse, CommandStatus, Request, Response};
use crate::session::Session;
use crate::transport::configure_stream;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default keep-alive idle time handed to the transport layer.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Invoked with the peer's `bind_resp` and the bound session.
pub type BindHandler = Box<dyn FnMut(BindResponse, Session) + Send>;

/// Invoked with a human-readable description of a failed attempt.
pub type ErrorHandler = Box<dyn FnMut(String) + Send>;

enum BindEvent {
    Response(BindResponse, CommandStatus),
    Closed(Option<String>),
}

struct ClientShared {
    addr: SocketAddr,
    bind_request: BindRequest,
    inactivity_timeout: Duration,
    reconnect_delay: Duration,
    session_config: SessionConfig,
    auto_reconnect: bool,
    stopped: AtomicBool,
    connecting: AtomicBool,
    binding: Mutex<Option<Session>>,
    bind_handler: Mutex<BindHandler>,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl ClientShared {
    fn report(&self, message: String) {
        tracing::warn!(addr = %self.addr, "{message}");
        if let Some(handler) = self.error_handler.lock().as_mut() {
            handler(message);
        }
    }
}

/// TCP client driver with a bind handshake and optional auto-reconnect.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Launch a connect attempt unless one is already in flight.
    pub fn start(&self) {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.shared.connecting.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(connect_loop(self.shared.clone()));
    }

    /// Stop connecting and close any in-flight binding session.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(session) = self.shared.binding.lock().take() {
            session.close(Some("Client stopped".into()));
        }
    }

    /// The endpoint this client connects to.
    pub fn endpoint(&self) -> SocketAddr {
        self.shared.addr
    }
}

async fn connect_loop(shared: Arc<ClientShared>) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        match attempt_bind(&shared).await {
            Ok(()) => break,
            Err(message) => {
                shared.report(message);
                if !shared.auto_reconnect || shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(shared.reconnect_delay).await;
            }
        }
    }
    shared.connecting.store(false, Ordering::Release);
}

/// One connect + bind attempt. `Ok` means the session was handed over.
async fn attempt_bind(shared: &Arc<ClientShared>) -> std::result::Result<(), String> {
    let stream = TcpStream::connect(shared.addr)
        .await
        .map_err(|err| format!("Connect failed: {err}"))?;
    configure_stream(&stream, shared.inactivity_timeout);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let close_tx = event_tx.clone();

    // The handler pauses receive the moment `bind_resp` arrives, before any
    // frame behind it dispatches, so nothing is lost while the session is
    // handed over to the user.
    let session_slot: Arc<Mutex<Option<Session>>> = Arc::new(Mutex::new(None));
    let response_slot = session_slot.clone();

    let session = Session::builder()
        .with_config(shared.session_config.clone())
        .with_peer_addr(shared.addr)
        .with_response_handler(move |response, _sequence, status| {
            if let Response::Bind(bind_resp) = response {
                if let Some(session) = response_slot.lock().as_ref() {
                    session.pause_receiving();
                }
                let _ = event_tx.send(BindEvent::Response(bind_resp, status));
            }
        })
        .with_close_handler(move |reason| {
            let _ = close_tx.send(BindEvent::Closed(reason));
        })
        .build(stream)
        .map_err(|err| format!("Session build failed: {err}"))?;

    *session_slot.lock() = Some(session.clone());
    *shared.binding.lock() = Some(session.clone());
    session.start();
    session
        .send_request(Request::Bind(shared.bind_request.clone()))
        .map_err(|err| format!("Bind send failed: {err}"))?;

    match event_rx.recv().await {
        Some(BindEvent::Response(bind_resp, CommandStatus::Ok)) => {
            // Receive is already paused (by the bind-phase handler); the
            // resume command queues behind the handler replacements the
            // user issues here.
            *shared.binding.lock() = None;
            (*shared.bind_handler.lock())(bind_resp, session.clone());
            session.resume_receiving();
            Ok(())
        }
        Some(BindEvent::Response(_, CommandStatus::Fail)) => {
            session.close(Some("Bind rejected by peer".into()));
            *shared.binding.lock() = None;
            Err("Bind rejected by peer".into())
        }
        Some(BindEvent::Closed(reason)) => {
            *shared.binding.lock() = None;
            Err(format!(
                "Session closed during binding: {}",
                reason.unwrap_or_else(|| "none".into())
            ))
        }
        None => {
            *shared.binding.lock() = None;
            Err("Binding session vanished".into())
        }
    }
}

/// Fluent builder for [`Client`].
pub struct ClientBuilder {
    addr: Option<SocketAddr>,
    system_id: String,
    inactivity_timeout: Duration,
    reconnect_delay: Duration,
    session_config: SessionConfig,
    auto_reconnect: bool,
    bind_handler: Option<BindHandler>,
    error_handler: Option<ErrorHandler>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            addr: None,
            system_id: String::new(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            session_config: SessionConfig::default(),
            auto_reconnect: true,
            bind_handler: None,
            error_handler: None,
        }
    }
}

impl ClientBuilder {
    /// Server endpoint to connect to. Required.
    pub fn with_address(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Identity sent in `bind_req`.
    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = system_id.into();
        self
    }

    /// Keep-alive idle time for the transport layer.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Pause between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Session configuration for every connection this client makes.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Whether failed attempts retry automatically.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Handler receiving the bound session. Required.
    pub fn with_bind_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(BindResponse, Session) + Send + 'static,
    {
        self.bind_handler = Some(Box::new(handler));
        self
    }

    /// Handler receiving failed-attempt descriptions.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        self.error_handler = Some(Box::new(handler));
        self
    }

    /// Validate and build the client. Does not connect; call
    /// [`Client::start`].
    pub fn build(self) -> Result<Client> {
        let addr = self.addr.ok_or_else(|| {
            FramelinkError::InvalidConfig("Client requires an address".into())
        })?;
        let bind_handler = self.bind_handler.ok_or_else(|| {
            FramelinkError::InvalidConfig("Client requires a bind handler".into())
        })?;
        self.session_config.validate()?;

        Ok(Client {
            shared: Arc::new(ClientShared {
                addr,
                bind_request: BindRequest {
                    system_id: self.system_id,
                },
                inactivity_timeout: self.inactivity_timeout,
                reconnect_delay: self.reconnect_delay,
                session_config: self.session_config,
                auto_reconnect: self.auto_reconnect,
                stopped: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                binding: Mutex::new(None),
                bind_handler: Mutex::new(bind_handler),
                error_handler: Mutex::new(self.error_handler),
            }),
        })
    }
}
