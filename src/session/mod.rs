//! Session engine: framed bidirectional messaging over a byte stream.
//!
//! Each session is one task owning the read half, the receive buffer, the
//! pending send buffer and the protocol state machine; a dedicated writer
//! task (see [`writer`]) owns the write half. The cloneable [`Session`]
//! handle routes every mutating operation through the owning task, so all
//! user-observed events for one session are delivered in the order that
//! task sequenced them.
//!
//! States run `Open -> Unbinding -> Closed`, with a direct `Open -> Closed`
//! on fatal error or peer close. Only `Open` permits user sends. The
//! close path runs exactly once, flushes what it can, and drops every
//! installed handler so the last outer handle frees the session.

mod backpressure;
mod manager;
mod metrics;
mod writer;

pub use backpressure::BackpressureController;
pub use manager::{AggregateMetrics, SessionId, SessionManager};
pub use metrics::{MetricsSnapshot, SessionMetrics};

use std::mem;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{SessionConfig, MAX_SMALL_BODY_SIZE};
use crate::error::{FramelinkError, Result};
use crate::protocol::{
    append_command, append_frame, CommandId, CommandStatus, FlatBuffer, FrameHeader, Request,
    Response, HEADER_SIZE,
};
use writer::{spawn_writer, WriteDone, WriterChannels};

/// Socket read granularity.
const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Bound or binding; user sends permitted.
    Open = 0,
    /// `unbind_req` sent or received; only teardown frames flow.
    Unbinding = 1,
    /// Socket closed; nothing flows. Never regresses.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Unbinding,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Receiving,
    PendingPause,
    Paused,
}

/// Handler invoked with each user-visible request.
pub type RequestHandler = Box<dyn FnMut(Request, u32) + Send>;
/// Handler invoked with each user-visible response.
pub type ResponseHandler = Box<dyn FnMut(Response, u32, CommandStatus) + Send>;
/// Handler invoked exactly once when the session closes.
pub type CloseHandler = Box<dyn FnOnce(Option<String>) + Send>;
/// Handler fired when a paused send buffer drains below the low watermark.
pub type SendBufAvailableHandler = Box<dyn FnMut() + Send>;
/// Handler reporting a body that failed to decode: message, command id,
/// raw body bytes.
pub type DecodeErrorHandler = Box<dyn FnMut(&str, CommandId, Bytes) + Send>;

#[derive(Default)]
struct Handlers {
    request: Option<RequestHandler>,
    response: Option<ResponseHandler>,
    /// Close handlers chain: drivers install registry cleanup, facades
    /// append their own teardown. All fire once, in installation order.
    close: Vec<CloseHandler>,
    send_buf_available: Option<SendBufAvailableHandler>,
    decode_error: Option<DecodeErrorHandler>,
}

/// State shared between the handle and the owning task.
struct SessionShared {
    state: AtomicU8,
    sequence: AtomicU32,
    /// Fast-path pause request, consumed between frames so a pause issued
    /// from inside a handler takes effect before the next dispatch.
    pause_pending: AtomicBool,
    metrics: SessionMetrics,
    peer_addr: Option<SocketAddr>,
    config: SessionConfig,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Allocate the next sequence number: strictly increasing, wrapping
    /// 0xFFFFFFFF -> 1 and never producing the reserved 0.
    fn next_sequence(&self) -> u32 {
        let mut current = self.sequence.load(Ordering::Relaxed);
        loop {
            let next = if current == u32::MAX { 1 } else { current + 1 };
            match self.sequence.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

enum Command {
    SendRequest {
        request: Request,
        sequence: u32,
    },
    SendResponse {
        response: Response,
        sequence: u32,
        status: CommandStatus,
    },
    Unbind,
    PauseReceiving,
    ResumeReceiving,
    Close {
        reason: Option<String>,
    },
    SetHandler(HandlerUpdate),
}

/// Handler replacement, applied by the owning task in command order.
///
/// Drivers hand a bound session to the user with receive paused; handlers
/// installed before the resume command are guaranteed to see every
/// subsequent frame.
enum HandlerUpdate {
    Request(RequestHandler),
    Response(ResponseHandler),
    AddClose(CloseHandler),
    SendBufAvailable(SendBufAvailableHandler),
    DecodeError(DecodeErrorHandler),
}

/// Cloneable handle to a running session.
///
/// Handles hold no socket resources: dropping the last one tears the
/// session down cleanly. Handlers installed at build time must capture a
/// handle only when they need one; the close path drops all handlers, so
/// no reference cycle survives a close.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Build a session over a connected byte stream.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Start receiving. Sessions are built paused so drivers can install
    /// themselves before the first frame arrives.
    pub fn start(&self) {
        let _ = self.commands.send(Command::ResumeReceiving);
    }

    /// Send a request, returning its assigned sequence number.
    pub fn send_request(&self, request: Request) -> Result<u32> {
        self.check_sendable()?;
        let sequence = self.shared.next_sequence();
        self.commands
            .send(Command::SendRequest { request, sequence })
            .map_err(|_| FramelinkError::SessionClosed)?;
        Ok(sequence)
    }

    /// Send a response echoing the request's sequence number.
    pub fn send_response(
        &self,
        response: Response,
        sequence: u32,
        status: CommandStatus,
    ) -> Result<()> {
        self.check_sendable()?;
        self.commands
            .send(Command::SendResponse {
                response,
                sequence,
                status,
            })
            .map_err(|_| FramelinkError::SessionClosed)
    }

    /// Begin the graceful teardown handshake.
    pub fn unbind(&self) {
        let _ = self.commands.send(Command::Unbind);
    }

    /// Close the session. `Some(reason)` is delivered to the close handler;
    /// pass `None` for a locally-initiated clean close.
    pub fn close(&self, reason: Option<String>) {
        let _ = self.commands.send(Command::Close { reason });
    }

    /// Stop pulling bytes off the socket. Issued from inside a handler,
    /// the pause takes effect before the next buffered frame dispatches.
    pub fn pause_receiving(&self) {
        self.shared.pause_pending.store(true, Ordering::Release);
        let _ = self.commands.send(Command::PauseReceiving);
    }

    /// Resume pulling bytes off the socket.
    pub fn resume_receiving(&self) {
        let _ = self.commands.send(Command::ResumeReceiving);
    }

    /// Replace the request handler.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: FnMut(Request, u32) + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(HandlerUpdate::Request(Box::new(handler))));
    }

    /// Replace the response handler.
    pub fn set_response_handler<F>(&self, handler: F)
    where
        F: FnMut(Response, u32, CommandStatus) + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(HandlerUpdate::Response(Box::new(
                handler,
            ))));
    }

    /// Append a close handler to the chain.
    pub fn add_close_handler<F>(&self, handler: F)
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(HandlerUpdate::AddClose(Box::new(
                handler,
            ))));
    }

    /// Replace the send-buffer-available handler.
    pub fn set_send_buf_available_handler<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(HandlerUpdate::SendBufAvailable(
                Box::new(handler),
            )));
    }

    /// Replace the decode-error handler.
    pub fn set_decode_error_handler<F>(&self, handler: F)
    where
        F: FnMut(&str, CommandId, Bytes) + Send + 'static,
    {
        let _ = self
            .commands
            .send(Command::SetHandler(HandlerUpdate::DecodeError(Box::new(
                handler,
            ))));
    }

    /// Whether the session is open for user sends.
    pub fn is_open(&self) -> bool {
        self.shared.state() == SessionState::Open
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The session's metrics block.
    pub fn metrics(&self) -> &SessionMetrics {
        &self.shared.metrics
    }

    /// Remote endpoint, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// The configuration snapshot this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    fn check_sendable(&self) -> Result<()> {
        match self.shared.state() {
            SessionState::Open => Ok(()),
            SessionState::Unbinding => Err(FramelinkError::Protocol(
                "Send on unbinding session".into(),
            )),
            SessionState::Closed => Err(FramelinkError::SessionClosed),
        }
    }
}

/// Fluent builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    peer_addr: Option<SocketAddr>,
    handlers: Handlers,
}

impl SessionBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given configuration snapshot.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Record the remote endpoint for [`Session::peer_addr`].
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Install the request handler.
    pub fn with_request_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Request, u32) + Send + 'static,
    {
        self.handlers.request = Some(Box::new(handler));
        self
    }

    /// Install the response handler.
    pub fn with_response_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Response, u32, CommandStatus) + Send + 'static,
    {
        self.handlers.response = Some(Box::new(handler));
        self
    }

    /// Append a close handler; the whole chain fires exactly once.
    pub fn with_close_handler<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        self.handlers.close.push(Box::new(handler));
        self
    }

    /// Install the edge-triggered send-buffer-available handler.
    pub fn with_send_buf_available_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.handlers.send_buf_available = Some(Box::new(handler));
        self
    }

    /// Install the decode-error handler.
    pub fn with_decode_error_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str, CommandId, Bytes) + Send + 'static,
    {
        self.handlers.decode_error = Some(Box::new(handler));
        self
    }

    /// Validate the configuration, spawn the session and writer tasks, and
    /// return the handle. The session starts with receiving paused.
    pub fn build<S>(self, stream: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;

        let (reader, write_half) = tokio::io::split(stream);
        let shared = Arc::new(SessionShared {
            state: AtomicU8::new(SessionState::Open as u8),
            sequence: AtomicU32::new(0),
            pause_pending: AtomicBool::new(false),
            metrics: SessionMetrics::new(),
            peer_addr: self.peer_addr,
            config: self.config,
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let config = &shared.config;

        let actor = SessionActor {
            shared: shared.clone(),
            reader,
            commands: command_rx,
            commands_done: false,
            writer: spawn_writer(write_half),
            write_in_flight: false,
            pending: Vec::with_capacity(config.send_buf_capacity),
            spare: None,
            receive_buf: FlatBuffer::new(config.receive_buf_size),
            read_scratch: vec![0u8; READ_CHUNK],
            body_scratch: Vec::new(),
            receiving: ReceiveState::Paused,
            backpressure: BackpressureController::new(
                config.backpressure_low_watermark,
                config.backpressure_high_watermark,
            ),
            unbind_deadline: None,
            closing: None,
            force_close: false,
            close_deadline: None,
            handlers: self.handlers,
        };
        tokio::spawn(actor.run());

        Ok(Session {
            shared,
            commands: command_tx,
        })
    }
}

struct SessionActor<R> {
    shared: Arc<SessionShared>,
    reader: R,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_done: bool,
    writer: WriterChannels,
    write_in_flight: bool,
    pending: Vec<u8>,
    spare: Option<Vec<u8>>,
    receive_buf: FlatBuffer,
    read_scratch: Vec<u8>,
    body_scratch: Vec<u8>,
    receiving: ReceiveState,
    backpressure: BackpressureController,
    unbind_deadline: Option<Instant>,
    /// `Some` once a close began; the inner value is the close reason.
    closing: Option<Option<String>>,
    force_close: bool,
    close_deadline: Option<Instant>,
    handlers: Handlers,
}

impl<R> SessionActor<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let far_future = || Instant::now() + Duration::from_secs(86_400);

        loop {
            if self.closing.is_some()
                && (self.force_close || (!self.write_in_flight && self.pending.is_empty()))
            {
                self.finalize();
                return;
            }

            let can_read =
                self.receiving == ReceiveState::Receiving && self.closing.is_none();
            let max_read = self.receive_buf.available().min(READ_CHUNK);
            if can_read && max_read == 0 {
                self.begin_close(
                    Some("Receive buffer full with incomplete frame".into()),
                    false,
                );
                continue;
            }

            let unbind_at = self.unbind_deadline.unwrap_or_else(far_future);
            let close_at = self.close_deadline.unwrap_or_else(far_future);

            tokio::select! {
                biased;
                done = self.writer.done.recv(), if self.write_in_flight => {
                    self.on_write_done(done);
                }
                _ = tokio::time::sleep_until(close_at), if self.close_deadline.is_some() => {
                    // Flush deadline passed; stop waiting on the peer.
                    self.force_close = true;
                }
                _ = tokio::time::sleep_until(unbind_at), if self.unbind_deadline.is_some() => {
                    self.on_unbind_timeout();
                }
                maybe_cmd = self.commands.recv(), if !self.commands_done && self.closing.is_none() => {
                    match maybe_cmd {
                        Some(command) => self.on_command(command),
                        None => {
                            self.commands_done = true;
                            self.begin_close(None, true);
                        }
                    }
                }
                result = self.reader.read(&mut self.read_scratch[..max_read]), if can_read => {
                    self.on_read(result);
                }
            }

            if self.receiving == ReceiveState::PendingPause {
                self.receiving = ReceiveState::Paused;
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendRequest { request, sequence } => {
                self.append_pdu(request.command(), CommandStatus::Ok, sequence, |buf| {
                    request.encode_body(buf)
                });
            }
            Command::SendResponse {
                response,
                sequence,
                status,
            } => {
                self.append_pdu(response.command(), status, sequence, |buf| {
                    response.encode_body(buf)
                });
            }
            Command::Unbind => self.on_unbind(),
            Command::PauseReceiving => {
                // The hint may already have been consumed mid-drain.
                if self.shared.pause_pending.swap(false, Ordering::AcqRel)
                    && self.receiving == ReceiveState::Receiving
                {
                    self.receiving = ReceiveState::PendingPause;
                }
            }
            Command::ResumeReceiving => self.resume_receiving(),
            Command::Close { reason } => self.begin_close(reason, true),
            Command::SetHandler(update) => match update {
                HandlerUpdate::Request(handler) => self.handlers.request = Some(handler),
                HandlerUpdate::Response(handler) => self.handlers.response = Some(handler),
                HandlerUpdate::AddClose(handler) => self.handlers.close.push(handler),
                HandlerUpdate::SendBufAvailable(handler) => {
                    self.handlers.send_buf_available = Some(handler)
                }
                HandlerUpdate::DecodeError(handler) => {
                    self.handlers.decode_error = Some(handler)
                }
            },
        }
    }

    fn resume_receiving(&mut self) {
        if self.closing.is_some() {
            return;
        }
        let previous = mem::replace(&mut self.receiving, ReceiveState::Receiving);
        if previous == ReceiveState::Paused {
            self.drain_frames();
        }
    }

    fn on_unbind(&mut self) {
        if self.shared.state() != SessionState::Open || self.closing.is_some() {
            return;
        }
        self.shared.set_state(SessionState::Unbinding);
        let sequence = self.shared.next_sequence();
        append_command(
            &mut self.pending,
            CommandId::UnbindReq,
            CommandStatus::Ok,
            sequence,
        );
        self.shared.metrics.incr_messages_sent();
        self.after_append();
        self.unbind_deadline =
            Some(Instant::now() + self.shared.config.unbind_timeout);
    }

    fn on_unbind_timeout(&mut self) {
        self.unbind_deadline = None;
        if self.shared.state() == SessionState::Unbinding {
            self.begin_close(Some("Unbind timeout - no response received".into()), false);
        }
    }

    fn append_pdu<F>(&mut self, command: CommandId, status: CommandStatus, sequence: u32, body: F)
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        if self.closing.is_some() {
            return;
        }
        match append_frame(&mut self.pending, command, status, sequence, body) {
            Ok(()) => {
                self.shared.metrics.incr_messages_sent();
                self.after_append();
            }
            Err(err) => {
                self.shared.metrics.incr_errors();
                tracing::error!(command = ?command, %err, "dropping unencodable frame");
            }
        }
    }

    fn after_append(&mut self) {
        if self.backpressure.should_pause(self.pending.len())
            && self.receiving == ReceiveState::Receiving
        {
            self.receiving = ReceiveState::PendingPause;
        }
        self.flush();
    }

    fn flush(&mut self) {
        if self.write_in_flight || self.pending.is_empty() {
            return;
        }
        let replacement = self
            .spare
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.shared.config.send_buf_capacity));
        let writing = mem::replace(&mut self.pending, replacement);

        match self.writer.tx.try_send(writing) {
            Ok(()) => self.write_in_flight = true,
            Err(err) => {
                self.pending = err.into_inner();
                self.shared.metrics.incr_errors();
                self.begin_close(Some("Writer task unavailable".into()), false);
            }
        }
    }

    fn on_write_done(&mut self, done: Option<WriteDone>) {
        self.write_in_flight = false;
        match done {
            Some(Ok((written, buf))) => {
                self.shared.metrics.add_bytes_sent(written as u64);
                self.spare = Some(buf);
                self.flush();
                if self.backpressure.should_resume(self.pending.len()) {
                    if self.closing.is_none() {
                        self.resume_receiving();
                    }
                    self.fire_send_buf_available();
                }
            }
            Some(Err(err)) => {
                self.shared.metrics.incr_errors();
                self.begin_close(Some(format!("Write error: {err}")), false);
            }
            None => {
                self.shared.metrics.incr_errors();
                self.begin_close(Some("Writer task exited".into()), false);
            }
        }
    }

    fn on_read(&mut self, result: std::io::Result<usize>) {
        match result {
            Ok(0) => self.begin_close(None, true),
            Ok(n) => {
                match self.receive_buf.prepare(n) {
                    Ok(slice) => slice.copy_from_slice(&self.read_scratch[..n]),
                    Err(err) => {
                        self.shared.metrics.incr_errors();
                        self.begin_close(Some(err.to_string()), false);
                        return;
                    }
                }
                self.receive_buf.commit(n);
                self.shared
                    .metrics
                    .record_compactions(self.receive_buf.compactions());
                self.shared.metrics.add_bytes_received(n as u64);
                self.drain_frames();
            }
            Err(err) => {
                self.shared.metrics.incr_errors();
                self.begin_close(Some(format!("Read error: {err}")), false);
            }
        }
    }

    /// Decode and dispatch every complete frame currently buffered.
    fn drain_frames(&mut self) {
        loop {
            if self.shared.pause_pending.swap(false, Ordering::AcqRel)
                && self.receiving == ReceiveState::Receiving
            {
                self.receiving = ReceiveState::PendingPause;
            }
            if self.receiving != ReceiveState::Receiving || self.closing.is_some() {
                break;
            }
            if self.receive_buf.len() < HEADER_SIZE {
                break;
            }

            let header = match FrameHeader::decode(self.receive_buf.data()) {
                Ok(header) => header,
                Err(err) => {
                    self.fatal(err.to_string());
                    break;
                }
            };
            if let Err(err) = header.validate_length(self.shared.config.max_command_length) {
                self.fatal(err.to_string());
                break;
            }
            let length = header.length as usize;
            if length > self.receive_buf.capacity() {
                self.fatal(format!(
                    "Frame of {length} bytes exceeds receive buffer capacity"
                ));
                break;
            }
            if self.receive_buf.len() < length {
                break;
            }

            self.shared.metrics.incr_messages_received();

            // The body is copied out before `consume` so nothing ever
            // borrows the receive buffer across a dispatch.
            let body_len = length - HEADER_SIZE;
            if body_len <= self.shared.config.small_body_size {
                let mut stack_buf = [0u8; MAX_SMALL_BODY_SIZE];
                stack_buf[..body_len]
                    .copy_from_slice(&self.receive_buf.data()[HEADER_SIZE..length]);
                self.receive_buf.consume(length);
                self.dispatch(header, &stack_buf[..body_len]);
            } else {
                let mut body = mem::take(&mut self.body_scratch);
                body.clear();
                body.extend_from_slice(&self.receive_buf.data()[HEADER_SIZE..length]);
                self.receive_buf.consume(length);
                self.dispatch(header, &body);
                self.body_scratch = body;
            }
        }

        if self.receiving == ReceiveState::PendingPause {
            self.receiving = ReceiveState::Paused;
        }
    }

    fn dispatch(&mut self, header: FrameHeader, body: &[u8]) {
        if header.command.is_response() {
            self.on_response_frame(header, body);
        } else {
            self.on_request_frame(header, body);
        }
    }

    fn on_response_frame(&mut self, header: FrameHeader, body: &[u8]) {
        match header.command {
            CommandId::EnquireLinkResp => {}
            CommandId::UnbindResp => {
                self.unbind_deadline = None;
                self.begin_close(None, true);
            }
            CommandId::BindResp | CommandId::StreamResp => {
                match Response::decode(header.command, body) {
                    Ok(response) => {
                        self.deliver_response(response, header.sequence, header.status)
                    }
                    Err(err) => self.on_decode_failure(err, header.command, body),
                }
            }
            _ => self.fatal(format!(
                "Request command {:?} carried the response bit",
                header.command
            )),
        }
    }

    fn on_request_frame(&mut self, header: FrameHeader, body: &[u8]) {
        match header.command {
            CommandId::EnquireLinkReq => {
                append_command(
                    &mut self.pending,
                    CommandId::EnquireLinkResp,
                    CommandStatus::Ok,
                    header.sequence,
                );
                self.shared.metrics.incr_messages_sent();
                self.after_append();
            }
            CommandId::UnbindReq => {
                if self.shared.state() == SessionState::Open {
                    self.shared.set_state(SessionState::Unbinding);
                }
                append_command(
                    &mut self.pending,
                    CommandId::UnbindResp,
                    CommandStatus::Ok,
                    header.sequence,
                );
                self.shared.metrics.incr_messages_sent();
                self.after_append();
                self.begin_close(None, true);
            }
            CommandId::BindReq | CommandId::StreamReq => {
                match Request::decode(header.command, body) {
                    Ok(request) => self.deliver_request(request, header.sequence),
                    Err(err) => self.on_decode_failure(err, header.command, body),
                }
            }
            _ => self.fatal(format!(
                "Response command {:?} without the response bit",
                header.command
            )),
        }
    }

    fn deliver_request(&mut self, request: Request, sequence: u32) {
        if self.shared.state() != SessionState::Open {
            return;
        }
        if let Some(handler) = self.handlers.request.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler(request, sequence))).is_err() {
                self.shared.metrics.incr_errors();
                self.begin_close(Some("Panic in request handler".into()), false);
            }
        }
    }

    fn deliver_response(&mut self, response: Response, sequence: u32, status: CommandStatus) {
        if self.shared.state() != SessionState::Open {
            return;
        }
        if let Some(handler) = self.handlers.response.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler(response, sequence, status))).is_err() {
                self.shared.metrics.incr_errors();
                self.begin_close(Some("Panic in response handler".into()), false);
            }
        }
    }

    fn on_decode_failure(&mut self, err: FramelinkError, command: CommandId, body: &[u8]) {
        self.shared.metrics.incr_errors();
        let message = err.to_string();
        if let Some(handler) = self.handlers.decode_error.as_mut() {
            let raw = Bytes::copy_from_slice(body);
            if catch_unwind(AssertUnwindSafe(|| handler(&message, command, raw))).is_err() {
                tracing::error!("decode-error handler panicked");
            }
        }
        self.begin_close(Some(message), false);
    }

    fn fatal(&mut self, reason: String) {
        self.shared.metrics.incr_errors();
        self.begin_close(Some(reason), false);
    }

    fn fire_send_buf_available(&mut self) {
        if let Some(handler) = self.handlers.send_buf_available.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                tracing::error!("send-buf-available handler panicked");
            }
        }
    }

    /// Begin the single-shot close path. With `flush` set the actor keeps
    /// draining in-flight writes (bounded by the unbind timeout) before the
    /// socket goes down; without it the socket goes down now.
    fn begin_close(&mut self, reason: Option<String>, flush: bool) {
        if self.closing.is_some() {
            return;
        }
        self.receiving = ReceiveState::Paused;
        self.unbind_deadline = None;
        self.force_close = !flush;
        self.close_deadline = Some(Instant::now() + self.shared.config.unbind_timeout);
        self.closing = Some(reason);
    }

    fn finalize(mut self) {
        self.writer.task.abort();
        self.shared.set_state(SessionState::Closed);
        self.shared.metrics.is_closed.store(true, Ordering::Release);

        let reason = self.closing.take().flatten();
        let close_chain = mem::take(&mut self.handlers.close);
        // Dropping the remaining handlers here breaks any reference cycle
        // back into user state holding this session's handle.
        self.handlers = Handlers::default();

        for handler in close_chain {
            let handler_reason = reason.clone();
            if catch_unwind(AssertUnwindSafe(move || handler(handler_reason))).is_err() {
                tracing::error!("close handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BindResponse, StreamRequest, StreamResponse};
    use std::sync::mpsc as std_mpsc;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    async fn read_frame(peer: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_SIZE];
        peer.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::decode(&header_buf).unwrap();
        let mut body = vec![0u8; header.body_len()];
        peer.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    async fn write_frame(
        peer: &mut DuplexStream,
        command: CommandId,
        status: CommandStatus,
        sequence: u32,
        body: &[u8],
    ) {
        let mut frame = Vec::new();
        append_frame(&mut frame, command, status, sequence, |out| {
            out.extend_from_slice(body);
            Ok(())
        })
        .unwrap();
        peer.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_assigns_increasing_sequences() {
        let (local, mut peer) = duplex(64 * 1024);
        let session = Session::builder().build(local).unwrap();
        session.start();

        let first = session
            .send_request(Request::Stream(StreamRequest {
                message_body: "one".into(),
            }))
            .unwrap();
        let second = session
            .send_request(Request::Stream(StreamRequest {
                message_body: "two".into(),
            }))
            .unwrap();
        assert!(second > first);

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::StreamReq);
        assert_eq!(header.sequence, first);
        assert_eq!(body, b"one");

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.sequence, second);
        assert_eq!(body, b"two");

        assert_eq!(session.metrics().snapshot().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_sequence_counter_skips_zero_on_wrap() {
        let shared = SessionShared {
            state: AtomicU8::new(SessionState::Open as u8),
            sequence: AtomicU32::new(u32::MAX - 1),
            pause_pending: AtomicBool::new(false),
            metrics: SessionMetrics::new(),
            peer_addr: None,
            config: SessionConfig::default(),
        };

        assert_eq!(shared.next_sequence(), u32::MAX);
        assert_eq!(shared.next_sequence(), 1);
        assert_eq!(shared.next_sequence(), 2);
    }

    #[tokio::test]
    async fn test_request_handler_sees_stream_request() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_request_handler(move |request, sequence| {
                let _ = tx.send((request, sequence));
            })
            .build(local)
            .unwrap();
        session.start();

        write_frame(&mut peer, CommandId::StreamReq, CommandStatus::Ok, 5, b"ping").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (request, sequence) = rx.try_recv().unwrap();
        assert_eq!(sequence, 5);
        assert_eq!(
            request,
            Request::Stream(StreamRequest {
                message_body: "ping".into()
            })
        );
        assert_eq!(session.metrics().snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn test_response_handler_sees_status() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_response_handler(move |response, sequence, status| {
                let _ = tx.send((response, sequence, status));
            })
            .build(local)
            .unwrap();
        session.start();

        write_frame(
            &mut peer,
            CommandId::StreamResp,
            CommandStatus::Fail,
            9,
            b"denied",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (response, sequence, status) = rx.try_recv().unwrap();
        assert_eq!(sequence, 9);
        assert_eq!(status, CommandStatus::Fail);
        assert_eq!(
            response,
            Response::Stream(StreamResponse {
                message_body: "denied".into()
            })
        );
    }

    #[tokio::test]
    async fn test_enquire_link_answered_with_same_sequence() {
        let (local, mut peer) = duplex(64 * 1024);
        let session = Session::builder().build(local).unwrap();
        session.start();

        write_frame(&mut peer, CommandId::EnquireLinkReq, CommandStatus::Ok, 77, b"").await;

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::EnquireLinkResp);
        assert_eq!(header.sequence, 77);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_unbind_req_answered_and_closed_cleanly() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        write_frame(&mut peer, CommandId::UnbindReq, CommandStatus::Ok, 3, b"").await;

        let (header, _) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::UnbindResp);
        assert_eq!(header.sequence, 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv().unwrap(), None);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.metrics().snapshot().is_closed);
    }

    #[tokio::test]
    async fn test_unbind_handshake_initiator_side() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();
        session.unbind();

        let (header, _) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::UnbindReq);

        // Sends are refused while unbinding.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            session.send_request(Request::Stream(StreamRequest::default())),
            Err(FramelinkError::Protocol(_))
        ));

        write_frame(
            &mut peer,
            CommandId::UnbindResp,
            CommandStatus::Ok,
            header.sequence,
            b"",
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv().unwrap(), None);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unbind_timeout_closes_with_cause() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let config = SessionConfig {
            unbind_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let session = Session::builder()
            .with_config(config)
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();
        session.unbind();

        let (header, _) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::UnbindReq);
        // Never answer.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reason = rx.try_recv().unwrap();
        assert!(reason.unwrap().contains("Unbind timeout"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let config = SessionConfig {
            max_command_length: 100,
            ..Default::default()
        };
        let session = Session::builder()
            .with_config(config)
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        let header = FrameHeader::new(101, CommandId::StreamReq, CommandStatus::Ok, 1);
        peer.write_all(&header.encode()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reason = rx.try_recv().unwrap().unwrap();
        assert!(reason.contains("101"));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_frame_at_max_length_accepted() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let config = SessionConfig {
            max_command_length: (HEADER_SIZE + 5) as u32,
            ..Default::default()
        };
        let session = Session::builder()
            .with_config(config)
            .with_request_handler(move |request, _| {
                let _ = tx.send(request);
            })
            .build(local)
            .unwrap();
        session.start();

        write_frame(&mut peer, CommandId::StreamReq, CommandStatus::Ok, 1, b"exact").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_ok());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_malformed_body_reports_then_closes() {
        let (local, mut peer) = duplex(64 * 1024);
        let (err_tx, err_rx) = std_mpsc::channel();
        let (close_tx, close_rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_decode_error_handler(move |message, command, raw| {
                let _ = err_tx.send((message.to_string(), command, raw));
            })
            .with_close_handler(move |reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        // bind_req body with no NUL terminator.
        write_frame(&mut peer, CommandId::BindReq, CommandStatus::Ok, 2, b"broken").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (message, command, raw) = err_rx.try_recv().unwrap();
        assert!(message.contains("NUL"));
        assert_eq!(command, CommandId::BindReq);
        assert_eq!(&raw[..], b"broken");

        let reason = close_rx.try_recv().unwrap();
        assert!(reason.unwrap().contains("NUL"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_eof_is_clean_close() {
        let (local, peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rx.try_recv().unwrap(), None);
        assert!(matches!(
            session.send_request(Request::Stream(StreamRequest::default())),
            Err(FramelinkError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_fragmented_frame_reassembled() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_request_handler(move |request, _| {
                let _ = tx.send(request);
            })
            .build(local)
            .unwrap();
        session.start();

        let mut frame = Vec::new();
        append_frame(
            &mut frame,
            CommandId::StreamReq,
            CommandStatus::Ok,
            1,
            |out| {
                out.extend_from_slice(b"fragmented payload");
                Ok(())
            },
        )
        .unwrap();

        for chunk in frame.chunks(3) {
            peer.write_all(chunk).await.unwrap();
            peer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            Request::Stream(StreamRequest {
                message_body: "fragmented payload".into()
            })
        );
    }

    #[tokio::test]
    async fn test_large_body_beyond_small_threshold() {
        let (local, mut peer) = duplex(256 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_request_handler(move |request, _| {
                let _ = tx.send(request);
            })
            .build(local)
            .unwrap();
        session.start();

        let payload = "x".repeat(4096);
        write_frame(
            &mut peer,
            CommandId::StreamReq,
            CommandStatus::Ok,
            1,
            payload.as_bytes(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        match rx.try_recv().unwrap() {
            Request::Stream(StreamRequest { message_body }) => {
                assert_eq!(message_body.len(), 4096)
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_response_echoes_sequence() {
        let (local, mut peer) = duplex(64 * 1024);
        let session = Session::builder().build(local).unwrap();
        session.start();

        session
            .send_response(
                Response::Bind(BindResponse {
                    system_id: "srv".into(),
                }),
                41,
                CommandStatus::Ok,
            )
            .unwrap();

        let (header, body) = read_frame(&mut peer).await;
        assert_eq!(header.command, CommandId::BindResp);
        assert_eq!(header.sequence, 41);
        assert_eq!(body, b"srv\0");
    }

    #[tokio::test]
    async fn test_panicking_request_handler_closes_session() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_request_handler(|_, _| panic!("handler bug"))
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        write_frame(&mut peer, CommandId::StreamReq, CommandStatus::Ok, 1, b"boom").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reason = rx.try_recv().unwrap().unwrap();
        assert!(reason.contains("Panic"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_handler_fires_exactly_once() {
        let (local, _peer) = duplex(64 * 1024);
        let (tx, rx) = std_mpsc::channel();
        let session = Session::builder()
            .with_close_handler(move |reason| {
                let _ = tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        session.close(Some("first".into()));
        session.close(Some("second".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rx.try_recv().unwrap(), Some("first".to_string()));
        assert!(rx.try_recv().is_err());
    }
}
