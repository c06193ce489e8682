//! # framelink
//!
//! A network-server toolkit built from two tightly coupled pieces:
//!
//! - **The expirator family**: pluggable deadline-indexed key/value
//!   stores that fire a callback when an entry's deadline passes, in
//!   three interchangeable implementations (min-heap, hierarchical timing
//!   wheel, lock-free MPSC-queued).
//! - **The session engine**: a length-prefixed, bidirectional
//!   request/response framing layer over TCP with a bind/unbind
//!   handshake, watermark backpressure, per-session metrics, and a
//!   request-timeout tracker that *is* an expirator.
//!
//! The [`peer`] facades compose the two: every outgoing request lands in
//! an outstanding-request table keyed by sequence number, and each one is
//! answered or timed out exactly once.
//!
//! ## Example
//!
//! ```ignore
//! use framelink::peer::{PeerClient, PeerServer};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> framelink::Result<()> {
//!     let server = PeerServer::builder()
//!         .with_system_id("echo")
//!         .with_request_handler(|peer, seq, body| {
//!             println!("{peer} #{seq}: {body}");
//!         })
//!         .with_response_handler(|_, _, _| {})
//!         .with_timeout_handler(|_, _, _| {})
//!         .bind("127.0.0.1:7750".parse().unwrap())
//!         .await?;
//!
//!     let client = PeerClient::builder()
//!         .with_address(server.local_addr())
//!         .with_client_id("c1")
//!         .with_request_timeout(Duration::from_millis(500))
//!         .with_request_handler(|_, _, _| {})
//!         .with_response_handler(|peer, seq, body| {
//!             println!("response from {peer} #{seq}: {body}");
//!         })
//!         .with_timeout_handler(|peer, seq, body| {
//!             println!("timeout from {peer} #{seq}: {body}");
//!         })
//!         .build()?;
//!     client.start();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod expirator;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::SessionConfig;
pub use error::{FramelinkError, Result};
pub use expirator::{Expirator, HeapExpirator, LockFreeExpirator, TimingWheelExpirator};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionBuilder, SessionManager, SessionState};
