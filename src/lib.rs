//! Callback-driven websocket client (RFC 6455).
//!
//! Configure a [`ClientBuilder`] with the endpoint and callbacks, call
//! [`ClientBuilder::connect`] and keep the returned [`WsClient`]. All
//! network activity happens on a background worker thread owned by the
//! library: the opening handshake, frame encoding and decoding, message
//! reassembly, ping/pong and the close exchange. Sends only queue frames
//! and never block on I/O; inbound messages and state changes arrive
//! through the callbacks, on the worker thread.
//!
//! ```no_run
//! use ws_conn::ClientBuilder;
//!
//! let client = ClientBuilder::new()
//!     .uri("ws://127.0.0.1:9001/chat")?
//!     .on_connected(|conn| {
//!         let _ = conn.send_text("hello");
//!     })
//!     .on_received_text(|_, text| println!("[RECV] {text}"))
//!     .on_disconnected(|err| println!("gone: {err:?}"))
//!     .connect()?;
//! # Ok::<(), ws_conn::WsError>(())
//! ```
//!
//! Dropping the handle releases the connection without blocking; the
//! worker sends a close frame, waits briefly for the peer's reply and
//! fires `on_disconnected` before it exits. Do not block inside
//! callbacks: they run on the same thread that drives the socket.

#![warn(missing_docs)]

/// builder, connection handle and worker state machine
pub mod client;
/// frame decoding and message reassembly
pub mod codec;
/// websocket error definitions
pub mod errors;
/// websocket transport unit
pub mod frame;
/// handshake request/response and close codes
pub mod protocol;
/// transport adapter over plain tcp or tls
pub mod stream;

pub use client::{ClientBuilder, WsClient, WsSender};
pub use errors::{ErrorKind, ProtocolError, WsError};
pub use frame::OpCode;
