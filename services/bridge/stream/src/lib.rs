//! Connection state machine and stream flow control over raw socket handles.
//!
//! A [`Socket`] turns the callback-driven primitive from `bridge-handle` into
//! a byte stream with ordered, exactly-once write completions and pull-based
//! reads that suspend the handle when the consumer falls behind.
//!
//! ## Features
//!
//! - **Lifecycle**: connect, half-close in either direction, destroy
//! - **Write path**: FIFO queue, one write outstanding on the handle, drain
//!   notification once buffered bytes fall back under the high-water mark
//! - **Read path**: buffered chunks, handle suspend/resume around the
//!   high-water mark, end-of-stream once the buffer is consumed
//!
//! ## Example
//!
//! ```rust
//! use bridge_handle::{mem::{MemTransport, StaticResolver}, Completion, SocketContext};
//! use bridge_stream::{ConnectOptions, Socket, SocketConfig, SocketEvent};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemTransport::new());
//! let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
//! let (mut socket, mut events) = Socket::new(ctx, SocketConfig::default());
//!
//! socket.connect(ConnectOptions::new("203.0.113.5", 443)).unwrap();
//! socket.write(&b"hello"[..], Completion::noop()).unwrap();
//!
//! // The primitive reports the connection open; queued bytes flush.
//! let remote = transport.last().unwrap();
//! remote.open();
//! socket.poll_events();
//!
//! assert_eq!(events.try_recv().unwrap(), SocketEvent::Connect);
//! assert_eq!(remote.sent_bytes(), b"hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod readable;
pub mod socket;
pub mod writable;

pub use readable::{ReadOutcome, ReadableSide};
pub use socket::{
    ConnectOptions, ConnectionState, ReadyState, Socket, SocketConfig, SocketEvent,
    DEFAULT_HIGH_WATER_MARK,
};
pub use writable::{FlushOutcome, WritableSide};
