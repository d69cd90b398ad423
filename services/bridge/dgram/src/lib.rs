//! Datagram socket bind lifecycle and pre-bind send queue over raw handles.
//!
//! A [`DatagramSocket`] starts with an unbound handle. Binding, explicitly or
//! implicitly on the first send, replaces that handle with one bound to the
//! resolved endpoint. Sends issued before the socket is listening are queued
//! and released in order exactly once.
//!
//! ## Example
//!
//! ```rust
//! use bridge_dgram::{BindState, DatagramEvent, DatagramKind, DatagramSocket};
//! use bridge_handle::{mem::{MemTransport, StaticResolver}, Completion, SocketContext};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemTransport::with_auto_open());
//! let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
//! let (mut socket, mut events) = DatagramSocket::new(DatagramKind::Udp4, ctx).unwrap();
//!
//! socket
//!     .send(&b"ping"[..], 0, 4, 9999, Some("198.51.100.1"), Completion::noop())
//!     .unwrap();
//! socket.poll_events();
//!
//! assert_eq!(socket.state(), BindState::Bound);
//! assert_eq!(events.try_recv().unwrap(), DatagramEvent::Listening);
//! assert_eq!(transport.last().unwrap().sent_to().len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod socket;

pub use socket::{BindState, DatagramEvent, DatagramKind, DatagramSocket, RemoteInfo};
