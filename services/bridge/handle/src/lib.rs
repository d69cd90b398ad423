//! Raw handle adapter, completions and error vocabulary for sockbridge.
//!
//! The socket primitive underneath the bridge is callback driven and knows
//! nothing about backpressure. This crate defines the seam between it and the
//! state machines built on top:
//!
//! - **Handle surface**: [`RawHandle`], opened through a [`HandleFactory`]
//! - **Event adapter**: [`HandleAdapter`] turns callbacks into [`HandleEvent`]s
//! - **Completions**: [`Completion`] fires exactly once, even when dropped
//! - **Errors**: [`SocketError`] shared by every layer
//! - **In-memory primitive**: [`mem::MemTransport`] for tests and demos
//!
//! ## Example
//!
//! ```rust
//! use bridge_handle::{mem::{MemTransport, StaticResolver}, SocketContext};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! let transport = Arc::new(MemTransport::new());
//! let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
//!
//! let (tx, _rx) = mpsc::unbounded_channel();
//! let adapter = ctx.adapter(tx);
//! adapter.on_data(b"hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod completion;
pub mod error;
pub mod event;
pub mod handle;
pub mod mem;

pub use completion::Completion;
pub use error::{Result, SocketError};
pub use event::{HandleAdapter, HandleEvent, HandleEventKind, HandleEventSink, HandleId};
pub use handle::{
    AddressFamily, DatagramBind, HandleFactory, RawHandle, Resolver, SocketContext, SocketOption,
    StreamTarget, SystemResolver,
};
