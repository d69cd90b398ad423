//! TLS session wrapper for sockbridge stream sockets.
//!
//! A [`TlsSocket`] drives a sans-IO [`TlsEngine`] over a plain
//! [`bridge_stream::Socket`]: ciphertext produced by the engine is written
//! through the plain socket's ordered write queue, inbound records are pulled
//! from it and decrypted onto the TLS socket's own readable side.
//!
//! ## Features
//!
//! - **Engine seam**: [`TlsContext`] / [`TlsEngine`], with certificate trust
//!   decided by a pluggable [`CertificatePolicy`] that rejects by default
//! - **Scripted engine**: [`testing::ScriptedEngine`] for tests and demos
//! - **rustls engine**: `rustls_engine::RustlsContext` (feature `tls`)
//!
//! ## Example
//!
//! ```rust
//! use bridge_handle::{mem::{MemTransport, StaticResolver}, SocketContext};
//! use bridge_stream::{ConnectOptions, SocketConfig};
//! use bridge_tls::{testing::ScriptedContext, TlsOptions, TlsSocket, TrustAll};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemTransport::new());
//! let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
//! let tls_ctx = ScriptedContext::new(Arc::new(TrustAll), &b"server-cert"[..]);
//!
//! let (mut tls, _events) = TlsSocket::connect(
//!     ctx,
//!     SocketConfig::default(),
//!     &tls_ctx,
//!     ConnectOptions::new("203.0.113.5", 443),
//!     TlsOptions::client("svc.test"),
//! )
//! .unwrap();
//!
//! // Once the plain socket connects the client hello goes out.
//! transport.last().unwrap().open();
//! tls.pump();
//! assert!(!transport.last().unwrap().sent().is_empty());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
#[cfg(feature = "tls")]
pub mod rustls_engine;
pub mod socket;
pub mod testing;

pub use engine::{
    CertificatePolicy, EngineEvent, PinnedCertificates, RejectUnconfigured, Role, SessionParams,
    TlsContext, TlsEngine, TrustAll, Verdict,
};
pub use error::TlsError;
pub use socket::{TlsEvent, TlsOptions, TlsSocket, TlsState};
