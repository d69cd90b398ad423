//! Event vocabulary for raw handle callbacks.
//!
//! The primitive reports everything through callbacks. [`HandleAdapter`] is
//! the object those callbacks are bound to: each callback copies what it was
//! given into owned buffers and forwards a [`HandleEvent`] to the socket that
//! owns the handle.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::trace;

/// Identity of one handle instance.
///
/// Sockets tag the handle they currently own and drop events carrying any
/// other id, which covers late callbacks from a handle replaced during rebind
/// or closed during destroy.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// What happened on the handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleEventKind {
    /// Connection established, or datagram endpoint bound
    Open,
    /// Stream bytes arrived
    Data(Bytes),
    /// Datagram arrived
    Message {
        /// Payload
        data: Bytes,
        /// Sender
        from: SocketAddr,
    },
    /// Send buffer drained below the primitive's threshold
    Drain,
    /// Primitive reported an error
    Error(String),
    /// Handle closed
    Close,
    /// Peer finished sending (EOF)
    HalfClose,
}

/// Event tagged with the handle it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleEvent {
    /// Originating handle
    pub handle: HandleId,
    /// Event payload
    pub kind: HandleEventKind,
}

/// Channel end a socket reads its raw events from
pub type HandleEventSink = mpsc::UnboundedSender<HandleEvent>;

/// Callback target bound to one handle.
#[derive(Clone, Debug)]
pub struct HandleAdapter {
    id: HandleId,
    sink: HandleEventSink,
}

impl HandleAdapter {
    /// Bind an adapter for handle `id` forwarding into `sink`.
    pub fn new(id: HandleId, sink: HandleEventSink) -> Self {
        Self { id, sink }
    }

    /// Handle this adapter reports for.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Open callback.
    pub fn on_open(&self) {
        self.emit(HandleEventKind::Open);
    }

    /// Data callback. The primitive's buffer is copied.
    pub fn on_data(&self, data: &[u8]) {
        self.emit(HandleEventKind::Data(Bytes::copy_from_slice(data)));
    }

    /// Datagram callback. The primitive's buffer is copied.
    pub fn on_message(&self, data: &[u8], from: SocketAddr) {
        self.emit(HandleEventKind::Message {
            data: Bytes::copy_from_slice(data),
            from,
        });
    }

    /// Drain callback.
    pub fn on_drain(&self) {
        self.emit(HandleEventKind::Drain);
    }

    /// Error callback.
    pub fn on_error(&self, message: impl Into<String>) {
        self.emit(HandleEventKind::Error(message.into()));
    }

    /// Close callback.
    pub fn on_close(&self) {
        self.emit(HandleEventKind::Close);
    }

    /// Half-close (remote EOF) callback.
    pub fn on_half_close(&self) {
        self.emit(HandleEventKind::HalfClose);
    }

    fn emit(&self, kind: HandleEventKind) {
        let event = HandleEvent {
            handle: self.id,
            kind,
        };
        if self.sink.send(event).is_err() {
            trace!("handle {} event dropped, socket is gone", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_tags_and_copies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = HandleAdapter::new(HandleId(4), tx);

        let mut buf = vec![1u8, 2, 3];
        adapter.on_data(&buf);
        buf[0] = 9;
        adapter.on_half_close();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.handle, HandleId(4));
        assert_eq!(ev.kind, HandleEventKind::Data(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(rx.try_recv().unwrap().kind, HandleEventKind::HalfClose);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_adapter_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = HandleAdapter::new(HandleId(1), tx);
        drop(rx);
        adapter.on_error("boom");
        adapter.on_close();
    }
}
