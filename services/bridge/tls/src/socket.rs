//! TLS socket layered over a plain stream socket.
//!
//! [`TlsSocket`] owns the plain [`Socket`] and one engine session. Inbound
//! ciphertext is pulled from the plain socket only while the wrapper's own
//! readable side is below its high-water mark; outbound plaintext is encoded
//! and written through the plain socket's FIFO, so write completions keep
//! their order and backpressure carries through.

use crate::engine::{EngineEvent, Role, SessionParams, TlsContext, TlsEngine};
use crate::error::TlsError;
use bridge_handle::{Completion, Result, SocketContext, SocketError};
use bridge_stream::{
    ConnectOptions, ConnectionState, ReadOutcome, ReadableSide, Socket, SocketConfig, SocketEvent,
    DEFAULT_HIGH_WATER_MARK,
};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const PULL_CHUNK: usize = 16 * 1024;

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsState {
    /// Waiting for the first handshake to finish
    Handshaking,
    /// Application data flows
    Open,
    /// close_notify sent or received, or torn down
    Closed,
}

/// Events delivered to the TLS socket's owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsEvent {
    /// First handshake completed; fires once per socket
    SecureConnect,
    /// Decrypted data went from empty to non-empty
    Readable,
    /// Plain socket write buffer drained
    Drain,
    /// Peer closed and all plaintext has been read
    End,
    /// Error; always followed by `Close`
    Error(SocketError),
    /// Socket destroyed
    Close {
        /// Whether an error was reported first
        had_error: bool,
    },
}

/// Session options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Client or server
    pub role: Role,
    /// Name to verify the peer against; defaults to the connect host
    pub server_name: Option<String>,
    /// Session to resume
    pub resumption: Option<Vec<u8>>,
    /// Plaintext buffered before ciphertext pulls stop
    pub read_high_water_mark: usize,
}

impl TlsOptions {
    /// Client session verifying `server_name`.
    pub fn client(server_name: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            server_name: Some(server_name.into()),
            resumption: None,
            read_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Server session.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            server_name: None,
            resumption: None,
            read_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Resume the session identified by `id`.
    pub fn with_resumption(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.resumption = Some(id.into());
        self
    }

    /// Engine parameters for these options.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            role: self.role,
            server_name: self.server_name.clone(),
        }
    }
}

/// Stream socket speaking TLS over a plain [`Socket`]
pub struct TlsSocket {
    inner: Socket,
    inner_events: mpsc::UnboundedReceiver<SocketEvent>,
    engine: Box<dyn TlsEngine>,
    state: TlsState,
    handshakes: u32,
    secure_emitted: bool,
    authorized: bool,
    authorization_error: Option<SocketError>,
    writable: bool,
    ended: bool,
    readable: ReadableSide,
    parked: Completion,
    handshake_started: bool,
    resumption: Option<Vec<u8>>,
    pending_error: Option<SocketError>,
    inner_closed: bool,
    destroyed: bool,
    error_emitted: bool,
    write_ok: bool,
    events: mpsc::UnboundedSender<TlsEvent>,
}

impl TlsSocket {
    /// Create a plain socket, start connecting it and attach a new session.
    /// The handshake begins once the plain socket connects.
    pub fn connect(
        ctx: SocketContext,
        config: SocketConfig,
        tls: &dyn TlsContext,
        connect: ConnectOptions,
        mut options: TlsOptions,
    ) -> std::result::Result<(Self, mpsc::UnboundedReceiver<TlsEvent>), TlsError> {
        if options.role == Role::Client && options.server_name.is_none() {
            options.server_name = connect.host.clone();
        }
        let engine = tls.create_session(&options.session_params())?;
        let (mut socket, events) = Socket::new(ctx, config);
        socket.connect(connect)?;
        Ok(Self::wrap(socket, events, engine, options))
    }

    /// Wrap an existing plain socket. If it is already open the handshake
    /// starts immediately.
    pub fn wrap(
        socket: Socket,
        socket_events: mpsc::UnboundedReceiver<SocketEvent>,
        engine: Box<dyn TlsEngine>,
        options: TlsOptions,
    ) -> (Self, mpsc::UnboundedReceiver<TlsEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let already_open = matches!(
            socket.state(),
            ConnectionState::Open | ConnectionState::HalfClosedRemote
        );
        let mut tls = Self {
            inner: socket,
            inner_events: socket_events,
            engine,
            state: TlsState::Handshaking,
            handshakes: 0,
            secure_emitted: false,
            authorized: false,
            authorization_error: None,
            writable: false,
            ended: false,
            readable: ReadableSide::new(options.read_high_water_mark),
            parked: Completion::noop(),
            handshake_started: false,
            resumption: options.resumption,
            pending_error: None,
            inner_closed: false,
            destroyed: false,
            error_emitted: false,
            write_ok: true,
            events,
        };
        if already_open {
            tls.start_handshake();
        }
        (tls, events_rx)
    }

    /// Run the plain socket's queued events, and the events they cause,
    /// until nothing is left. Returns how many plain socket events were seen.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = self.inner.poll_events() > 0;
            while let Ok(event) = self.inner_events.try_recv() {
                self.on_socket_event(event);
                handled += 1;
                progressed = true;
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Wait for the next raw event on the plain socket, then pump.
    pub async fn process_next(&mut self) {
        self.inner.process_next().await;
        self.pump();
    }

    fn start_handshake(&mut self) {
        if self.handshake_started || self.destroyed {
            return;
        }
        self.handshake_started = true;
        debug!(
            "Starting TLS handshake on {:?} (resuming: {})",
            self.inner.handle_id(),
            self.resumption.is_some()
        );
        let events = self.engine.handshake(self.resumption.as_deref());
        self.apply(events, Completion::noop());
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        if self.destroyed {
            trace!("Dropping plain socket event {:?} after destroy", event);
            return;
        }
        match event {
            SocketEvent::Connect => self.start_handshake(),
            SocketEvent::Readable => self.pull_ciphertext(),
            SocketEvent::Drain => self.emit(TlsEvent::Drain),
            SocketEvent::End => {
                debug!("Plain socket ended in state {:?}", self.state);
                self.readable.push_eof();
                self.try_emit_end();
            }
            SocketEvent::Error(err) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(err);
                }
            }
            SocketEvent::Close { .. } => self.on_socket_close(),
        }
    }

    fn on_socket_close(&mut self) {
        if let Some(err) = self.pending_error.take() {
            self.destroy_internal(Some(err));
        } else if self.error_emitted {
            self.destroy_internal(None);
        } else if self.state == TlsState::Handshaking {
            self.destroy_internal(Some(SocketError::Handshake(
                "connection closed during handshake".to_string(),
            )));
        } else {
            self.inner_closed = true;
            self.readable.push_eof();
            if self.readable.end_emitted() {
                self.destroy_internal(None);
            } else {
                self.try_emit_end();
            }
        }
    }

    fn pull_ciphertext(&mut self) {
        while !self.destroyed && !self.readable.is_saturated() {
            match self.inner.read(PULL_CHUNK) {
                ReadOutcome::Data(data) => {
                    trace!("Feeding {} bytes of ciphertext", data.len());
                    let events = self.engine.process_incoming(&data);
                    self.apply(events, Completion::noop());
                }
                ReadOutcome::WouldBlock | ReadOutcome::Eof => break,
            }
        }
    }

    fn apply(&mut self, events: Vec<EngineEvent>, mut completion: Completion) {
        let last_record = events
            .iter()
            .rposition(|e| matches!(e, EngineEvent::Ciphertext(_)));
        for (index, event) in events.into_iter().enumerate() {
            if self.destroyed {
                break;
            }
            match event {
                EngineEvent::Ciphertext(record) => {
                    let done = if Some(index) == last_record {
                        let done = std::mem::take(&mut completion);
                        if self.state == TlsState::Open {
                            std::mem::take(&mut self.parked).chain(done)
                        } else {
                            done
                        }
                    } else {
                        Completion::noop()
                    };
                    self.write_record(record, done);
                }
                EngineEvent::Plaintext(data) => self.on_plaintext(data),
                EngineEvent::HandshakeComplete => self.on_handshake_complete(),
                EngineEvent::Closed => self.on_engine_closed(),
                EngineEvent::Error(message) => self.on_engine_error(message),
            }
        }
        if !completion.is_noop() {
            trace!("No record produced, parking write completion");
            self.parked = std::mem::take(&mut self.parked).chain(completion);
        }
    }

    fn write_record(&mut self, record: Bytes, done: Completion) {
        match self.inner.write(record, done) {
            Ok(below_mark) => self.write_ok &= below_mark,
            Err(e) => {
                debug!("Plain socket refused TLS record: {}", e);
                self.write_ok = false;
            }
        }
    }

    fn on_plaintext(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self.readable.is_ended() {
            trace!("Dropping {} bytes of plaintext after end", data.len());
            return;
        }
        let was_empty = self.readable.is_empty();
        self.readable.push(data);
        if was_empty {
            self.emit(TlsEvent::Readable);
        }
    }

    fn on_handshake_complete(&mut self) {
        self.handshakes += 1;
        if self.secure_emitted {
            debug!("Renegotiation complete ({} handshakes)", self.handshakes);
            return;
        }
        self.secure_emitted = true;
        self.state = TlsState::Open;
        self.writable = !self.ended;
        self.authorized = true;
        debug!("TLS session established on {:?}", self.inner.handle_id());
        self.emit(TlsEvent::SecureConnect);
    }

    fn on_engine_closed(&mut self) {
        debug!("TLS session closed on {:?}", self.inner.handle_id());
        self.state = TlsState::Closed;
        self.writable = false;
        self.readable.push_eof();
        self.try_emit_end();
        self.inner.destroy_soon();
    }

    fn on_engine_error(&mut self, message: String) {
        let err = if self.state == TlsState::Handshaking {
            SocketError::Handshake(message)
        } else {
            SocketError::Protocol(message)
        };
        warn!("TLS engine error: {}", err);
        self.authorized = false;
        self.authorization_error = Some(err.clone());
        self.writable = false;
        self.emit_error(err);
        self.inner.destroy_soon();
    }

    fn try_emit_end(&mut self) {
        if self.destroyed || !self.readable.take_end() {
            return;
        }
        self.emit(TlsEvent::End);
        if self.inner_closed {
            self.destroy_internal(None);
        }
    }

    /// Encrypt and queue `data`. Writes issued during the handshake are held
    /// by the engine and complete with the record that finally carries them.
    /// Returns `Ok(false)` when the caller should wait for `Drain`.
    pub fn write(&mut self, data: impl Into<Bytes>, completion: Completion) -> Result<bool> {
        let err = if self.destroyed {
            Some(SocketError::Closed)
        } else if let Some(err) = &self.authorization_error {
            Some(err.clone())
        } else if self.ended || self.state == TlsState::Closed {
            Some(SocketError::Protocol("write after end".to_string()))
        } else {
            None
        };
        if let Some(err) = err {
            completion.complete(Err(err.clone()));
            return Err(err);
        }

        let data = data.into();
        self.write_ok = true;
        let events = self.engine.encode_outgoing(&data);
        self.apply(events, completion);
        Ok(self.write_ok)
    }

    /// Pull up to `max` bytes of plaintext. `read(0)` only refills from the
    /// plain socket.
    pub fn read(&mut self, max: usize) -> ReadOutcome {
        let outcome = if max == 0 {
            if self.readable.is_ended() && self.readable.is_empty() {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            }
        } else {
            self.readable.read(max)
        };
        if !self.destroyed && !self.readable.is_saturated() && !self.readable.is_ended() {
            self.pull_ciphertext();
        }
        self.try_emit_end();
        outcome
    }

    /// Send close_notify. The plain socket is destroyed once it has flushed.
    pub fn end(&mut self) {
        if self.destroyed || self.ended {
            return;
        }
        self.ended = true;
        self.writable = false;
        let events = self.engine.close();
        self.apply(events, Completion::noop());
    }

    /// Alias for [`TlsSocket::end`].
    pub fn close(&mut self) {
        self.end();
    }

    /// Tear down both layers. Idempotent.
    pub fn destroy(&mut self) {
        self.destroy_internal(None);
    }

    fn destroy_internal(&mut self, error: Option<SocketError>) {
        if self.destroyed {
            return;
        }
        debug!(
            "Destroying TLS socket {:?} (error: {:?})",
            self.inner.handle_id(),
            error
        );
        self.destroyed = true;
        self.state = TlsState::Closed;
        self.writable = false;
        self.readable.close();
        drop(std::mem::take(&mut self.parked));
        if let Some(err) = error {
            self.emit_error(err);
        }
        self.inner.destroy(None);
        self.emit(TlsEvent::Close {
            had_error: self.error_emitted,
        });
    }

    fn emit_error(&mut self, err: SocketError) {
        if self.error_emitted {
            return;
        }
        self.error_emitted = true;
        self.emit(TlsEvent::Error(err));
    }

    fn emit(&self, event: TlsEvent) {
        if self.events.send(event).is_err() {
            trace!("TLS event dropped, receiver is gone");
        }
    }

    /// Session state.
    pub fn state(&self) -> TlsState {
        self.state
    }

    /// Completed handshakes, renegotiations included.
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    /// Whether the peer passed certificate verification.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Why authorization failed, if it did.
    pub fn authorization_error(&self) -> Option<&SocketError> {
        self.authorization_error.as_ref()
    }

    /// Whether application writes go out immediately.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether the socket was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Local endpoint of the plain socket.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.local_address()
    }

    /// Remote endpoint of the plain socket.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote_address()
    }

    /// The plain socket underneath.
    pub fn inner(&self) -> &Socket {
        &self.inner
    }
}
