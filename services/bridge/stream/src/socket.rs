//! Connection-oriented socket over a raw handle.
//!
//! [`Socket`] owns one handle and the two stream sides layered over it. Raw
//! handle events come in through [`Socket::handle_event`] (or the
//! [`Socket::poll_events`] / [`Socket::process_next`] pumps); application
//! events go out on the channel returned by [`Socket::new`].

use crate::readable::{ReadOutcome, ReadableSide};
use crate::writable::{FlushOutcome, WritableSide};
use bridge_handle::{
    AddressFamily, Completion, HandleAdapter, HandleEvent, HandleEventKind, HandleId, RawHandle,
    Result, SocketContext, SocketError, SocketOption, StreamTarget,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default high-water mark for both stream sides
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

const WRITE_AFTER_FIN: &str = "this socket has been ended by the other party";

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No handle yet
    Unconnected,
    /// Handle allocated, waiting for open
    Connecting,
    /// Both directions open
    Open,
    /// Local side ended; reading continues
    HalfClosedLocal,
    /// Peer ended; writing continues
    HalfClosedRemote,
    /// Both directions ended; waiting for the last writes or reads
    Closed,
    /// Terminal
    Destroyed,
}

/// Coarse readiness summary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// Connect in progress
    Opening,
    /// Readable and writable
    Open,
    /// Readable only
    ReadOnly,
    /// Writable only
    WriteOnly,
    /// Neither
    Closed,
}

/// Events delivered to the socket's owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// Connection established
    Connect,
    /// Buffered data went from empty to non-empty
    Readable,
    /// Write buffer dropped back under the high-water mark
    Drain,
    /// Peer finished and every byte has been read
    End,
    /// Error; always followed by `Close`
    Error(SocketError),
    /// Socket destroyed
    Close {
        /// Whether an error caused the close
        had_error: bool,
    },
}

/// Per-socket tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Inbound bytes buffered before the handle is suspended
    pub read_high_water_mark: usize,
    /// Outbound bytes buffered before `write` asks the caller to wait
    pub write_high_water_mark: usize,
    /// Keep the write side open after the peer's FIN
    pub allow_half_open: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            write_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            allow_half_open: true,
        }
    }
}

/// Connect request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Host name or literal; loopback of `family` when absent
    pub host: Option<String>,
    /// Remote port, must be non-zero
    pub port: u16,
    /// Address family
    pub family: AddressFamily,
}

impl ConnectOptions {
    /// Connect to `host:port` over IPv4.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            family: AddressFamily::V4,
        }
    }

    /// Connect to the loopback address of `family`.
    pub fn loopback(port: u16, family: AddressFamily) -> Self {
        Self {
            host: None,
            port,
            family,
        }
    }
}

/// Connection-oriented socket
pub struct Socket {
    ctx: SocketContext,
    config: SocketConfig,
    state: ConnectionState,
    handle_id: Option<HandleId>,
    handle: Option<Box<dyn RawHandle>>,
    readable: ReadableSide,
    writable: WritableSide,
    readable_flag: bool,
    writable_flag: bool,
    write_after_fin: bool,
    destroy_when_drained: bool,
    error_emitted: bool,
    bytes_read: u64,
    events: mpsc::UnboundedSender<SocketEvent>,
    raw_tx: mpsc::UnboundedSender<HandleEvent>,
    raw_rx: mpsc::UnboundedReceiver<HandleEvent>,
}

impl Socket {
    /// Create an unconnected socket and the receiver for its events.
    pub fn new(
        ctx: SocketContext,
        config: SocketConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let socket = Self {
            ctx,
            readable: ReadableSide::new(config.read_high_water_mark),
            writable: WritableSide::new(config.write_high_water_mark),
            config,
            state: ConnectionState::Unconnected,
            handle_id: None,
            handle: None,
            readable_flag: false,
            writable_flag: false,
            write_after_fin: false,
            destroy_when_drained: false,
            error_emitted: false,
            bytes_read: 0,
            events,
            raw_tx,
            raw_rx,
        };
        (socket, events_rx)
    }

    /// Start connecting. Returns once the handle is allocated; the `Connect`
    /// event follows when the primitive reports the connection open.
    pub fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        match self.state {
            ConnectionState::Unconnected => {}
            ConnectionState::Destroyed => return Err(SocketError::NotRunning),
            _ => {
                return Err(SocketError::validation(
                    "socket is already connecting or connected",
                ))
            }
        }
        if options.port == 0 {
            return Err(SocketError::validation("port should be > 0 and < 65536"));
        }

        let target = StreamTarget {
            host: options
                .host
                .unwrap_or_else(|| options.family.loopback().to_string()),
            port: options.port,
            family: options.family,
        };
        let adapter = self.ctx.adapter(self.raw_tx.clone());
        let id = adapter.id();
        let handle = self.ctx.factory().open_stream(&target, adapter)?;
        debug!("Connecting {} to {}:{}", id, target.host, target.port);

        self.handle_id = Some(id);
        self.handle = Some(handle);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Install an already-connected handle, e.g. one produced by an accept.
    /// The socket enters `Open` without a `Connect` event.
    pub fn adopt<F>(&mut self, open: F) -> Result<()>
    where
        F: FnOnce(HandleAdapter) -> Result<Box<dyn RawHandle>>,
    {
        match self.state {
            ConnectionState::Unconnected => {}
            ConnectionState::Destroyed => return Err(SocketError::NotRunning),
            _ => return Err(SocketError::validation("socket already has a handle")),
        }
        let adapter = self.ctx.adapter(self.raw_tx.clone());
        let id = adapter.id();
        let handle = open(adapter)?;
        debug!("Adopted connected handle {}", id);

        self.handle_id = Some(id);
        self.handle = Some(handle);
        self.state = ConnectionState::Open;
        self.readable_flag = true;
        self.writable_flag = true;
        self.readable.set_reading(true);
        Ok(())
    }

    /// Dispatch one raw handle event.
    pub fn handle_event(&mut self, event: HandleEvent) {
        if self.handle_id != Some(event.handle) {
            trace!("Dropping {:?} from stale handle {}", event.kind, event.handle);
            return;
        }
        match event.kind {
            HandleEventKind::Open => self.on_open(),
            HandleEventKind::Data(data) => self.on_data(data),
            HandleEventKind::Message { data, .. } => self.on_data(data),
            HandleEventKind::Drain => self.on_drain(),
            HandleEventKind::HalfClose => self.on_remote_end(),
            HandleEventKind::Error(msg) => {
                debug!("Handle {} reported error: {}", event.handle, msg);
                self.destroy(Some(SocketError::Transport(msg)));
            }
            HandleEventKind::Close => {
                debug!("Handle {} closed underneath socket", event.handle);
                self.destroy(None);
            }
        }
    }

    /// Process every raw event already queued. Returns how many were handled.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.raw_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next raw event and process it.
    pub async fn process_next(&mut self) {
        if let Some(event) = self.raw_rx.recv().await {
            self.handle_event(event);
        }
    }

    fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!("Ignoring open event in state {:?}", self.state);
            return;
        }
        self.state = if self.writable.is_ended() {
            ConnectionState::HalfClosedLocal
        } else {
            ConnectionState::Open
        };
        self.readable_flag = true;
        self.writable_flag = !self.writable.is_ended();
        debug!("Socket {:?} connected", self.handle_id);
        self.emit(SocketEvent::Connect);

        self.flush_writes();
        if self.state != ConnectionState::Destroyed {
            self.readable.set_reading(true);
        }
    }

    fn on_data(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self.readable.is_ended() {
            trace!("Dropping {} bytes received after end", data.len());
            return;
        }
        let len = data.len();
        let was_empty = self.readable.is_empty();
        self.readable.push(data);
        self.bytes_read += len as u64;
        if was_empty {
            self.emit(SocketEvent::Readable);
        }

        if self.readable.is_saturated() && self.readable.reading() {
            self.readable.set_reading(false);
            if let Some(handle) = self.handle.as_mut() {
                trace!("Read buffer at {} bytes, suspending handle", self.readable.len());
                if let Err(e) = handle.suspend() {
                    warn!("Failed to suspend handle: {}", e);
                }
            }
        }
    }

    fn on_drain(&mut self) {
        let Some(handle) = self.handle.as_deref_mut() else {
            return;
        };
        let outcome = self.writable.on_drain(handle);
        self.after_flush(outcome);
    }

    fn on_remote_end(&mut self) {
        if !self.readable.push_eof() {
            return;
        }
        self.state = match self.state {
            ConnectionState::Open => ConnectionState::HalfClosedRemote,
            ConnectionState::HalfClosedLocal => ConnectionState::Closed,
            other => other,
        };
        debug!("Peer ended, state {:?}", self.state);

        if !self.config.allow_half_open {
            self.write_after_fin = true;
            self.destroy_soon();
            if self.state == ConnectionState::Destroyed {
                return;
            }
        }
        self.try_emit_end();
    }

    /// Pull up to `max` buffered bytes. `read(0)` only starts the flow of
    /// inbound data.
    pub fn read(&mut self, max: usize) -> ReadOutcome {
        if max == 0 {
            if !self.readable.reading() && !self.readable.is_saturated() {
                self.resume_reading();
            }
            self.try_emit_end();
            return if self.readable.is_ended() && self.readable.is_empty() {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            };
        }

        let outcome = self.readable.read(max);
        match outcome {
            ReadOutcome::Data(_) => {
                if !self.readable.reading() && !self.readable.is_saturated() {
                    self.resume_reading();
                }
                self.try_emit_end();
            }
            ReadOutcome::Eof => self.try_emit_end(),
            ReadOutcome::WouldBlock => {}
        }
        outcome
    }

    fn resume_reading(&mut self) {
        if self.state == ConnectionState::Destroyed || self.readable.is_ended() {
            return;
        }
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if !matches!(self.state, ConnectionState::Connecting) {
            trace!("Resuming handle reads");
            handle.resume();
            self.readable.set_reading(true);
        }
    }

    fn try_emit_end(&mut self) {
        if self.readable.take_end() {
            self.readable_flag = false;
            self.emit(SocketEvent::End);
            self.maybe_destroy();
        }
    }

    /// Queue `data`. Returns `Ok(false)` when the caller should wait for a
    /// `Drain` event before writing more.
    pub fn write(&mut self, data: impl Into<Bytes>, completion: Completion) -> Result<bool> {
        let data = data.into();
        if self.write_after_fin {
            let err = SocketError::Protocol(WRITE_AFTER_FIN.to_string());
            self.emit(SocketEvent::Error(err.clone()));
            completion.complete(Err(err.clone()));
            return Err(err);
        }
        let err = match self.state {
            ConnectionState::Destroyed | ConnectionState::Unconnected => Some(SocketError::Closed),
            _ if self.writable.is_ended() => {
                Some(SocketError::Protocol("write after end".to_string()))
            }
            _ => None,
        };
        if let Some(err) = err {
            completion.complete(Err(err.clone()));
            return Err(err);
        }

        let below_mark = self.writable.enqueue(data, completion);
        if self.state != ConnectionState::Connecting {
            self.flush_writes();
        }
        Ok(below_mark)
    }

    fn flush_writes(&mut self) {
        let Some(handle) = self.handle.as_deref_mut() else {
            return;
        };
        let outcome = self.writable.flush(handle);
        self.after_flush(outcome);
    }

    fn after_flush(&mut self, outcome: FlushOutcome) {
        if outcome.drain {
            self.emit(SocketEvent::Drain);
        }
        if self.writable.is_ended() && self.writable.is_idle() && !self.writable.is_finished() {
            self.finish_local();
        }
    }

    fn finish_local(&mut self) {
        if self.state == ConnectionState::Connecting {
            return;
        }
        self.writable.finish();
        trace!("Write side finished in state {:?}", self.state);

        if self.destroy_when_drained {
            self.destroy(None);
            return;
        }
        if self.readable.is_ended() {
            self.destroy(None);
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.shutdown();
        }
    }

    fn maybe_destroy(&mut self) {
        if self.state != ConnectionState::Destroyed
            && self.writable.is_finished()
            && self.readable.end_emitted()
        {
            self.destroy(None);
        }
    }

    /// Finish the write side. Queued writes still flush; the handle is then
    /// half-closed, or the socket destroyed if the peer already ended.
    pub fn end(&mut self) {
        if self.writable.is_ended() || self.state == ConnectionState::Destroyed {
            return;
        }
        self.writable.end();
        self.writable_flag = false;
        self.state = match self.state {
            ConnectionState::Open => ConnectionState::HalfClosedLocal,
            ConnectionState::HalfClosedRemote => ConnectionState::Closed,
            other => other,
        };
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Unconnected
        ) {
            return;
        }
        self.flush_writes();
    }

    /// End, then destroy as soon as the write queue drains.
    pub fn destroy_soon(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        self.destroy_when_drained = true;
        if !self.writable.is_ended() {
            self.end();
        } else if self.writable.is_finished() {
            self.destroy(None);
        }
    }

    /// Tear the socket down. Idempotent.
    pub fn destroy(&mut self, error: Option<SocketError>) {
        self.destroy_with(error, Completion::noop());
    }

    /// Tear the socket down and fire `completion` once done. On an already
    /// destroyed socket only the completion fires.
    pub fn destroy_with(&mut self, error: Option<SocketError>, completion: Completion) {
        if self.state == ConnectionState::Destroyed {
            completion.complete(error.map_or(Ok(()), Err));
            return;
        }
        debug!("Destroying socket {:?} (error: {:?})", self.handle_id, error);

        self.state = ConnectionState::Destroyed;
        self.readable_flag = false;
        self.writable_flag = false;
        self.readable.set_reading(false);
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.handle_id = None;
        self.writable.fail_all(SocketError::Closed);
        self.readable.close();

        let had_error = error.is_some();
        if let Some(err) = error.clone() {
            if !self.error_emitted {
                self.error_emitted = true;
                self.emit(SocketEvent::Error(err));
            }
        }
        self.emit(SocketEvent::Close { had_error });
        completion.complete(error.map_or(Ok(()), Err));
    }

    /// Forward TCP_NODELAY to the handle.
    pub fn set_no_delay(&mut self, no_delay: bool) -> Result<()> {
        self.set_option(SocketOption::NoDelay(no_delay))
    }

    /// Forward keepalive settings to the handle.
    pub fn set_keep_alive(&mut self, enable: bool, initial_delay: Duration) -> Result<()> {
        self.set_option(SocketOption::KeepAlive {
            enable,
            initial_delay,
        })
    }

    /// Idle timeouts are left to the caller.
    pub fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Err(SocketError::Unsupported("socket timeouts"))
    }

    fn set_option(&mut self, option: SocketOption) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.set_option(option),
            None => Ok(()),
        }
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Readiness summary.
    pub fn ready_state(&self) -> ReadyState {
        match self.state {
            ConnectionState::Connecting => ReadyState::Opening,
            ConnectionState::Unconnected | ConnectionState::Destroyed => ReadyState::Closed,
            _ => match (self.readable_flag, self.writable_flag) {
                (true, true) => ReadyState::Open,
                (true, false) => ReadyState::ReadOnly,
                (false, true) => ReadyState::WriteOnly,
                (false, false) => ReadyState::Closed,
            },
        }
    }

    /// Whether the socket was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state == ConnectionState::Destroyed
    }

    /// Whether reads can still produce data.
    pub fn is_readable(&self) -> bool {
        self.readable_flag
    }

    /// Whether writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.writable_flag
    }

    /// Writes queued behind an in-flight connect.
    pub fn pending_connect_write(&self) -> bool {
        self.state == ConnectionState::Connecting && !self.writable.is_idle()
    }

    /// Bytes buffered in the handle plus those still queued here.
    pub fn buffer_size(&self) -> usize {
        let handle = self.handle.as_ref().map_or(0, |h| h.buffered_amount());
        handle + self.writable.queued_bytes()
    }

    /// Bytes received from the handle.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes handed to the handle.
    pub fn bytes_written(&self) -> u64 {
        self.writable.bytes_written()
    }

    /// Local endpoint of the current handle.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.handle.as_ref().and_then(|h| h.local_addr())
    }

    /// Remote endpoint of the current handle.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.handle.as_ref().and_then(|h| h.peer_addr())
    }

    /// Id of the current handle.
    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle_id
    }

    fn emit(&self, event: SocketEvent) {
        if self.events.send(event).is_err() {
            trace!("Socket event dropped, receiver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_handle::mem::{MemHandleCtl, MemTransport, StaticResolver};
    use bridge_handle::HandleFactory;
    use std::sync::{Arc, Mutex};

    struct Harness {
        transport: Arc<MemTransport>,
        socket: Socket,
        events: mpsc::UnboundedReceiver<SocketEvent>,
    }

    impl Harness {
        fn new(config: SocketConfig) -> Self {
            let transport = Arc::new(MemTransport::new());
            let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
            let (socket, events) = Socket::new(ctx, config);
            Self {
                transport,
                socket,
                events,
            }
        }

        fn connected(config: SocketConfig) -> (Self, MemHandleCtl) {
            let mut h = Self::new(config);
            h.socket
                .connect(ConnectOptions::new("203.0.113.5", 443))
                .unwrap();
            let ctl = h.transport.last().unwrap();
            ctl.open();
            h.socket.poll_events();
            assert_eq!(h.drain_events(), vec![SocketEvent::Connect]);
            (h, ctl)
        }

        fn drain_events(&mut self) -> Vec<SocketEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                out.push(ev);
            }
            out
        }
    }

    fn ordered(log: &Arc<Mutex<Vec<(u32, Result<()>)>>>, tag: u32) -> Completion {
        let log = log.clone();
        Completion::new(move |r| log.lock().unwrap().push((tag, r)))
    }

    #[test]
    fn test_connect_rejects_port_zero() {
        let mut h = Harness::new(SocketConfig::default());
        let err = h.socket.connect(ConnectOptions::new("203.0.113.5", 0)).unwrap_err();
        assert!(err.is_validation());
        assert!(h.transport.handles().is_empty());
        assert_eq!(h.socket.state(), ConnectionState::Unconnected);
    }

    #[test]
    fn test_connect_defaults_to_loopback() {
        let mut h = Harness::new(SocketConfig::default());
        h.socket
            .connect(ConnectOptions::loopback(8080, AddressFamily::V6))
            .unwrap();
        let target = h.transport.last().unwrap().target().unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(h.socket.ready_state(), ReadyState::Opening);
        assert!(h.socket.connect(ConnectOptions::new("::1", 1)).unwrap_err().is_validation());
    }

    #[test]
    fn test_write_before_connect_is_flushed_on_open() {
        let mut h = Harness::new(SocketConfig::default());
        h.socket
            .connect(ConnectOptions::new("203.0.113.5", 443))
            .unwrap();
        let ctl = h.transport.last().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(h.socket.write(&b"GET /"[..], ordered(&log, 1)).unwrap());
        assert!(h.socket.write(&b" HTTP/1.1"[..], ordered(&log, 2)).unwrap());
        assert!(h.socket.pending_connect_write());
        assert!(ctl.sent().is_empty());
        assert!(log.lock().unwrap().is_empty());

        ctl.open();
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![SocketEvent::Connect]);
        assert_eq!(ctl.sent_bytes(), b"GET / HTTP/1.1");
        assert_eq!(*log.lock().unwrap(), vec![(1, Ok(())), (2, Ok(()))]);
        assert_eq!(h.socket.state(), ConnectionState::Open);
        assert_eq!(
            h.socket.remote_address(),
            Some("203.0.113.5:443".parse().unwrap())
        );
    }

    #[test]
    fn test_writes_complete_in_order_under_backpressure() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        h.socket.write(&b"a"[..], ordered(&log, 0)).unwrap();
        ctl.set_blocked(true);
        for tag in 1..5 {
            h.socket.write(vec![b'0' + tag as u8], ordered(&log, tag)).unwrap();
        }
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(ctl.sent().len(), 2);
        assert!(h.socket.buffer_size() > 0);

        ctl.drain();
        h.socket.poll_events();
        let tags: Vec<u32> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert!(log.lock().unwrap().iter().all(|(_, r)| r.is_ok()));
        assert_eq!(ctl.sent_bytes(), b"a1234");
        assert_eq!(h.socket.bytes_written(), 5);
    }

    #[test]
    fn test_write_high_water_mark_emits_drain() {
        let config = SocketConfig {
            write_high_water_mark: 4,
            ..SocketConfig::default()
        };
        let (mut h, ctl) = Harness::connected(config);
        ctl.set_blocked(true);
        assert!(!h.socket.write(&b"abcdef"[..], Completion::noop()).unwrap());
        assert!(h.drain_events().is_empty());

        ctl.drain();
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![SocketEvent::Drain]);
    }

    #[test]
    fn test_write_after_destroy_fails_with_closed() {
        let (mut h, _ctl) = Harness::connected(SocketConfig::default());
        h.socket.destroy(None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = h.socket.write(&b"x"[..], ordered(&log, 9)).unwrap_err();
        assert_eq!(err, SocketError::Closed);
        assert_eq!(*log.lock().unwrap(), vec![(9, Err(SocketError::Closed))]);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        ctl.set_blocked(true);
        h.socket.write(&b"one"[..], ordered(&log, 1)).unwrap();
        h.socket.write(&b"two"[..], ordered(&log, 2)).unwrap();

        let boom = SocketError::Transport("reset".into());
        h.socket.destroy(Some(boom.clone()));
        h.socket.destroy(Some(boom.clone()));
        let (done, _rx) = Completion::channel();
        h.socket.destroy_with(None, done);

        assert_eq!(
            h.drain_events(),
            vec![SocketEvent::Error(boom), SocketEvent::Close { had_error: true }]
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, Err(SocketError::Closed)), (2, Err(SocketError::Closed))]
        );
        assert!(ctl.is_closed());
        assert_eq!(h.socket.ready_state(), ReadyState::Closed);
        assert_eq!(h.socket.connect(ConnectOptions::new("x", 1)), Err(SocketError::NotRunning));
    }

    #[tokio::test]
    async fn test_destroy_with_on_destroyed_socket_still_completes() {
        let (mut h, _ctl) = Harness::connected(SocketConfig::default());
        h.socket.destroy(None);
        let (done, rx) = Completion::channel();
        h.socket.destroy_with(Some(SocketError::Closed), done);
        assert_eq!(rx.await.unwrap(), Err(SocketError::Closed));
    }

    #[test]
    fn test_read_flow_control_suspends_and_resumes() {
        let config = SocketConfig {
            read_high_water_mark: 8,
            ..SocketConfig::default()
        };
        let (mut h, ctl) = Harness::connected(config);

        ctl.deliver(b"hello");
        ctl.deliver(b"world");
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![SocketEvent::Readable]);
        assert!(ctl.is_suspended());

        assert_eq!(
            h.socket.read(4),
            ReadOutcome::Data(Bytes::from_static(b"hell"))
        );
        assert!(!ctl.is_suspended());
        assert_eq!(
            h.socket.read(64),
            ReadOutcome::Data(Bytes::from_static(b"oworld"))
        );
        assert_eq!(h.socket.read(64), ReadOutcome::WouldBlock);
        assert_eq!(h.socket.bytes_read(), 10);
    }

    #[test]
    fn test_eof_emitted_after_buffer_consumed() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        ctl.deliver(b"tail");
        ctl.half_close();
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![SocketEvent::Readable]);
        assert_eq!(h.socket.state(), ConnectionState::HalfClosedRemote);

        assert_eq!(
            h.socket.read(64),
            ReadOutcome::Data(Bytes::from_static(b"tail"))
        );
        assert_eq!(h.drain_events(), vec![SocketEvent::End]);
        assert_eq!(h.socket.read(64), ReadOutcome::Eof);
        assert!(h.drain_events().is_empty());
        assert_eq!(h.socket.ready_state(), ReadyState::WriteOnly);
    }

    #[test]
    fn test_remote_eof_waits_for_writes_and_end() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        ctl.set_blocked(true);
        h.socket.write(&b"pending"[..], ordered(&log, 1)).unwrap();
        h.socket.write(&b"more"[..], ordered(&log, 2)).unwrap();

        ctl.half_close();
        h.socket.poll_events();
        assert_eq!(h.socket.state(), ConnectionState::HalfClosedRemote);
        assert_eq!(h.drain_events(), vec![SocketEvent::End]);
        assert!(!h.socket.is_destroyed());

        ctl.drain();
        h.socket.poll_events();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert!(!h.socket.is_destroyed());

        h.socket.end();
        assert!(h.socket.is_destroyed());
        assert_eq!(h.drain_events(), vec![SocketEvent::Close { had_error: false }]);
    }

    #[test]
    fn test_end_after_remote_eof_with_unread_data_destroys() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        ctl.deliver(b"unread");
        ctl.half_close();
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![SocketEvent::Readable]);
        assert_eq!(h.socket.state(), ConnectionState::HalfClosedRemote);

        h.socket.end();
        assert!(h.socket.is_destroyed());
        assert!(ctl.is_closed());
        assert_eq!(h.drain_events(), vec![SocketEvent::Close { had_error: false }]);
        assert_eq!(h.socket.read(64), ReadOutcome::Eof);
    }

    #[test]
    fn test_read_after_destroy_is_eof() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        ctl.deliver(b"pending");
        h.socket.poll_events();
        h.socket.destroy(None);

        assert_eq!(h.socket.read(64), ReadOutcome::Eof);
        assert_eq!(h.socket.read(0), ReadOutcome::Eof);
        assert_eq!(
            h.drain_events(),
            vec![SocketEvent::Readable, SocketEvent::Close { had_error: false }]
        );
    }

    #[test]
    fn test_end_then_remote_end_destroys() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        h.socket.write(&b"bye"[..], Completion::noop()).unwrap();
        h.socket.end();
        assert_eq!(h.socket.state(), ConnectionState::HalfClosedLocal);
        assert!(ctl.is_shut_down());
        assert_eq!(h.socket.ready_state(), ReadyState::ReadOnly);
        assert!(matches!(
            h.socket.write(&b"x"[..], Completion::noop()),
            Err(SocketError::Protocol(_))
        ));

        ctl.half_close();
        h.socket.poll_events();
        assert_eq!(
            h.drain_events(),
            vec![SocketEvent::End, SocketEvent::Close { had_error: false }]
        );
        assert!(ctl.is_closed());
    }

    #[test]
    fn test_remote_end_without_half_open_rejects_writes() {
        let config = SocketConfig {
            allow_half_open: false,
            ..SocketConfig::default()
        };
        let (mut h, ctl) = Harness::connected(config);
        ctl.set_blocked(true);
        h.socket.write(&b"queued"[..], Completion::noop()).unwrap();
        h.socket.write(&b"tail"[..], Completion::noop()).unwrap();

        ctl.half_close();
        h.socket.poll_events();
        assert_eq!(h.socket.state(), ConnectionState::Closed);
        assert_eq!(h.drain_events(), vec![SocketEvent::End]);

        let err = h.socket.write(&b"late"[..], Completion::noop()).unwrap_err();
        assert_eq!(err, SocketError::Protocol(WRITE_AFTER_FIN.to_string()));
        assert_eq!(h.drain_events(), vec![SocketEvent::Error(err)]);

        ctl.drain();
        h.socket.poll_events();
        assert!(h.socket.is_destroyed());
        assert_eq!(ctl.sent_bytes(), b"queuedtail");
    }

    #[test]
    fn test_end_during_connect_defers_finish() {
        let mut h = Harness::new(SocketConfig::default());
        h.socket
            .connect(ConnectOptions::new("203.0.113.5", 443))
            .unwrap();
        let ctl = h.transport.last().unwrap();
        h.socket.write(&b"only"[..], Completion::noop()).unwrap();
        h.socket.end();
        assert!(!ctl.is_shut_down());

        ctl.open();
        h.socket.poll_events();
        assert_eq!(ctl.sent_bytes(), b"only");
        assert!(ctl.is_shut_down());
        assert_eq!(h.socket.state(), ConnectionState::HalfClosedLocal);
    }

    #[test]
    fn test_destroy_soon_waits_for_queue() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        ctl.set_blocked(true);
        h.socket.write(&b"data"[..], Completion::noop()).unwrap();
        h.socket.destroy_soon();
        assert!(!h.socket.is_destroyed());

        ctl.drain();
        h.socket.poll_events();
        assert!(h.socket.is_destroyed());
    }

    #[test]
    fn test_handle_error_emits_error_then_close() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        ctl.error("connection reset");
        ctl.close_remote();
        h.socket.poll_events();
        assert_eq!(
            h.drain_events(),
            vec![
                SocketEvent::Error(SocketError::Transport("connection reset".into())),
                SocketEvent::Close { had_error: true }
            ]
        );
    }

    #[test]
    fn test_connect_failure_destroys() {
        let mut h = Harness::new(SocketConfig::default());
        h.socket
            .connect(ConnectOptions::new("203.0.113.5", 443))
            .unwrap();
        let ctl = h.transport.last().unwrap();
        h.socket.write(&b"never"[..], Completion::noop()).unwrap();
        ctl.error("connection refused");
        h.socket.poll_events();
        assert!(h.socket.is_destroyed());
        assert_eq!(h.drain_events().len(), 2);
    }

    #[test]
    fn test_stale_handle_events_ignored() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        h.socket.destroy(None);
        h.drain_events();
        ctl.deliver(b"late");
        ctl.close_remote();
        assert_eq!(h.socket.poll_events(), 2);
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn test_options_forwarded() {
        let (mut h, ctl) = Harness::connected(SocketConfig::default());
        h.socket.set_no_delay(true).unwrap();
        h.socket
            .set_keep_alive(true, Duration::from_secs(30))
            .unwrap();
        assert_eq!(
            ctl.options(),
            vec![
                SocketOption::NoDelay(true),
                SocketOption::KeepAlive {
                    enable: true,
                    initial_delay: Duration::from_secs(30)
                }
            ]
        );
        assert_eq!(
            h.socket.set_timeout(Duration::from_secs(1)),
            Err(SocketError::Unsupported("socket timeouts"))
        );
        assert!(h.socket.local_address().is_some());
    }

    #[test]
    fn test_adopt_enters_open_without_connect_event() {
        let transport = Arc::new(MemTransport::new());
        let ctx = SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()));
        let (mut socket, mut events) = Socket::new(ctx, SocketConfig::default());
        let target = StreamTarget {
            host: "192.0.2.7".into(),
            port: 5000,
            family: AddressFamily::V4,
        };
        let factory = transport.clone();
        socket
            .adopt(|adapter| factory.open_stream(&target, adapter))
            .unwrap();
        assert_eq!(socket.state(), ConnectionState::Open);
        assert!(events.try_recv().is_err());

        socket.write(&b"hi"[..], Completion::noop()).unwrap();
        assert_eq!(transport.last().unwrap().sent_bytes(), b"hi");
    }

    #[tokio::test]
    async fn test_process_next_awaits_events() {
        let mut h = Harness::new(SocketConfig::default());
        h.socket
            .connect(ConnectOptions::new("203.0.113.5", 443))
            .unwrap();
        let (done, rx) = Completion::channel();
        h.socket.write(&b"ping"[..], done).unwrap();
        h.transport.last().unwrap().open();
        h.socket.process_next().await;
        assert_eq!(rx.await.unwrap(), Ok(()));
    }
}
