//! In-memory handle primitive for development and testing.
//!
//! [`MemTransport`] hands out handles that record what the socket asked of
//! them. The paired [`MemHandleCtl`] plays the remote side: it fires the
//! primitive's callbacks and toggles backpressure.

use crate::error::{Result, SocketError};
use crate::event::{HandleAdapter, HandleId};
use crate::handle::{
    AddressFamily, DatagramBind, HandleFactory, RawHandle, Resolver, SocketOption, StreamTarget,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

const EPHEMERAL_BASE: u16 = 49152;

/// Kind of in-memory handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemHandleKind {
    /// Connection-oriented
    Stream,
    /// Datagram
    Datagram,
}

#[derive(Debug)]
struct MemHandleState {
    adapter: HandleAdapter,
    kind: MemHandleKind,
    target: Option<StreamTarget>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    sent: Vec<Bytes>,
    sent_to: Vec<(Bytes, SocketAddr)>,
    options: Vec<SocketOption>,
    blocked: bool,
    buffered: usize,
    suspended: bool,
    shut_down: bool,
    closed: bool,
}

type HandleTable = Arc<DashMap<HandleId, MemHandleState>>;

/// Handle factory backed by in-process state
#[derive(Clone, Default)]
pub struct MemTransport {
    handles: HandleTable,
    auto_open: bool,
}

impl MemTransport {
    /// Transport where every open event is fired by the test.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that reports bound datagram handles open immediately.
    pub fn with_auto_open() -> Self {
        Self {
            handles: HandleTable::default(),
            auto_open: true,
        }
    }

    /// Control for handle `id`.
    pub fn get(&self, id: HandleId) -> Option<MemHandleCtl> {
        self.handles.contains_key(&id).then(|| MemHandleCtl {
            id,
            handles: self.handles.clone(),
        })
    }

    /// Controls for every handle opened so far, oldest first.
    pub fn handles(&self) -> Vec<MemHandleCtl> {
        let mut ids: Vec<HandleId> = self.handles.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids.into_iter()
            .map(|id| MemHandleCtl {
                id,
                handles: self.handles.clone(),
            })
            .collect()
    }

    /// Control for the most recently opened handle.
    pub fn last(&self) -> Option<MemHandleCtl> {
        self.handles().pop()
    }

    fn insert(&self, adapter: HandleAdapter, state: MemHandleState) -> Box<dyn RawHandle> {
        let id = adapter.id();
        self.handles.insert(id, state);
        Box::new(MemHandle {
            id,
            handles: self.handles.clone(),
        })
    }
}

impl HandleFactory for MemTransport {
    fn open_stream(
        &self,
        target: &StreamTarget,
        adapter: HandleAdapter,
    ) -> Result<Box<dyn RawHandle>> {
        debug!("mem open_stream {} -> {}:{}", adapter.id(), target.host, target.port);
        let peer = target
            .host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, target.port));
        let local = SocketAddr::new(
            target.family.loopback(),
            EPHEMERAL_BASE.wrapping_add(adapter.id().0 as u16),
        );
        let state = MemHandleState::new(adapter.clone(), MemHandleKind::Stream)
            .with_target(target.clone(), peer, local);
        Ok(self.insert(adapter, state))
    }

    fn open_datagram(
        &self,
        bind: &DatagramBind,
        adapter: HandleAdapter,
    ) -> Result<Box<dyn RawHandle>> {
        let local = bind.local.map(|mut addr| {
            if addr.port() == 0 {
                addr.set_port(EPHEMERAL_BASE.wrapping_add(adapter.id().0 as u16));
            }
            addr
        });
        debug!("mem open_datagram {} bind={:?}", adapter.id(), local);
        let mut state = MemHandleState::new(adapter.clone(), MemHandleKind::Datagram);
        state.local = local;
        let handle = self.insert(adapter.clone(), state);
        if self.auto_open && local.is_some() {
            adapter.on_open();
        }
        Ok(handle)
    }
}

impl MemHandleState {
    fn new(adapter: HandleAdapter, kind: MemHandleKind) -> Self {
        Self {
            adapter,
            kind,
            target: None,
            local: None,
            peer: None,
            sent: Vec::new(),
            sent_to: Vec::new(),
            options: Vec::new(),
            blocked: false,
            buffered: 0,
            suspended: false,
            shut_down: false,
            closed: false,
        }
    }

    fn with_target(mut self, target: StreamTarget, peer: Option<SocketAddr>, local: SocketAddr) -> Self {
        self.target = Some(target);
        self.peer = peer;
        self.local = Some(local);
        self
    }
}

struct MemHandle {
    id: HandleId,
    handles: HandleTable,
}

impl MemHandle {
    fn with_state<R>(&self, f: impl FnOnce(&mut MemHandleState) -> R) -> Option<R> {
        self.handles.get_mut(&self.id).map(|mut s| f(&mut s))
    }
}

impl RawHandle for MemHandle {
    fn send(&mut self, data: &[u8]) -> bool {
        self.with_state(|s| {
            if s.closed {
                return false;
            }
            s.sent.push(Bytes::copy_from_slice(data));
            if s.blocked {
                s.buffered += data.len();
            }
            !s.blocked
        })
        .unwrap_or(false)
    }

    fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> bool {
        self.with_state(|s| {
            if s.closed {
                return false;
            }
            s.sent_to.push((Bytes::copy_from_slice(data), dest));
            if s.blocked {
                s.buffered += data.len();
            }
            !s.blocked
        })
        .unwrap_or(false)
    }

    fn suspend(&mut self) -> Result<()> {
        self.with_state(|s| s.suspended = true)
            .ok_or(SocketError::NotRunning)
    }

    fn resume(&mut self) {
        self.with_state(|s| s.suspended = false);
    }

    fn shutdown(&mut self) {
        self.with_state(|s| s.shut_down = true);
    }

    fn close(&mut self) {
        self.with_state(|s| s.closed = true);
    }

    fn set_option(&mut self, option: SocketOption) -> Result<()> {
        self.with_state(|s| {
            if s.closed {
                return Err(SocketError::Closed);
            }
            s.options.push(option);
            Ok(())
        })
        .unwrap_or(Err(SocketError::NotRunning))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handles.get(&self.id).and_then(|s| s.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.handles.get(&self.id).and_then(|s| s.peer)
    }

    fn buffered_amount(&self) -> usize {
        self.handles.get(&self.id).map(|s| s.buffered).unwrap_or(0)
    }

    fn is_closed(&self) -> bool {
        self.handles.get(&self.id).map(|s| s.closed).unwrap_or(true)
    }
}

/// Remote-side control over one in-memory handle
#[derive(Clone)]
pub struct MemHandleCtl {
    id: HandleId,
    handles: HandleTable,
}

impl MemHandleCtl {
    /// Id of the controlled handle.
    pub fn id(&self) -> HandleId {
        self.id
    }

    fn adapter(&self) -> Option<HandleAdapter> {
        self.handles.get(&self.id).map(|s| s.adapter.clone())
    }

    fn read<R>(&self, f: impl FnOnce(&MemHandleState) -> R) -> Option<R> {
        self.handles.get(&self.id).map(|s| f(&s))
    }

    /// Report the connection established (or the endpoint bound).
    pub fn open(&self) {
        if let Some(a) = self.adapter() {
            a.on_open();
        }
    }

    /// Deliver stream bytes.
    pub fn deliver(&self, data: &[u8]) {
        if let Some(a) = self.adapter() {
            a.on_data(data);
        }
    }

    /// Deliver a datagram from `from`.
    pub fn deliver_from(&self, data: &[u8], from: SocketAddr) {
        if let Some(a) = self.adapter() {
            a.on_message(data, from);
        }
    }

    /// Peer sent FIN.
    pub fn half_close(&self) {
        if let Some(a) = self.adapter() {
            a.on_half_close();
        }
    }

    /// Report an error.
    pub fn error(&self, message: &str) {
        if let Some(a) = self.adapter() {
            a.on_error(message);
        }
    }

    /// Close the handle from underneath the socket.
    pub fn close_remote(&self) {
        if let Some(mut s) = self.handles.get_mut(&self.id) {
            s.closed = true;
        }
        if let Some(a) = self.adapter() {
            a.on_close();
        }
    }

    /// Toggle backpressure: while blocked, sends answer "would block".
    pub fn set_blocked(&self, blocked: bool) {
        if let Some(mut s) = self.handles.get_mut(&self.id) {
            s.blocked = blocked;
        }
    }

    /// Flush the simulated send buffer and fire the drain callback.
    pub fn drain(&self) {
        if let Some(mut s) = self.handles.get_mut(&self.id) {
            s.blocked = false;
            s.buffered = 0;
        }
        if let Some(a) = self.adapter() {
            a.on_drain();
        }
    }

    /// Kind of handle.
    pub fn kind(&self) -> Option<MemHandleKind> {
        self.read(|s| s.kind)
    }

    /// Connect target of a stream handle.
    pub fn target(&self) -> Option<StreamTarget> {
        self.read(|s| s.target.clone()).flatten()
    }

    /// Chunks passed to `send`, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.read(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Concatenation of every chunk passed to `send`.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent().iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// Take and clear the recorded stream chunks.
    pub fn take_sent(&self) -> Vec<Bytes> {
        self.handles
            .get_mut(&self.id)
            .map(|mut s| std::mem::take(&mut s.sent))
            .unwrap_or_default()
    }

    /// Datagrams passed to `send_to`, in order.
    pub fn sent_to(&self) -> Vec<(Bytes, SocketAddr)> {
        self.read(|s| s.sent_to.clone()).unwrap_or_default()
    }

    /// Options applied to the handle.
    pub fn options(&self) -> Vec<SocketOption> {
        self.read(|s| s.options.clone()).unwrap_or_default()
    }

    /// Bound local endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.read(|s| s.local).flatten()
    }

    /// Whether inbound delivery is suspended.
    pub fn is_suspended(&self) -> bool {
        self.read(|s| s.suspended).unwrap_or(false)
    }

    /// Whether the socket half-closed its sending side.
    pub fn is_shut_down(&self) -> bool {
        self.read(|s| s.shut_down).unwrap_or(false)
    }

    /// Whether the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.read(|s| s.closed).unwrap_or(true)
    }
}

/// Resolver answering from a fixed table, then IP literals
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    table: HashMap<String, IpAddr>,
}

impl StaticResolver {
    /// Empty table; only literals resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name.
    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.table.insert(host.into(), ip);
        self
    }
}

impl Resolver for StaticResolver {
    fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr> {
        let ip = match self.table.get(host) {
            Some(ip) => *ip,
            None => host
                .parse::<IpAddr>()
                .map_err(|_| SocketError::Transport(format!("lookup {} failed: unknown host", host)))?,
        };
        if family.matches(&ip) {
            Ok(ip)
        } else {
            Err(SocketError::Transport(format!(
                "lookup {} returned no {:?} address",
                host, family
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HandleEventKind;
    use tokio::sync::mpsc;

    #[test]
    fn test_stream_handle_records_and_blocks() {
        let transport = MemTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = HandleAdapter::new(HandleId(3), tx);
        let target = StreamTarget {
            host: "203.0.113.5".to_string(),
            port: 443,
            family: AddressFamily::V4,
        };
        let mut handle = transport.open_stream(&target, adapter).unwrap();
        let ctl = transport.last().unwrap();

        assert_eq!(ctl.id(), HandleId(3));
        assert_eq!(handle.peer_addr(), Some("203.0.113.5:443".parse().unwrap()));
        assert!(handle.send(b"abc"));
        ctl.set_blocked(true);
        assert!(!handle.send(b"de"));
        assert_eq!(handle.buffered_amount(), 2);
        assert_eq!(ctl.sent_bytes(), b"abcde");

        ctl.drain();
        assert_eq!(handle.buffered_amount(), 0);
        assert_eq!(rx.try_recv().unwrap().kind, HandleEventKind::Drain);

        handle.close();
        assert!(ctl.is_closed());
        assert!(!handle.send(b"x"));
    }

    #[test]
    fn test_auto_open_datagram_assigns_port() {
        let transport = MemTransport::with_auto_open();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bind = DatagramBind {
            family: AddressFamily::V4,
            local: Some("0.0.0.0:0".parse().unwrap()),
        };
        let handle = transport
            .open_datagram(&bind, HandleAdapter::new(HandleId(2), tx))
            .unwrap();
        assert_eq!(handle.local_addr().unwrap().port(), EPHEMERAL_BASE + 2);
        assert_eq!(rx.try_recv().unwrap().kind, HandleEventKind::Open);
    }

    #[test]
    fn test_static_resolver() {
        let r = StaticResolver::new().with_host("peer.test", "198.51.100.1".parse().unwrap());
        assert_eq!(
            r.lookup("peer.test", AddressFamily::V4).unwrap().to_string(),
            "198.51.100.1"
        );
        assert!(r.lookup("nowhere.test", AddressFamily::V4).is_err());
        assert!(r.lookup("peer.test", AddressFamily::V6).is_err());
    }
}
