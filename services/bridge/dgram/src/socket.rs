//! Datagram socket state machine.
//!
//! Bind lifecycle is `Unbound -> Binding -> Bound`. Sends issued before the
//! socket is bound wait in a queue that is flushed once, in order, right
//! after `Listening`, and then discarded.

use bridge_handle::{
    AddressFamily, Completion, DatagramBind, HandleAdapter, HandleEvent, HandleEventKind,
    HandleId, RawHandle, Result, SocketContext, SocketError, SocketOption,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Datagram socket type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatagramKind {
    /// IPv4
    Udp4,
    /// IPv6
    Udp6,
}

impl DatagramKind {
    /// Address family of this socket type.
    pub fn family(self) -> AddressFamily {
        match self {
            DatagramKind::Udp4 => AddressFamily::V4,
            DatagramKind::Udp6 => AddressFamily::V6,
        }
    }
}

impl FromStr for DatagramKind {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp4" => Ok(DatagramKind::Udp4),
            "udp6" => Ok(DatagramKind::Udp6),
            _ => Err(SocketError::validation(
                "bad socket type specified. Valid types are: udp4, udp6",
            )),
        }
    }
}

impl fmt::Display for DatagramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatagramKind::Udp4 => write!(f, "udp4"),
            DatagramKind::Udp6 => write!(f, "udp6"),
        }
    }
}

/// Bind lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindState {
    /// No local endpoint
    Unbound,
    /// Resolution done, waiting for the handle to report the endpoint live
    Binding,
    /// Endpoint live
    Bound,
}

/// Sender of a received datagram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Sender address
    pub address: IpAddr,
    /// Sender port
    pub port: u16,
    /// Payload size
    pub size: usize,
}

/// Events delivered to the socket's owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatagramEvent {
    /// Socket bound
    Listening,
    /// Datagram received
    Message {
        /// Payload
        data: Bytes,
        /// Sender
        from: RemoteInfo,
    },
    /// Error
    Error(SocketError),
    /// Socket closed
    Close,
}

struct QueuedSend {
    data: Bytes,
    port: u16,
    address: Option<String>,
    completion: Completion,
}

/// Datagram socket
pub struct DatagramSocket {
    ctx: SocketContext,
    kind: DatagramKind,
    state: BindState,
    handle_id: Option<HandleId>,
    handle: Option<Box<dyn RawHandle>>,
    send_queue: Option<VecDeque<QueuedSend>>,
    after_sends: VecDeque<Completion>,
    events: mpsc::UnboundedSender<DatagramEvent>,
    raw_tx: mpsc::UnboundedSender<HandleEvent>,
    raw_rx: mpsc::UnboundedReceiver<HandleEvent>,
}

impl DatagramSocket {
    /// Create an unbound socket with a fresh handle.
    pub fn new(
        kind: DatagramKind,
        ctx: SocketContext,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DatagramEvent>)> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut socket = Self {
            ctx,
            kind,
            state: BindState::Unbound,
            handle_id: None,
            handle: None,
            send_queue: None,
            after_sends: VecDeque::new(),
            events,
            raw_tx,
            raw_rx,
        };
        let bind = DatagramBind {
            family: kind.family(),
            local: None,
        };
        socket.install(|ctx, adapter| ctx.factory().open_datagram(&bind, adapter))?;
        Ok((socket, events_rx))
    }

    /// Close the current handle, then open and install a new one.
    fn install<F>(&mut self, open: F) -> Result<()>
    where
        F: FnOnce(&SocketContext, HandleAdapter) -> Result<Box<dyn RawHandle>>,
    {
        if let Some(mut old) = self.handle.take() {
            trace!("Closing replaced handle {:?}", self.handle_id);
            old.close();
        }
        self.handle_id = None;
        let adapter = self.ctx.adapter(self.raw_tx.clone());
        let id = adapter.id();
        let handle = open(&self.ctx, adapter)?;
        self.handle_id = Some(id);
        self.handle = Some(handle);
        Ok(())
    }

    /// Bind to `address:port`. `port` 0 picks an ephemeral port and a missing
    /// address binds the wildcard of the socket's family. `Listening` follows
    /// once the handle reports the endpoint live.
    pub fn bind(&mut self, port: u16, address: Option<&str>) -> Result<()> {
        self.health_check()?;
        if self.state != BindState::Unbound {
            return Err(SocketError::validation("socket is already bound"));
        }
        let family = self.kind.family();
        self.state = BindState::Binding;

        let ip = match address {
            Some(host) => match self.ctx.resolver().lookup(host, family) {
                Ok(ip) => ip,
                Err(e) => {
                    warn!("Bind lookup for {} failed: {}", host, e);
                    self.state = BindState::Unbound;
                    self.emit(DatagramEvent::Error(e));
                    return Ok(());
                }
            },
            None => family.any(),
        };

        let bind = DatagramBind {
            family,
            local: Some(SocketAddr::new(ip, port)),
        };
        debug!("Binding {} socket to {}:{}", self.kind, ip, port);
        if let Err(e) = self.install(|ctx, adapter| ctx.factory().open_datagram(&bind, adapter)) {
            warn!("Bind failed: {}", e);
            self.state = BindState::Unbound;
            self.emit(DatagramEvent::Error(e));
        }
        Ok(())
    }

    /// Bind using a pre-built handle. Resolution is skipped and the socket is
    /// bound immediately.
    pub fn bind_handle<F>(&mut self, open: F) -> Result<()>
    where
        F: FnOnce(HandleAdapter) -> Result<Box<dyn RawHandle>>,
    {
        if self.state != BindState::Unbound {
            return Err(SocketError::validation("socket is already bound"));
        }
        self.install(|_, adapter| open(adapter))?;
        self.start_listening();
        Ok(())
    }

    fn start_listening(&mut self) {
        self.state = BindState::Bound;
        debug!("{} socket listening on {:?}", self.kind, self.local_addr());
        self.emit(DatagramEvent::Listening);
        if let Some(queue) = self.send_queue.take() {
            debug!("Flushing {} sends queued before bind", queue.len());
            for send in queue {
                self.transmit(send.data, send.port, send.address.as_deref(), send.completion);
            }
        }
    }

    /// Send `buffer[offset..offset + length]` to `address:port`.
    ///
    /// Argument errors are returned synchronously without any I/O. An unbound
    /// socket binds itself to an ephemeral port first and queues the send
    /// until it is listening.
    pub fn send(
        &mut self,
        buffer: impl Into<Bytes>,
        offset: usize,
        length: usize,
        port: u16,
        address: Option<&str>,
        completion: Completion,
    ) -> Result<()> {
        let buffer = buffer.into();
        if let Err(e) = validate_send(buffer.len(), offset, length, port)
            .and_then(|_| self.health_check())
        {
            completion.complete(Err(e.clone()));
            return Err(e);
        }

        let data = buffer.slice(offset..offset + length);
        if self.state == BindState::Unbound {
            self.bind(0, None)?;
        }
        if self.state == BindState::Bound {
            self.transmit(data, port, address, completion);
            return Ok(());
        }

        trace!("Queueing {} byte send until bound", data.len());
        self.send_queue.get_or_insert_with(VecDeque::new).push_back(QueuedSend {
            data,
            port,
            address: address.map(str::to_owned),
            completion,
        });
        Ok(())
    }

    fn transmit(&mut self, data: Bytes, port: u16, address: Option<&str>, completion: Completion) {
        let family = self.kind.family();
        let ip = match address {
            Some(host) => match self.ctx.resolver().lookup(host, family) {
                Ok(ip) => ip,
                Err(e) => {
                    completion.complete(Err(e.clone()));
                    self.emit(DatagramEvent::Error(e));
                    return;
                }
            },
            None => family.any(),
        };
        let Some(handle) = self.handle.as_mut() else {
            completion.complete(Err(SocketError::NotRunning));
            return;
        };

        let dest = SocketAddr::new(ip, port);
        let accepted = handle.send_to(&data, dest);
        trace!("Sent {} bytes to {} (accepted={})", data.len(), dest, accepted);
        if accepted && self.after_sends.is_empty() {
            completion.complete(Ok(()));
        } else {
            self.after_sends.push_back(completion);
        }
    }

    /// Close the socket. Fails with `NotRunning` when already closed.
    pub fn close(&mut self) -> Result<()> {
        self.health_check()?;
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        debug!("Closing {} socket {:?}", self.kind, self.handle_id);
        self.handle_id = None;
        self.state = BindState::Unbound;
        if let Some(queue) = self.send_queue.take() {
            for send in queue {
                send.completion.complete(Err(SocketError::Closed));
            }
        }
        for completion in self.after_sends.drain(..) {
            completion.complete(Err(SocketError::Closed));
        }
        self.emit(DatagramEvent::Close);
    }

    fn health_check(&self) -> Result<()> {
        if self.handle.is_none() {
            return Err(SocketError::NotRunning);
        }
        Ok(())
    }

    /// Dispatch one raw handle event.
    pub fn handle_event(&mut self, event: HandleEvent) {
        if self.handle_id != Some(event.handle) {
            trace!("Dropping {:?} from stale handle {}", event.kind, event.handle);
            return;
        }
        match event.kind {
            HandleEventKind::Open => {
                if self.state == BindState::Binding {
                    self.start_listening();
                } else {
                    trace!("Ignoring open event in state {:?}", self.state);
                }
            }
            HandleEventKind::Message { data, from } => {
                let from = RemoteInfo {
                    address: from.ip(),
                    port: from.port(),
                    size: data.len(),
                };
                self.emit(DatagramEvent::Message { data, from });
            }
            HandleEventKind::Data(data) => {
                warn!("Dropping {} stream bytes on datagram handle", data.len());
            }
            HandleEventKind::Drain => {
                for completion in self.after_sends.drain(..) {
                    completion.complete(Ok(()));
                }
            }
            HandleEventKind::Error(msg) => {
                self.emit(DatagramEvent::Error(SocketError::Transport(msg)));
            }
            HandleEventKind::Close => {
                debug!("Handle {} closed underneath socket", event.handle);
                self.teardown();
            }
            HandleEventKind::HalfClose => {}
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

    /// Bound local endpoint.
    pub fn address(&self) -> Result<SocketAddr> {
        self.health_check()?;
        self.local_addr()
            .ok_or_else(|| SocketError::validation("socket is not bound"))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().and_then(|h| h.local_addr())
    }

    /// SO_BROADCAST.
    pub fn set_broadcast(&mut self, enable: bool) -> Result<()> {
        self.set_option(SocketOption::Broadcast(enable))
    }

    /// Unicast TTL. Accepted and ignored.
    pub fn set_ttl(&mut self, _ttl: u32) -> Result<()> {
        Ok(())
    }

    /// Multicast TTL.
    pub fn set_multicast_ttl(&mut self, ttl: u32) -> Result<u32> {
        self.set_option(SocketOption::MulticastTtl(ttl))?;
        Ok(ttl)
    }

    /// Multicast loopback.
    pub fn set_multicast_loopback(&mut self, enable: bool) -> Result<bool> {
        self.set_option(SocketOption::MulticastLoopback(enable))?;
        Ok(enable)
    }

    /// Join multicast group `group`.
    pub fn add_membership(&mut self, group: &str, interface: Option<&str>) -> Result<()> {
        let (group, interface) = parse_membership(group, interface)?;
        self.set_option(SocketOption::AddMembership { group, interface })
    }

    /// Leave multicast group `group`.
    pub fn drop_membership(&mut self, group: &str, interface: Option<&str>) -> Result<()> {
        let (group, interface) = parse_membership(group, interface)?;
        self.set_option(SocketOption::DropMembership { group, interface })
    }

    fn set_option(&mut self, option: SocketOption) -> Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.set_option(option),
            None => Err(SocketError::NotRunning),
        }
    }

    /// Bind lifecycle state.
    pub fn state(&self) -> BindState {
        self.state
    }

    /// Socket type.
    pub fn kind(&self) -> DatagramKind {
        self.kind
    }

    /// Sends waiting for the socket to bind, if any.
    pub fn queued_sends(&self) -> Option<usize> {
        self.send_queue.as_ref().map(VecDeque::len)
    }

    /// Id of the current handle.
    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle_id
    }

    fn emit(&self, event: DatagramEvent) {
        if self.events.send(event).is_err() {
            trace!("Datagram event dropped, receiver is gone");
        }
    }
}

fn validate_send(len: usize, offset: usize, length: usize, port: u16) -> Result<()> {
    if offset >= len {
        return Err(SocketError::validation("offset into buffer too large"));
    }
    match offset.checked_add(length) {
        Some(end) if end <= len => {}
        _ => {
            return Err(SocketError::validation(
                "offset + length beyond buffer length",
            ))
        }
    }
    if port == 0 {
        return Err(SocketError::validation("port should be > 0 and < 65536"));
    }
    Ok(())
}

fn parse_membership(group: &str, interface: Option<&str>) -> Result<(IpAddr, Option<IpAddr>)> {
    if group.is_empty() {
        return Err(SocketError::validation("multicast address must be specified"));
    }
    let group = group
        .parse::<IpAddr>()
        .map_err(|_| SocketError::validation(format!("invalid multicast address {}", group)))?;
    let interface = interface
        .map(|i| {
            i.parse::<IpAddr>()
                .map_err(|_| SocketError::validation(format!("invalid interface address {}", i)))
        })
        .transpose()?;
    Ok((group, interface))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_handle::mem::{MemHandleCtl, MemTransport, StaticResolver};
    use bridge_handle::HandleFactory;
    use std::sync::{Arc, Mutex};

    struct Harness {
        transport: Arc<MemTransport>,
        socket: DatagramSocket,
        events: mpsc::UnboundedReceiver<DatagramEvent>,
    }

    impl Harness {
        fn new(transport: MemTransport) -> Self {
            let transport = Arc::new(transport);
            let resolver =
                StaticResolver::new().with_host("peer.test", "198.51.100.1".parse().unwrap());
            let ctx = SocketContext::new(transport.clone(), Arc::new(resolver));
            let (socket, events) = DatagramSocket::new(DatagramKind::Udp4, ctx).unwrap();
            Self {
                transport,
                socket,
                events,
            }
        }

        fn bound() -> (Self, MemHandleCtl) {
            let mut h = Self::new(MemTransport::with_auto_open());
            h.socket.bind(41234, None).unwrap();
            h.socket.poll_events();
            assert_eq!(h.drain_events(), vec![DatagramEvent::Listening]);
            let ctl = h.transport.last().unwrap();
            (h, ctl)
        }

        fn drain_events(&mut self) -> Vec<DatagramEvent> {
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
    fn test_kind_parse() {
        assert_eq!("udp6".parse::<DatagramKind>().unwrap(), DatagramKind::Udp6);
        assert!("tcp".parse::<DatagramKind>().unwrap_err().is_validation());
        assert_eq!(DatagramKind::Udp4.to_string(), "udp4");
    }

    #[test]
    fn test_send_validation_is_synchronous() {
        let mut h = Harness::new(MemTransport::new());
        let buf = Bytes::from_static(b"abcd");
        let cases = [(4, 0, 9), (0, 5, 9), (2, 3, 9), (0, 4, 0)];
        for (offset, length, port) in cases {
            let log = Arc::new(Mutex::new(Vec::new()));
            let err = h
                .socket
                .send(buf.clone(), offset, length, port, None, ordered(&log, 0))
                .unwrap_err();
            assert!(err.is_validation(), "{:?}", (offset, length, port));
            assert_eq!(*log.lock().unwrap(), vec![(0, Err(err))]);
        }
        assert_eq!(h.socket.state(), BindState::Unbound);
        assert_eq!(h.transport.handles().len(), 1);
        assert!(h.transport.last().unwrap().sent_to().is_empty());
    }

    #[test]
    fn test_zero_length_send_is_valid() {
        let (mut h, ctl) = Harness::bound();
        let log = Arc::new(Mutex::new(Vec::new()));
        h.socket
            .send(&b"abcd"[..], 1, 0, 9999, Some("198.51.100.1"), ordered(&log, 0))
            .unwrap();

        let sent = ctl.sent_to();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.is_empty());
        assert_eq!(sent[0].1, "198.51.100.1:9999".parse().unwrap());
        assert_eq!(*log.lock().unwrap(), vec![(0, Ok(()))]);
    }

    #[test]
    fn test_implicit_bind_queues_until_listening() {
        let mut h = Harness::new(MemTransport::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        h.socket
            .send(&b"first"[..], 0, 5, 9999, Some("198.51.100.1"), ordered(&log, 1))
            .unwrap();
        h.socket
            .send(&b"second"[..], 0, 6, 9999, Some("peer.test"), ordered(&log, 2))
            .unwrap();
        assert_eq!(h.socket.state(), BindState::Binding);
        assert_eq!(h.socket.queued_sends(), Some(2));

        let initial = h.transport.handles()[0].clone();
        let bound = h.transport.last().unwrap();
        assert!(initial.is_closed());
        assert!(bound.sent_to().is_empty());
        assert!(log.lock().unwrap().is_empty());

        bound.open();
        h.socket.poll_events();
        assert_eq!(h.drain_events(), vec![DatagramEvent::Listening]);
        assert_eq!(h.socket.state(), BindState::Bound);
        assert_eq!(h.socket.queued_sends(), None);

        let dest: SocketAddr = "198.51.100.1:9999".parse().unwrap();
        assert_eq!(
            bound.sent_to(),
            vec![
                (Bytes::from_static(b"first"), dest),
                (Bytes::from_static(b"second"), dest)
            ]
        );
        assert_eq!(*log.lock().unwrap(), vec![(1, Ok(())), (2, Ok(()))]);

        bound.open();
        h.socket.poll_events();
        assert!(h.drain_events().is_empty());
    }

    #[test]
    fn test_bind_twice_fails() {
        let (mut h, _ctl) = Harness::bound();
        assert!(h.socket.bind(1, None).unwrap_err().is_validation());
        assert_eq!(h.socket.address().unwrap().port(), 41234);
    }

    #[test]
    fn test_bind_lookup_failure_returns_to_unbound() {
        let mut h = Harness::new(MemTransport::new());
        h.socket.bind(0, Some("nowhere.test")).unwrap();
        assert_eq!(h.socket.state(), BindState::Unbound);
        assert!(matches!(
            h.drain_events().as_slice(),
            [DatagramEvent::Error(SocketError::Transport(_))]
        ));
    }

    #[test]
    fn test_bind_handle_listens_immediately() {
        let mut h = Harness::new(MemTransport::new());
        let factory = h.transport.clone();
        let bind = DatagramBind {
            family: AddressFamily::V4,
            local: Some("192.0.2.10:5353".parse().unwrap()),
        };
        h.socket
            .bind_handle(|adapter| factory.open_datagram(&bind, adapter))
            .unwrap();
        assert_eq!(h.socket.state(), BindState::Bound);
        assert_eq!(h.drain_events(), vec![DatagramEvent::Listening]);
        assert!(h.transport.handles()[0].is_closed());
    }

    #[test]
    fn test_blocked_sends_complete_in_order_on_drain() {
        let (mut h, ctl) = Harness::bound();
        let log = Arc::new(Mutex::new(Vec::new()));
        ctl.set_blocked(true);
        h.socket
            .send(&b"a"[..], 0, 1, 7, Some("peer.test"), ordered(&log, 1))
            .unwrap();
        ctl.set_blocked(false);
        h.socket
            .send(&b"b"[..], 0, 1, 7, Some("peer.test"), ordered(&log, 2))
            .unwrap();
        assert!(log.lock().unwrap().is_empty());

        ctl.drain();
        h.socket.poll_events();
        assert_eq!(*log.lock().unwrap(), vec![(1, Ok(())), (2, Ok(()))]);
    }

    #[test]
    fn test_message_carries_remote_info() {
        let (mut h, ctl) = Harness::bound();
        ctl.deliver_from(b"pong", "198.51.100.1:9999".parse().unwrap());
        h.socket.poll_events();
        assert_eq!(
            h.drain_events(),
            vec![DatagramEvent::Message {
                data: Bytes::from_static(b"pong"),
                from: RemoteInfo {
                    address: "198.51.100.1".parse().unwrap(),
                    port: 9999,
                    size: 4
                }
            }]
        );
    }

    #[test]
    fn test_close_fails_queue_and_second_close() {
        let mut h = Harness::new(MemTransport::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        h.socket
            .send(&b"x"[..], 0, 1, 9, None, ordered(&log, 1))
            .unwrap();
        h.socket.close().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![(1, Err(SocketError::Closed))]);
        assert_eq!(h.drain_events(), vec![DatagramEvent::Close]);
        assert_eq!(h.socket.close(), Err(SocketError::NotRunning));
        assert_eq!(h.socket.address(), Err(SocketError::NotRunning));

        let err = h
            .socket
            .send(&b"y"[..], 0, 1, 9, None, ordered(&log, 2))
            .unwrap_err();
        assert_eq!(err, SocketError::NotRunning);
        assert_eq!(log.lock().unwrap()[1], (2, Err(SocketError::NotRunning)));
    }

    #[test]
    fn test_multicast_options() {
        let (mut h, ctl) = Harness::bound();
        h.socket.set_broadcast(true).unwrap();
        assert_eq!(h.socket.set_multicast_ttl(4).unwrap(), 4);
        assert!(h.socket.set_multicast_loopback(false).is_ok());
        h.socket.add_membership("239.1.2.3", None).unwrap();
        h.socket
            .drop_membership("239.1.2.3", Some("192.0.2.1"))
            .unwrap();
        assert!(h.socket.add_membership("", None).unwrap_err().is_validation());
        h.socket.set_ttl(64).unwrap();

        let group: IpAddr = "239.1.2.3".parse().unwrap();
        assert_eq!(
            ctl.options(),
            vec![
                SocketOption::Broadcast(true),
                SocketOption::MulticastTtl(4),
                SocketOption::MulticastLoopback(false),
                SocketOption::AddMembership {
                    group,
                    interface: None
                },
                SocketOption::DropMembership {
                    group,
                    interface: Some("192.0.2.1".parse().unwrap())
                },
            ]
        );
    }

    #[test]
    fn test_handle_error_and_close_events() {
        let (mut h, ctl) = Harness::bound();
        ctl.error("icmp unreachable");
        ctl.close_remote();
        h.socket.poll_events();
        assert_eq!(
            h.drain_events(),
            vec![
                DatagramEvent::Error(SocketError::Transport("icmp unreachable".into())),
                DatagramEvent::Close
            ]
        );
        assert_eq!(h.socket.close(), Err(SocketError::NotRunning));
    }

    #[tokio::test]
    async fn test_send_completion_channel() {
        let (mut h, _ctl) = Harness::bound();
        let (done, rx) = Completion::channel();
        h.socket
            .send(&b"hello"[..], 1, 3, 53, Some("peer.test"), done)
            .unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(
            h.transport.last().unwrap().sent_to()[0].0,
            Bytes::from_static(b"ell")
        );
    }
}
