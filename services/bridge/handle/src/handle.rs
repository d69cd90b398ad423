//! Raw handle surface and the capabilities sockets are built from.

use crate::error::{Result, SocketError};
use crate::event::{HandleAdapter, HandleEventSink, HandleId};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Address family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    /// IPv4
    #[default]
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// Loopback address of this family.
    pub fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// Wildcard address of this family.
    pub fn any(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Whether `ip` belongs to this family.
    pub fn matches(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_))
        )
    }
}

/// Option forwarded verbatim to the primitive
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketOption {
    /// Disable Nagle
    NoDelay(bool),
    /// TCP keepalive
    KeepAlive {
        /// Enabled
        enable: bool,
        /// Idle time before the first probe
        initial_delay: Duration,
    },
    /// SO_BROADCAST
    Broadcast(bool),
    /// IP_MULTICAST_TTL
    MulticastTtl(u32),
    /// IP_MULTICAST_LOOP
    MulticastLoopback(bool),
    /// Join a multicast group
    AddMembership {
        /// Group address
        group: IpAddr,
        /// Local interface
        interface: Option<IpAddr>,
    },
    /// Leave a multicast group
    DropMembership {
        /// Group address
        group: IpAddr,
        /// Local interface
        interface: Option<IpAddr>,
    },
}

/// Method surface of one primitive socket.
///
/// `send`/`send_to` return `false` when the primitive accepted the bytes but
/// its buffer is now saturated; a drain event follows once it empties.
pub trait RawHandle: Send {
    /// Queue stream bytes.
    fn send(&mut self, data: &[u8]) -> bool;
    /// Queue a datagram.
    fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> bool;
    /// Stop delivering inbound data.
    fn suspend(&mut self) -> Result<()>;
    /// Resume delivering inbound data.
    fn resume(&mut self);
    /// Half-close the sending direction.
    fn shutdown(&mut self);
    /// Release the resource.
    fn close(&mut self);
    /// Apply a socket option.
    fn set_option(&mut self, option: SocketOption) -> Result<()>;
    /// Bound local endpoint.
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Connected peer.
    fn peer_addr(&self) -> Option<SocketAddr>;
    /// Bytes accepted but not yet transmitted.
    fn buffered_amount(&self) -> usize;
    /// Whether the handle has been closed.
    fn is_closed(&self) -> bool;
}

/// Connection target for a stream handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamTarget {
    /// Host name or literal; the primitive resolves it
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Requested family
    pub family: AddressFamily,
}

/// Bind request for a datagram handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramBind {
    /// Family of the handle
    pub family: AddressFamily,
    /// Endpoint to bind; `None` opens an unbound handle
    pub local: Option<SocketAddr>,
}

/// Opens primitive handles.
pub trait HandleFactory: Send + Sync {
    /// Start connecting a stream handle. Completion arrives as an open event.
    fn open_stream(
        &self,
        target: &StreamTarget,
        adapter: HandleAdapter,
    ) -> Result<Box<dyn RawHandle>>;

    /// Open a datagram handle. A bound handle reports an open event once the
    /// endpoint is live.
    fn open_datagram(
        &self,
        bind: &DatagramBind,
        adapter: HandleAdapter,
    ) -> Result<Box<dyn RawHandle>>;
}

/// Name resolution capability.
pub trait Resolver: Send + Sync {
    /// Resolve `host` to one address of `family`.
    fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr>;
}

/// Resolver backed by the operating system
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn lookup(&self, host: &str, family: AddressFamily) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if family.matches(&ip) {
                Ok(ip)
            } else {
                Err(SocketError::validation(format!(
                    "address {} does not match family {:?}",
                    ip, family
                )))
            };
        }

        let addrs = (host, 0)
            .to_socket_addrs()
            .map_err(|e| SocketError::Transport(format!("lookup {} failed: {}", host, e)))?;
        let found = addrs.map(|a| a.ip()).find(|ip| family.matches(ip));
        debug!("Resolved {} ({:?}) -> {:?}", host, family, found);
        found.ok_or_else(|| {
            SocketError::Transport(format!("lookup {} returned no {:?} address", host, family))
        })
    }
}

/// Capabilities a socket is constructed with.
///
/// Cloning shares the factory, the resolver and the handle id counter.
#[derive(Clone)]
pub struct SocketContext {
    factory: Arc<dyn HandleFactory>,
    resolver: Arc<dyn Resolver>,
    next_id: Arc<AtomicU64>,
}

impl SocketContext {
    /// Build a context from explicit collaborators.
    pub fn new(factory: Arc<dyn HandleFactory>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            factory,
            resolver,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Build a context using [`SystemResolver`].
    pub fn with_system_resolver(factory: Arc<dyn HandleFactory>) -> Self {
        Self::new(factory, Arc::new(SystemResolver))
    }

    /// Handle factory.
    pub fn factory(&self) -> &dyn HandleFactory {
        self.factory.as_ref()
    }

    /// Resolver.
    pub fn resolver(&self) -> &dyn Resolver {
        self.resolver.as_ref()
    }

    /// Allocate a fresh handle id and an adapter forwarding into `sink`.
    pub fn adapter(&self, sink: HandleEventSink) -> HandleAdapter {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        HandleAdapter::new(id, sink)
    }
}

impl fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketContext")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
