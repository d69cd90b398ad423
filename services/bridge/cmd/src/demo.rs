//! Scripted runs of each socket layer over the in-memory primitive.
//!
//! Every run plays the remote side through a [`MemHandleCtl`] and reports
//! what crossed the wire and which events the application saw.

use crate::config::{BridgeConfig, TlsSettings, TrustPolicy};
use crate::{component_debug, component_info, component_warn};
use anyhow::{bail, Context, Result};
use bridge_dgram::{BindState, DatagramEvent, DatagramSocket};
use bridge_handle::mem::{MemHandleCtl, MemTransport, StaticResolver};
use bridge_handle::{Completion, SocketContext, SocketError};
use bridge_stream::{ConnectOptions, ConnectionState, ReadOutcome, Socket, SocketEvent};
use bridge_tls::testing::{ScriptedContext, ScriptedEngine};
use bridge_tls::{
    CertificatePolicy, EngineEvent, PinnedCertificates, RejectUnconfigured, SessionParams,
    TlsEngine, TlsEvent, TlsOptions, TlsSocket, TrustAll,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const DEMO_CERT: &[u8] = b"sockbridge demo certificate";
const READ_CHUNK: usize = 4096;

fn memory_context(transport: &Arc<MemTransport>) -> SocketContext {
    SocketContext::new(transport.clone(), Arc::new(StaticResolver::new()))
}

fn connect_options(config: &BridgeConfig) -> ConnectOptions {
    ConnectOptions {
        host: Some(config.stream.host.clone()),
        port: config.stream.port,
        family: config.stream.family(),
    }
}

/// Outcome of the stream run
#[derive(Debug)]
pub struct StreamReport {
    pub sent: Vec<u8>,
    pub received: Vec<u8>,
    pub events: Vec<SocketEvent>,
    pub final_state: ConnectionState,
}

/// Connect, write before the connection opens, read the peer's reply and
/// half-close from both ends.
pub async fn run_stream(config: &BridgeConfig, keep_alive: Duration) -> Result<StreamReport> {
    let transport = Arc::new(MemTransport::new());
    let (mut socket, mut events) = Socket::new(memory_context(&transport), config.socket.clone());
    socket.connect(connect_options(config))?;
    let remote = transport.last().context("connect did not open a handle")?;

    let (written, written_rx) = Completion::channel();
    socket.write(&b"hello from sockbridge"[..], written)?;
    component_info!(
        "stream",
        "Connecting to {}:{} with a write pending: {}",
        config.stream.host,
        config.stream.port,
        socket.pending_connect_write()
    );

    remote.open();
    socket.process_next().await;
    written_rx.await.context("write completion dropped")??;
    socket.set_no_delay(true)?;
    socket.set_keep_alive(true, keep_alive)?;

    remote.deliver(b"hello back");
    remote.half_close();
    socket.poll_events();

    let mut received = Vec::new();
    while let ReadOutcome::Data(chunk) = socket.read(READ_CHUNK) {
        received.extend_from_slice(&chunk);
    }
    socket.end();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        component_debug!("stream", "Event {:?}", event);
        seen.push(event);
    }
    component_info!(
        "stream",
        "Wrote {} bytes, read {} bytes, final state {:?}",
        socket.bytes_written(),
        socket.bytes_read(),
        socket.state()
    );

    Ok(StreamReport {
        sent: remote.sent_bytes(),
        received,
        events: seen,
        final_state: socket.state(),
    })
}

/// Outcome of the datagram run
#[derive(Debug)]
pub struct DatagramReport {
    pub local: SocketAddr,
    pub sent: Vec<(Bytes, SocketAddr)>,
    pub events: Vec<DatagramEvent>,
}

/// Send on an unbound socket so the sends queue behind the implicit bind,
/// then receive one reply.
pub async fn run_datagram(config: &BridgeConfig) -> Result<DatagramReport> {
    let kind = config.datagram.socket_kind()?;
    let transport = Arc::new(MemTransport::with_auto_open());
    let (mut socket, mut events) = DatagramSocket::new(kind, memory_context(&transport))?;

    let mut pending = Vec::new();
    for payload in ["first", "second", "third"] {
        let (done, rx) = Completion::channel();
        socket.send(
            Bytes::from_static(payload.as_bytes()),
            0,
            payload.len(),
            config.datagram.port,
            Some(config.datagram.host.as_str()),
            done,
        )?;
        pending.push(rx);
    }
    component_info!(
        "dgram",
        "{} sends queued behind the implicit bind",
        socket.queued_sends().unwrap_or(0)
    );

    socket.poll_events();
    if socket.state() != BindState::Bound {
        bail!("{} socket did not bind (state {:?})", kind, socket.state());
    }
    for rx in pending {
        rx.await.context("send completion dropped")??;
    }

    let remote = transport.last().context("bind did not open a handle")?;
    let sent = remote.sent_to();
    if let Some((_, dest)) = sent.first() {
        remote.deliver_from(b"pong", *dest);
    }
    socket.poll_events();
    let local = socket.address()?;
    socket.close()?;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        component_debug!("dgram", "Event {:?}", event);
        seen.push(event);
    }
    component_info!("dgram", "Bound {} at {}, sent {} datagrams", kind, local, sent.len());

    Ok(DatagramReport {
        local,
        sent,
        events: seen,
    })
}

/// Outcome of the TLS run
#[derive(Debug)]
pub struct TlsReport {
    pub secure: bool,
    pub handshakes: u32,
    pub write_result: std::result::Result<(), SocketError>,
    pub server_received: Vec<u8>,
    pub client_received: Vec<u8>,
    pub events: Vec<TlsEvent>,
}

fn trust_policy(settings: &TlsSettings) -> Result<Arc<dyn CertificatePolicy>> {
    Ok(match settings.policy {
        TrustPolicy::Reject => Arc::new(RejectUnconfigured),
        TrustPolicy::TrustAll => Arc::new(TrustAll),
        TrustPolicy::Pinned => {
            let pins = match &settings.pinned_pem {
                Some(path) => load_pinned(path)?,
                None => vec![DEMO_CERT.to_vec()],
            };
            Arc::new(PinnedCertificates::new(pins))
        }
    })
}

#[cfg(feature = "tls")]
fn load_pinned(path: &std::path::Path) -> Result<Vec<Vec<u8>>> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pinned certificates from {:?}", path))?;
    Ok(bridge_tls::rustls_engine::load_pem_certificates(&pem)?)
}

#[cfg(not(feature = "tls"))]
fn load_pinned(path: &std::path::Path) -> Result<Vec<Vec<u8>>> {
    bail!(
        "Pinned PEM {:?} requested but not compiled with TLS support. Build with --features tls",
        path
    )
}

// Feed the client's records to the server engine; returns the plaintext the
// server decrypted.
fn exchange(remote: &MemHandleCtl, server: &mut ScriptedEngine) -> Vec<u8> {
    let mut plaintext = Vec::new();
    for chunk in remote.take_sent() {
        for event in server.process_incoming(&chunk) {
            match event {
                EngineEvent::Ciphertext(record) => remote.deliver(&record),
                EngineEvent::Plaintext(data) => plaintext.extend_from_slice(&data),
                _ => {}
            }
        }
    }
    plaintext
}

/// Handshake against a scripted server, send a request before the handshake
/// finishes, read the response and close with close_notify.
pub async fn run_tls(config: &BridgeConfig) -> Result<TlsReport> {
    let transport = Arc::new(MemTransport::new());
    let tls_ctx = ScriptedContext::new(trust_policy(&config.tls)?, Bytes::new());
    let (mut tls, mut events) = TlsSocket::connect(
        memory_context(&transport),
        config.socket.clone(),
        &tls_ctx,
        connect_options(config),
        TlsOptions::client(config.tls.server_name.clone()),
    )?;
    let remote = transport.last().context("connect did not open a handle")?;
    let mut server = ScriptedEngine::new(
        &SessionParams::server(),
        Arc::new(TrustAll),
        Bytes::from_static(DEMO_CERT),
    );

    remote.open();
    tls.process_next().await;
    let (written, written_rx) = Completion::channel();
    tls.write(&b"GET / HTTP/1.1\r\n\r\n"[..], written)?;

    let mut server_received = exchange(&remote, &mut server);
    tls.pump();
    server_received.extend(exchange(&remote, &mut server));

    let mut client_received = Vec::new();
    if tls.is_authorized() {
        for event in server.encode_outgoing(b"HTTP/1.1 204 No Content\r\n\r\n") {
            if let EngineEvent::Ciphertext(record) = event {
                remote.deliver(&record);
            }
        }
        tls.pump();
        while let ReadOutcome::Data(chunk) = tls.read(READ_CHUNK) {
            client_received.extend_from_slice(&chunk);
        }
        tls.end();
        tls.pump();
        exchange(&remote, &mut server);
    } else {
        component_warn!(
            "tls",
            "Handshake with {} failed: {:?}",
            config.tls.server_name,
            tls.authorization_error()
        );
        tls.destroy();
    }
    let write_result = written_rx.await.unwrap_or(Err(SocketError::Closed));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        component_debug!("tls", "Event {:?}", event);
        seen.push(event);
    }
    component_info!(
        "tls",
        "Session with {}: authorized={}, handshakes={}",
        config.tls.server_name,
        tls.is_authorized(),
        tls.handshakes()
    );

    Ok(TlsReport {
        secure: seen.contains(&TlsEvent::SecureConnect),
        handshakes: tls.handshakes(),
        write_result,
        server_received,
        client_received,
        events: seen,
    })
}
