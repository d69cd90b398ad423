//! `TlsEngine` backed by rustls, driven sans-IO through `rustls::Connection`.

use crate::engine::{
    CertificatePolicy, EngineEvent, Role, SessionParams, TlsContext, TlsEngine, Verdict,
};
use crate::error::TlsError;
use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, ServerConfig,
    ServerConnection, SignatureScheme,
};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, trace};

const PLAINTEXT_CHUNK: usize = 16 * 1024;

/// Parse every certificate in a PEM bundle into DER.
pub fn load_pem_certificates(pem: &str) -> Result<Vec<Vec<u8>>, TlsError> {
    let certs = parse_certs(pem)?;
    Ok(certs.into_iter().map(|c| c.as_ref().to_vec()).collect())
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TlsError::Config("no certificates found".to_string()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::Config(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::Config("no private key found".to_string()))
}

/// Hands server certificates to a [`CertificatePolicy`]. Handshake
/// signatures are still checked with the provider's algorithms.
#[derive(Debug)]
struct PolicyVerifier {
    policy: Arc<dyn CertificatePolicy>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain: Vec<&[u8]> = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref());
        chain.extend(intermediates.iter().map(|c| c.as_ref()));

        let name = match server_name {
            ServerName::DnsName(dns) => Some(dns.as_ref().to_owned()),
            _ => None,
        };
        match self.policy.verify(&chain, name.as_deref()) {
            Verdict::Trusted => Ok(ServerCertVerified::assertion()),
            Verdict::Rejected(reason) => {
                debug!("Server certificate rejected: {}", reason);
                Err(rustls::Error::General(reason))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// rustls client and/or server configuration
#[derive(Clone, Default)]
pub struct RustlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl RustlsContext {
    /// Client-only context verifying servers with `policy`.
    pub fn client(policy: Arc<dyn CertificatePolicy>) -> Result<Self, TlsError> {
        Self::default().with_client(policy)
    }

    /// Server-only context presenting the given PEM chain and key.
    pub fn server(cert_chain_pem: &str, private_key_pem: &str) -> Result<Self, TlsError> {
        Self::default().with_server(cert_chain_pem, private_key_pem)
    }

    /// Add a client configuration.
    pub fn with_client(mut self, policy: Arc<dyn CertificatePolicy>) -> Result<Self, TlsError> {
        info!("Creating TLS client configuration with {:?}", policy);
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(PolicyVerifier {
            policy,
            provider: provider.clone(),
        });
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        self.client = Some(Arc::new(config));
        Ok(self)
    }

    /// Add a server configuration.
    pub fn with_server(
        mut self,
        cert_chain_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self, TlsError> {
        info!("Creating TLS server configuration");
        let certs = parse_certs(cert_chain_pem)?;
        let key = parse_private_key(private_key_pem)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server certificate: {}", e)))?;
        self.server = Some(Arc::new(config));
        Ok(self)
    }
}

impl TlsContext for RustlsContext {
    fn create_session(&self, params: &SessionParams) -> Result<Box<dyn TlsEngine>, TlsError> {
        let conn: Connection = match params.role {
            Role::Client => {
                let config = self.client.clone().ok_or_else(|| {
                    TlsError::Config("context has no client configuration".to_string())
                })?;
                let name = params.server_name.clone().ok_or_else(|| {
                    TlsError::Config("client session needs a server name".to_string())
                })?;
                let name = ServerName::try_from(name)
                    .map_err(|e| TlsError::Config(format!("invalid server name: {}", e)))?;
                ClientConnection::new(config, name)
                    .map_err(|e| TlsError::Engine(e.to_string()))?
                    .into()
            }
            Role::Server => {
                let config = self.server.clone().ok_or_else(|| {
                    TlsError::Config("context has no server configuration".to_string())
                })?;
                ServerConnection::new(config)
                    .map_err(|e| TlsError::Engine(e.to_string()))?
                    .into()
            }
        };
        Ok(Box::new(RustlsEngine::new(conn)))
    }
}

/// One rustls session
pub struct RustlsEngine {
    conn: Connection,
    established: bool,
    peer_closed: bool,
    closed: bool,
    failed: bool,
}

impl RustlsEngine {
    /// Wrap a fresh connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            established: false,
            peer_closed: false,
            closed: false,
            failed: false,
        }
    }

    // Handshake transition first, then any plaintext that became readable.
    fn collect(&mut self, out: &mut Vec<EngineEvent>) {
        if !self.established && !self.conn.is_handshaking() {
            self.established = true;
            out.push(EngineEvent::HandshakeComplete);
        }
        let mut buf = vec![0u8; PLAINTEXT_CHUNK];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => out.push(EngineEvent::Plaintext(Bytes::copy_from_slice(&buf[..n]))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Peer closed without close_notify: {}", e);
                    self.peer_closed = true;
                    break;
                }
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<EngineEvent>) {
        let mut wire = Vec::new();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut wire) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    out.push(EngineEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        if !wire.is_empty() {
            trace!("rustls produced {} bytes of records", wire.len());
            out.push(EngineEvent::Ciphertext(Bytes::from(wire)));
        }
    }

    fn fail(&mut self, err: impl ToString, out: &mut Vec<EngineEvent>) {
        self.failed = true;
        self.flush(out);
        out.push(EngineEvent::Error(err.to_string()));
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake(&mut self, resumption: Option<&[u8]>) -> Vec<EngineEvent> {
        if resumption.is_some() {
            debug!("rustls resumes from its own session cache; ignoring explicit id");
        }
        let mut out = Vec::new();
        self.flush(&mut out);
        out
    }

    fn process_incoming(&mut self, data: &[u8]) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        if self.failed || self.closed {
            return out;
        }
        let mut rd = data;
        while !rd.is_empty() {
            match self.conn.read_tls(&mut rd) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.fail(e, &mut out);
                    return out;
                }
            }
            if let Err(e) = self.conn.process_new_packets() {
                self.fail(e, &mut out);
                return out;
            }
            self.collect(&mut out);
        }
        self.flush(&mut out);
        if self.peer_closed && !self.closed {
            self.closed = true;
            self.conn.send_close_notify();
            self.flush(&mut out);
            out.push(EngineEvent::Closed);
        }
        out
    }

    fn encode_outgoing(&mut self, data: &[u8]) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        if self.failed || self.closed {
            out.push(EngineEvent::Error("session is closed".to_string()));
            return out;
        }
        if let Err(e) = self.conn.writer().write_all(data) {
            self.fail(e, &mut out);
            return out;
        }
        self.flush(&mut out);
        out
    }

    fn close(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }
        self.closed = true;
        if !self.failed {
            self.conn.send_close_notify();
            self.flush(&mut out);
        }
        out.push(EngineEvent::Closed);
        out
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }
}
