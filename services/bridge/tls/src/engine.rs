//! Handshake/record engine interface and certificate policies.
//!
//! The wrapper never touches key material. It drives a [`TlsEngine`] through
//! four calls and reacts to the [`EngineEvent`]s each call produces, in order.

use crate::error::TlsError;
use bytes::Bytes;
use std::fmt;

/// Side of the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates the handshake
    Client,
    /// Answers the handshake
    Server,
}

/// Callback produced by an engine step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A handshake (initial or renegotiation) finished
    HandshakeComplete,
    /// Decrypted application bytes
    Plaintext(Bytes),
    /// Record bytes to put on the wire
    Ciphertext(Bytes),
    /// Session closed (close_notify sent or received)
    Closed,
    /// Fatal engine error
    Error(String),
}

/// Sans-IO TLS session.
pub trait TlsEngine: Send {
    /// Start the handshake, optionally resuming a previous session.
    fn handshake(&mut self, resumption: Option<&[u8]>) -> Vec<EngineEvent>;
    /// Feed raw bytes received from the wire.
    fn process_incoming(&mut self, data: &[u8]) -> Vec<EngineEvent>;
    /// Encrypt application bytes.
    fn encode_outgoing(&mut self, data: &[u8]) -> Vec<EngineEvent>;
    /// Send close_notify and close the session.
    fn close(&mut self) -> Vec<EngineEvent>;
    /// Whether a handshake is still in progress.
    fn is_handshaking(&self) -> bool;
}

/// Parameters for one session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParams {
    /// Client or server
    pub role: Role,
    /// Name the peer certificate is checked against (client side)
    pub server_name: Option<String>,
}

impl SessionParams {
    /// Client session for `server_name`.
    pub fn client(server_name: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            server_name: Some(server_name.into()),
        }
    }

    /// Server session.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            server_name: None,
        }
    }
}

/// Factory for engine sessions sharing one configuration.
pub trait TlsContext: Send + Sync {
    /// Create a session.
    fn create_session(&self, params: &SessionParams) -> Result<Box<dyn TlsEngine>, TlsError>;
}

/// Outcome of a certificate check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Chain accepted
    Trusted,
    /// Chain rejected, with the reason
    Rejected(String),
}

/// Decides whether a presented certificate chain is trusted.
///
/// `chain` holds DER certificates, end entity first.
pub trait CertificatePolicy: Send + Sync + fmt::Debug {
    /// Check `chain` presented for `server_name`.
    fn verify(&self, chain: &[&[u8]], server_name: Option<&str>) -> Verdict;
}

/// Rejects every chain. Used until a policy is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectUnconfigured;

impl CertificatePolicy for RejectUnconfigured {
    fn verify(&self, _chain: &[&[u8]], _server_name: Option<&str>) -> Verdict {
        Verdict::Rejected("no certificate policy configured".to_string())
    }
}

/// Accepts every chain. Only for tests and closed networks.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustAll;

impl CertificatePolicy for TrustAll {
    fn verify(&self, _chain: &[&[u8]], _server_name: Option<&str>) -> Verdict {
        Verdict::Trusted
    }
}

/// Accepts chains whose end-entity certificate is one of a fixed set.
#[derive(Clone, Debug, Default)]
pub struct PinnedCertificates {
    leaves: Vec<Vec<u8>>,
}

impl PinnedCertificates {
    /// Pin the given DER certificates.
    pub fn new(leaves: Vec<Vec<u8>>) -> Self {
        Self { leaves }
    }

    /// Number of pinned certificates.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// No certificates pinned.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl CertificatePolicy for PinnedCertificates {
    fn verify(&self, chain: &[&[u8]], _server_name: Option<&str>) -> Verdict {
        match chain.first() {
            None => Verdict::Rejected("peer presented no certificate".to_string()),
            Some(leaf) if self.leaves.iter().any(|p| p.as_slice() == *leaf) => Verdict::Trusted,
            Some(_) => Verdict::Rejected("certificate is not pinned".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_rejects() {
        assert!(matches!(
            RejectUnconfigured.verify(&[&b"cert"[..]], Some("example.test")),
            Verdict::Rejected(_)
        ));
        assert_eq!(TrustAll.verify(&[], None), Verdict::Trusted);
    }

    #[test]
    fn test_pinned_matches_leaf_only() {
        let pins = PinnedCertificates::new(vec![b"leaf-a".to_vec()]);
        assert_eq!(pins.verify(&[&b"leaf-a"[..], &b"ca"[..]], None), Verdict::Trusted);
        assert!(matches!(
            pins.verify(&[&b"ca"[..], &b"leaf-a"[..]], None),
            Verdict::Rejected(_)
        ));
        assert!(matches!(pins.verify(&[], None), Verdict::Rejected(_)));
        assert_eq!(pins.len(), 1);
    }
}
