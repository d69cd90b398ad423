//! Deterministic engine for tests and demos.
//!
//! Records are framed as `[type: u8][len: u32 BE][payload]`. There is no
//! cryptography: the server's hello carries its "certificate", which the
//! client runs through the configured [`CertificatePolicy`].

use crate::engine::{
    CertificatePolicy, EngineEvent, Role, SessionParams, TlsContext, TlsEngine, Verdict,
};
use crate::error::TlsError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

const HEADER_LEN: usize = 5;

/// Largest application data payload carried by one record
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

fn push_data_records(data: &[u8], out: &mut Vec<EngineEvent>) {
    if data.is_empty() {
        out.push(EngineEvent::Ciphertext(encode_record(RecordType::Data, data)));
    }
    for chunk in data.chunks(MAX_RECORD_PAYLOAD) {
        out.push(EngineEvent::Ciphertext(encode_record(RecordType::Data, chunk)));
    }
}

/// Record type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Alert carrying a reason string
    Alert = 0x14,
    /// close_notify
    Close = 0x15,
    /// Handshake hello
    Hello = 0x16,
    /// Application data
    Data = 0x17,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x14 => Some(RecordType::Alert),
            0x15 => Some(RecordType::Close),
            0x16 => Some(RecordType::Hello),
            0x17 => Some(RecordType::Data),
            _ => None,
        }
    }
}

/// Frame one record. Payloads must fit the u32 length field; application
/// data is split at [`MAX_RECORD_PAYLOAD`] before it gets here.
pub fn encode_record(kind: RecordType, payload: &[u8]) -> Bytes {
    debug_assert!(u32::try_from(payload.len()).is_ok(), "record payload too long");
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split every complete record off the front of `buf`.
pub fn decode_records(buf: &mut BytesMut) -> Vec<(u8, Bytes)> {
    let mut out = Vec::new();
    while buf.len() >= HEADER_LEN {
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < HEADER_LEN + len {
            break;
        }
        let tag = buf.get_u8();
        buf.advance(4);
        out.push((tag, buf.split_to(len).freeze()));
    }
    out
}

/// Scripted handshake/record engine
#[derive(Debug)]
pub struct ScriptedEngine {
    role: Role,
    server_name: Option<String>,
    policy: Arc<dyn CertificatePolicy>,
    certificate: Bytes,
    inbound: BytesMut,
    handshaking: bool,
    pending: Vec<Bytes>,
    close_sent: bool,
    closed: bool,
    failed: bool,
}

impl ScriptedEngine {
    /// Engine for `params`, presenting `certificate` when acting as server.
    pub fn new(
        params: &SessionParams,
        policy: Arc<dyn CertificatePolicy>,
        certificate: Bytes,
    ) -> Self {
        Self {
            role: params.role,
            server_name: params.server_name.clone(),
            policy,
            certificate,
            inbound: BytesMut::new(),
            handshaking: true,
            pending: Vec::new(),
            close_sent: false,
            closed: false,
            failed: false,
        }
    }

    fn finish_handshake(&mut self, out: &mut Vec<EngineEvent>) {
        let first = self.handshaking;
        self.handshaking = false;
        out.push(EngineEvent::HandshakeComplete);
        if first {
            for data in std::mem::take(&mut self.pending) {
                push_data_records(&data, out);
            }
        }
    }

    fn fail(&mut self, reason: String, out: &mut Vec<EngineEvent>) {
        self.failed = true;
        out.push(EngineEvent::Ciphertext(encode_record(
            RecordType::Alert,
            reason.as_bytes(),
        )));
        out.push(EngineEvent::Error(reason));
    }

    fn on_record(&mut self, tag: u8, payload: Bytes, out: &mut Vec<EngineEvent>) {
        match RecordType::from_u8(tag) {
            Some(RecordType::Hello) => match self.role {
                Role::Server => {
                    out.push(EngineEvent::Ciphertext(encode_record(
                        RecordType::Hello,
                        &self.certificate,
                    )));
                    self.finish_handshake(out);
                }
                Role::Client => {
                    let chain = [payload.as_ref()];
                    match self.policy.verify(&chain, self.server_name.as_deref()) {
                        Verdict::Trusted => self.finish_handshake(out),
                        Verdict::Rejected(reason) => {
                            self.fail(format!("certificate rejected: {}", reason), out)
                        }
                    }
                }
            },
            Some(RecordType::Data) if self.handshaking => {
                self.fail("unexpected application data during handshake".to_string(), out)
            }
            Some(RecordType::Data) => out.push(EngineEvent::Plaintext(payload)),
            Some(RecordType::Close) => {
                if !self.close_sent {
                    self.close_sent = true;
                    out.push(EngineEvent::Ciphertext(encode_record(RecordType::Close, &[])));
                }
                self.closed = true;
                out.push(EngineEvent::Closed);
            }
            Some(RecordType::Alert) => {
                self.failed = true;
                out.push(EngineEvent::Error(
                    String::from_utf8_lossy(&payload).into_owned(),
                ));
            }
            None => self.fail(format!("unknown record type {:#04x}", tag), out),
        }
    }
}

impl TlsEngine for ScriptedEngine {
    fn handshake(&mut self, resumption: Option<&[u8]>) -> Vec<EngineEvent> {
        match self.role {
            Role::Client => {
                debug!("Scripted client hello (resumption: {})", resumption.is_some());
                let hello = resumption.unwrap_or(b"client-hello");
                vec![EngineEvent::Ciphertext(encode_record(RecordType::Hello, hello))]
            }
            Role::Server => Vec::new(),
        }
    }

    fn process_incoming(&mut self, data: &[u8]) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        if self.closed || self.failed {
            return out;
        }
        self.inbound.extend_from_slice(data);
        for (tag, payload) in decode_records(&mut self.inbound) {
            trace!("Scripted record {:#04x} ({} bytes)", tag, payload.len());
            self.on_record(tag, payload, &mut out);
            if self.closed || self.failed {
                break;
            }
        }
        out
    }

    fn encode_outgoing(&mut self, data: &[u8]) -> Vec<EngineEvent> {
        if self.closed || self.failed {
            return vec![EngineEvent::Error("session is closed".to_string())];
        }
        if self.handshaking {
            self.pending.push(Bytes::copy_from_slice(data));
            return Vec::new();
        }
        let mut out = Vec::new();
        push_data_records(data, &mut out);
        out
    }

    fn close(&mut self) -> Vec<EngineEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut out = Vec::new();
        if !self.close_sent && !self.failed {
            self.close_sent = true;
            out.push(EngineEvent::Ciphertext(encode_record(RecordType::Close, &[])));
        }
        out.push(EngineEvent::Closed);
        out
    }

    fn is_handshaking(&self) -> bool {
        self.handshaking
    }
}

/// Context producing [`ScriptedEngine`] sessions
#[derive(Debug, Clone)]
pub struct ScriptedContext {
    policy: Arc<dyn CertificatePolicy>,
    certificate: Bytes,
}

impl ScriptedContext {
    /// Clients verify with `policy`; servers present `certificate`.
    pub fn new(policy: Arc<dyn CertificatePolicy>, certificate: impl Into<Bytes>) -> Self {
        Self {
            policy,
            certificate: certificate.into(),
        }
    }
}

impl TlsContext for ScriptedContext {
    fn create_session(&self, params: &SessionParams) -> Result<Box<dyn TlsEngine>, TlsError> {
        if params.role == Role::Client && params.server_name.is_none() {
            return Err(TlsError::Config("client session needs a server name".to_string()));
        }
        Ok(Box::new(ScriptedEngine::new(
            params,
            self.policy.clone(),
            self.certificate.clone(),
        )))
    }
}
