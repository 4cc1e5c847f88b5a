//! Signed, versioned Flight ticket payloads.
//!
//! Every ticket handed to a client is opaque: a protobuf payload carrying
//! the statement registry key, a schema fingerprint id, an issue
//! timestamp, a nonce, and a signature over all of it keyed by a
//! per-process secret. Resolution verifies the signature before trusting
//! any field and rejects payloads older than the configured TTL, so a
//! restarted server (fresh key) or a replayed stale ticket both fail
//! closed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost::Message;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::PorterError;

pub const TICKET_VERSION: u32 = 1;

/// How the underlying statement was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum TicketKind {
    /// One-shot statement issued by `GetFlightInfo(CommandStatementQuery)`.
    Statement = 1,
    /// Long-lived prepared statement.
    Prepared = 2,
}

/// Serialized form that rides in the Flight ticket.
#[derive(Clone, PartialEq, Message)]
pub struct TicketPayload {
    /// Version gate for future layout changes.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(enumeration = "TicketKind", tag = "2")]
    pub kind: i32,
    /// Key into the server-side statement registry.
    #[prost(uint64, tag = "3")]
    pub statement_id: u64,
    /// Identifies the schema advertised with this ticket.
    #[prost(uint64, tag = "4")]
    pub schema_id: u64,
    /// Unix seconds at issue time.
    #[prost(int64, tag = "5")]
    pub issued_at: i64,
    #[prost(bytes = "vec", tag = "6")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub signature: Vec<u8>,
}

impl TicketPayload {
    pub fn ticket_kind(&self) -> Option<TicketKind> {
        TicketKind::try_from(self.kind).ok()
    }
}

pub struct TicketIssuer {
    key: [u8; 32],
    ttl: Duration,
}

impl TicketIssuer {
    /// Fresh random key; tickets do not survive a server restart.
    pub fn new(ttl: Duration) -> Self {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        key[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self { key, ttl }
    }

    pub fn issue(&self, kind: TicketKind, statement_id: u64, schema_id: u64) -> Vec<u8> {
        self.issue_at(kind, statement_id, schema_id, unix_now())
    }

    fn issue_at(
        &self,
        kind: TicketKind,
        statement_id: u64,
        schema_id: u64,
        issued_at: i64,
    ) -> Vec<u8> {
        let mut payload = TicketPayload {
            version: TICKET_VERSION,
            kind: kind as i32,
            statement_id,
            schema_id,
            issued_at,
            nonce: Uuid::new_v4().as_bytes().to_vec(),
            signature: Vec::new(),
        };
        payload.signature = self.sign(&payload).to_vec();
        payload.encode_to_vec()
    }

    /// Decode, authenticate, and expiry-check a client-presented ticket.
    pub fn verify(&self, bytes: &[u8]) -> Result<TicketPayload, PorterError> {
        let payload = TicketPayload::decode(bytes)
            .map_err(|err| PorterError::InvalidArgument(format!("malformed ticket: {err}")))?;
        if payload.version != TICKET_VERSION {
            return Err(PorterError::InvalidArgument(format!(
                "unsupported ticket version {}",
                payload.version
            )));
        }
        if payload.ticket_kind().is_none() {
            return Err(PorterError::InvalidArgument(
                "unknown ticket kind".to_string(),
            ));
        }
        let expected = self.sign(&payload);
        if payload.signature != expected {
            return Err(PorterError::InvalidArgument(
                "ticket signature mismatch".to_string(),
            ));
        }
        let age = unix_now().saturating_sub(payload.issued_at);
        if age < 0 || age as u64 > self.ttl.as_secs() {
            return Err(PorterError::TicketExpired);
        }
        Ok(payload)
    }

    fn sign(&self, payload: &TicketPayload) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(payload.version.to_be_bytes());
        hasher.update(payload.kind.to_be_bytes());
        hasher.update(payload.statement_id.to_be_bytes());
        hasher.update(payload.schema_id.to_be_bytes());
        hasher.update(payload.issued_at.to_be_bytes());
        hasher.update(&payload.nonce);
        hasher.finalize().into()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
