//! Pairing URIs
//!
//! `wc:{topic}@2?relay-protocol=irn&symKey={hex}&expiryTimestamp={unix}`.
//! The topic is the hex SHA-256 of the symmetric key.

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConnectError;

pub const RELAY_PROTOCOL: &str = "irn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    /// Hex-encoded 32-byte key
    pub sym_key: String,
    pub relay_protocol: String,
    /// Unix seconds
    pub expiry_timestamp: i64,
}

impl PairingUri {
    /// Fresh pairing valid for `ttl`
    pub fn generate(ttl: Duration) -> Self {
        let sym_key: [u8; 32] = rand::thread_rng().gen();
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        Self::from_sym_key(&sym_key, expiry)
    }

    pub fn from_sym_key(sym_key: &[u8; 32], expiry_timestamp: i64) -> Self {
        let topic = hex::encode(Sha256::digest(sym_key));
        Self {
            topic,
            sym_key: hex::encode(sym_key),
            relay_protocol: RELAY_PROTOCOL.to_string(),
            expiry_timestamp,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.expiry_timestamp, 0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expiry_timestamp
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wc:{}@2?relay-protocol={}&symKey={}&expiryTimestamp={}",
            self.topic, self.relay_protocol, self.sym_key, self.expiry_timestamp
        )
    }
}

impl FromStr for PairingUri {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConnectError::Transport(format!("invalid pairing uri: {}", s));

        let rest = s.strip_prefix("wc:").ok_or_else(invalid)?;
        let (topic, query) = rest.split_once("@2?").ok_or_else(invalid)?;

        let mut relay_protocol = None;
        let mut sym_key = None;
        let mut expiry_timestamp = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("relay-protocol", v)) => relay_protocol = Some(v.to_string()),
                Some(("symKey", v)) => sym_key = Some(v.to_string()),
                Some(("expiryTimestamp", v)) => expiry_timestamp = v.parse().ok(),
                _ => {}
            }
        }

        let sym_key = sym_key.ok_or_else(invalid)?;
        let key_bytes = hex::decode(&sym_key).map_err(|_| invalid())?;
        if key_bytes.len() != 32 || hex::encode(Sha256::digest(&key_bytes)) != topic {
            return Err(invalid());
        }

        Ok(Self {
            topic: topic.to_string(),
            sym_key,
            relay_protocol: relay_protocol.ok_or_else(invalid)?,
            expiry_timestamp: expiry_timestamp.ok_or_else(invalid)?,
        })
    }
}
