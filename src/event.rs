//! Nostr event model and validation primitives.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::Rejection;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Signed event submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Recompute the canonical hash from the event fields.
    pub fn canonical_hash(&self) -> [u8; 32] {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        Sha256::digest(arr.to_string().as_bytes()).into()
    }

    /// Unix timestamp of the first well-formed `expiration` tag, if any.
    pub fn expires_at(&self) -> Option<u64> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [name, value, ..] if name == "expiration" => value.parse().ok(),
                _ => None,
            })
    }

    /// Value of the first `d` tag, if any.
    pub fn d_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [name, value, ..] if name == "d" => Some(value.as_str()),
                _ => None,
            })
    }
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<(), Rejection> {
    let hash = ev.canonical_hash();
    if hex::encode(hash) != ev.id {
        return Err(Rejection::IdMismatch);
    }
    let Ok(sig_bytes) = hex::decode(&ev.sig) else {
        return Err(Rejection::SignatureInvalid);
    };
    let Ok(pk_bytes) = hex::decode(&ev.pubkey) else {
        return Err(Rejection::SignatureInvalid);
    };
    let (Ok(sig), Ok(pk), Ok(msg)) = (
        Signature::from_slice(&sig_bytes),
        XOnlyPublicKey::from_slice(&pk_bytes),
        Message::from_digest_slice(&hash),
    ) else {
        return Err(Rejection::SignatureInvalid);
    };
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| Rejection::SignatureInvalid)
}

/// Count leading zero bits of a hex string read as a big-endian integer.
pub fn leading_zero_bits(hex_str: &str) -> u32 {
    let mut bits = 0;
    for c in hex_str.chars() {
        match c.to_digit(16) {
            Some(0) => bits += 4,
            Some(n) => return bits + n.leading_zeros() - 28,
            None => return bits,
        }
    }
    bits
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
