//! Value envelope: optional encryption and time-to-live expiry.
//!
//! A wrapped value is an ordinary map the core stores like any other:
//!
//! ```text
//! { "_zWrapped": true,
//!   "_isEncrypted": <bool>,
//!   "_expiry": <datetime or null>,
//!   "data": <inner map, or ciphertext byte-string> }
//! ```
//!
//! The cipher itself lives outside this crate behind the [`Cipher`] trait;
//! implementations are expected to be CBC-mode block ciphers that prepend
//! a random per-payload IV to the ciphertext, but the handler only ever
//! sees opaque blobs. Expiry is lazy: an expired value reads as absent and
//! the caller deletes the tag.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::codec::{decode_value, encode_value};
use crate::error::{FreightError, FreightResult};
use crate::value::Value;

/// Marker key identifying an envelope map.
pub const KEY_WRAPPED: &str = "_zWrapped";
/// Whether `data` holds ciphertext.
pub const KEY_ENCRYPTED: &str = "_isEncrypted";
/// Absolute expiry instant, or null for no expiry.
pub const KEY_EXPIRY: &str = "_expiry";
/// The wrapped payload.
pub const KEY_DATA: &str = "data";

/// Symmetric cipher over opaque byte blobs.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> FreightResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> FreightResult<Vec<u8>>;
}

/// Outcome of unwrapping a stored value.
#[derive(Debug, PartialEq)]
pub enum Unwrapped {
    Value(Value),
    /// The envelope's expiry lies in the past; the tag should be deleted.
    Expired,
}

/// Applies wrap on write and unwrap (with lazy expiry) on read.
#[derive(Clone, Default)]
pub struct EnvelopeHandler {
    cipher: Option<Arc<dyn Cipher>>,
}

impl EnvelopeHandler {
    pub fn new(cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self { cipher }
    }

    /// Wrap a value for storage. Plaintext payloads stay structured;
    /// encrypted payloads are the encoded inner value run through the
    /// cipher and stored as a byte-string.
    pub fn wrap(&self, value: Value, encrypt: bool, ttl: Option<Duration>) -> FreightResult<Value> {
        let data = if encrypt {
            let cipher = self.cipher.as_ref().ok_or_else(|| FreightError::Cipher {
                reason: "encryption requested but no cipher installed".to_string(),
            })?;
            Value::Bytes(cipher.encrypt(&encode_value(&value))?)
        } else {
            value
        };

        let expiry = match ttl {
            Some(ttl) => Value::DateTime(Utc::now() + ttl),
            None => Value::Null,
        };

        let mut envelope = BTreeMap::new();
        envelope.insert(KEY_WRAPPED.to_string(), Value::Bool(true));
        envelope.insert(KEY_ENCRYPTED.to_string(), Value::Bool(encrypt));
        envelope.insert(KEY_EXPIRY.to_string(), expiry);
        envelope.insert(KEY_DATA.to_string(), data);
        Ok(Value::Map(envelope))
    }

    /// Unwrap a stored value. Values without the wrapper marker pass
    /// through unchanged.
    pub fn unwrap(&self, stored: Value) -> FreightResult<Unwrapped> {
        if stored.field(KEY_WRAPPED).and_then(Value::as_bool) != Some(true) {
            return Ok(Unwrapped::Value(stored));
        }

        if let Some(expiry) = stored.field(KEY_EXPIRY).and_then(Value::as_datetime) {
            if expiry <= Utc::now() {
                return Ok(Unwrapped::Expired);
            }
        }

        let encrypted = stored.field(KEY_ENCRYPTED).and_then(Value::as_bool) == Some(true);
        let data = stored.field(KEY_DATA).ok_or_else(|| FreightError::Cipher {
            reason: "envelope is missing its data entry".to_string(),
        })?;

        if !encrypted {
            return Ok(Unwrapped::Value(data.clone()));
        }

        let cipher = self.cipher.as_ref().ok_or_else(|| FreightError::Cipher {
            reason: "encrypted value but no cipher installed".to_string(),
        })?;
        let ciphertext = match data {
            Value::Bytes(bytes) => bytes,
            other => {
                return Err(FreightError::Cipher {
                    reason: format!("encrypted payload must be a byte-string, found {}", other.kind()),
                })
            }
        };
        let plaintext = cipher.decrypt(ciphertext)?;
        Ok(Unwrapped::Value(decode_value(&plaintext)?))
    }

    /// Expiry instant of a wrapped value, if any.
    pub fn expiry(stored: &Value) -> Option<DateTime<Utc>> {
        stored.field(KEY_EXPIRY).and_then(Value::as_datetime)
    }
}
