//! Bencoding, the self-describing format of torrent files and tracker
//! responses.
//!
//! Values are either handled untyped through [`Value`] or (de)serialized
//! straight into serde types. Dictionaries are always written with their
//! keys sorted, so encoding is canonical and `info_hash` computations are
//! stable.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::ApplicationError;

pub use serde_bencode::value::Value;

/// Encodes `value` into its canonical bencoded form.
///
/// Fails for values bencode cannot represent (floats, for instance).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ApplicationError> {
    serde_bencode::to_bytes(value)
        .map_err(|e| ApplicationError::FormatError(format!("bencode: {e}")))
}

/// Decodes `bytes` into `T`.
///
/// Truncated input, unterminated containers and bad length prefixes are
/// reported as [`ApplicationError::FormatError`]; nothing partial is ever
/// returned.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApplicationError> {
    serde_bencode::from_bytes(bytes)
        .map_err(|e| ApplicationError::FormatError(format!("bencode: {e}")))
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, ApplicationError> {
    decode(bytes)
}
