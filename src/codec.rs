//! Size-limited bincode encoding for opaque wire blobs.
//!
//! Credential contexts, call chains and shared-auth secrets all travel as
//! opaque bytes. Decoding is bounded so a hostile peer cannot make a server
//! allocate arbitrarily.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::BusResult;

/// Upper bound for any encoded blob.
pub const MAX_BLOB_BYTES: u64 = 64 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_BLOB_BYTES)
        .reject_trailing_bytes()
}

pub fn encode<T: Serialize>(value: &T) -> BusResult<Vec<u8>> {
    Ok(options().serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> BusResult<T> {
    Ok(options().deserialize(bytes)?)
}
