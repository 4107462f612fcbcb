//! Binary payload serialization.
//!
//! All payloads and code images use `bincode` with fixed-width integers and
//! strict trailing-byte rejection. Encoding goes through a per-thread scratch
//! buffer so concurrently running sessions never share serializer state.

use std::cell::RefCell;

use bincode::Options;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(4096));
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(limit)
}

/// Serialize `value` and append the bytes to `dst`.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the value cannot be serialized.
pub fn encode_into<T: Serialize + ?Sized>(value: &T, dst: &mut BytesMut) -> Result<()> {
    SCRATCH.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        options(u64::MAX).serialize_into(&mut *buf, value)?;
        dst.extend_from_slice(&buf);
        Ok(())
    })
}

/// Serialize `value` into a fresh vector.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the value cannot be serialized.
pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(options(u64::MAX).serialize(value)?)
}

/// Deserialize exactly one value from `bytes`, allocating at most `limit`.
///
/// # Errors
///
/// Returns `AppError::Protocol` when the bytes are malformed, exceed the
/// limit, or carry trailing data.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T> {
    Ok(options(limit as u64).deserialize(bytes)?)
}
