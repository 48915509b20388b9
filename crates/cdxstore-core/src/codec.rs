//! Binary key/value codec for the ordered capture space.
//!
//! Key layout: `urlkey 0x20 ts14 0x20 file 0x20 offset_be64`. Urlkeys can
//! never contain a space, so plain byte order over whole keys equals the
//! logical `(urlkey, timestamp, file, offset)` order and all captures of one
//! urlkey form a contiguous span starting at `urlkey 0x20`.

use bincode::config::{standard, Configuration};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::Capture;

const SEPARATOR: u8 = b' ';
const TIMESTAMP_WIDTH: usize = 14;
const OFFSET_WIDTH: usize = 8;

fn codec() -> Configuration {
    standard()
}

/// Fields not covered by the key, packed into the row value.
#[derive(Debug, Serialize, Deserialize)]
struct CaptureValue {
    original: String,
    mimetype: String,
    status: u32,
    digest: String,
    redirecturl: String,
    length: u64,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("value decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("malformed row key: {0}")]
    Key(&'static str),
    #[error("key is not utf-8: {0}")]
    KeyUtf8(#[from] std::str::Utf8Error),
}

/// Encode the primary key of a capture.
pub fn encode_key(capture: &Capture) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        capture.urlkey.len() + TIMESTAMP_WIDTH + capture.file.len() + OFFSET_WIDTH + 3,
    );
    key.extend_from_slice(capture.urlkey.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(format!("{:014}", capture.timestamp).as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(capture.file.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(&capture.compressed_offset.to_be_bytes());
    key
}

/// Encode everything the key does not carry.
pub fn encode_value(capture: &Capture) -> Result<Vec<u8>, CodecError> {
    let value = CaptureValue {
        original: capture.original.clone(),
        mimetype: capture.mimetype.clone(),
        status: capture.status,
        digest: capture.digest.clone(),
        redirecturl: capture.redirecturl.clone(),
        length: capture.length,
    };
    Ok(bincode::serde::encode_to_vec(&value, codec())?)
}

/// The span of keys holding every capture of `urlkey`.
pub fn query_prefix(urlkey: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(urlkey.len() + 1);
    prefix.extend_from_slice(urlkey.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Exact inverse of `encode_key` + `encode_value`.
pub fn decode_row(key: &[u8], value: &[u8]) -> Result<Capture, CodecError> {
    // The offset bytes at the tail are binary and may contain 0x20, so the
    // key is parsed from both ends: separators are only searched for in the
    // urlkey/timestamp head.
    let first_sep = key
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or(CodecError::Key("missing urlkey separator"))?;
    let urlkey = std::str::from_utf8(&key[..first_sep])?.to_string();

    let ts_start = first_sep + 1;
    let ts_end = ts_start + TIMESTAMP_WIDTH;
    if key.len() < ts_end + 1 + 1 + OFFSET_WIDTH {
        return Err(CodecError::Key("key too short"));
    }
    let ts_digits = std::str::from_utf8(&key[ts_start..ts_end])?;
    let timestamp: u64 = ts_digits
        .parse()
        .map_err(|_| CodecError::Key("timestamp is not numeric"))?;
    if key[ts_end] != SEPARATOR {
        return Err(CodecError::Key("missing timestamp separator"));
    }

    let offset_start = key.len() - OFFSET_WIDTH;
    if key[offset_start - 1] != SEPARATOR {
        return Err(CodecError::Key("missing file separator"));
    }
    let mut offset_bytes = [0u8; OFFSET_WIDTH];
    offset_bytes.copy_from_slice(&key[offset_start..]);
    let compressed_offset = u64::from_be_bytes(offset_bytes);
    let file = std::str::from_utf8(&key[ts_end + 1..offset_start - 1])?.to_string();

    let (decoded, _): (CaptureValue, usize) = bincode::serde::decode_from_slice(value, codec())?;
    Ok(Capture {
        urlkey,
        timestamp,
        original: decoded.original,
        mimetype: decoded.mimetype,
        status: decoded.status,
        digest: decoded.digest,
        redirecturl: decoded.redirecturl,
        length: decoded.length,
        compressed_offset,
        file,
    })
}
