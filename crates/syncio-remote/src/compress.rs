//! Gzip at the byte-transfer boundary
//!
//! Compression only ever touches the uploaded/downloaded payload. Lengths
//! and times exposed through the store contract, and every staleness
//! comparison, use the uncompressed logical values.

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use syncio_common::Result;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Gzip a payload for upload.
pub fn compress(payload: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(payload.len() / 2 + 64),
        Compression::default(),
    );
    encoder.write_all(payload)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Gunzip a downloaded payload.
pub fn decompress(payload: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// Whether a stored payload carries the gzip signature.
///
/// Lets a compressing store read back objects uploaded before compression
/// was switched on.
pub fn is_compressed(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[..2] == GZIP_MAGIC
}
