//! Chromaprint fingerprint wire codec.
//!
//! A fingerprint travels as a base64url string (no padding). The binary
//! form is a 4-byte big-endian header (`version` in the top byte, the
//! hash count in the low 24 bits) followed by a 3-bit-packed stream of
//! "normal" bit codes and, if any normal code is 7, a 5-bit-packed stream
//! of "exceptional" addends. Each hash is stored as the positions of its
//! set bits, delta-coded within the hash and XOR-chained between
//! consecutive hashes. Only the byte codec lives here; matching semantics
//! are out of scope.

mod bits;

pub use bits::{pack_u3, pack_u5, unpack_u3, unpack_u5};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{FpindexError, Result};

/// Raw fingerprint data: algorithm version and the hash sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub version: u8,
    pub hashes: Vec<u32>,
}

/// Decode a base64url fingerprint string into its binary form.
pub fn decode_fingerprint_string(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() {
        return Err(FpindexError::InvalidInput(
            "fingerprint string can't be empty".into(),
        ));
    }
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|err| FpindexError::InvalidInput(format!("invalid base64: {err}")))
}

/// Encode binary fingerprint data as a base64url string.
pub fn encode_fingerprint_to_string(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Parse binary fingerprint data.
pub fn parse_fingerprint(data: &[u8]) -> Result<Fingerprint> {
    if data.len() < 4 {
        return Err(FpindexError::InvalidInput(
            "missing fingerprint header".into(),
        ));
    }

    let header = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let version = (header >> 24) as u8;
    let total_values = (header & 0xff_ffff) as usize;
    let mut offset = 4;

    if total_values == 0 {
        return Err(FpindexError::InvalidInput("empty fingerprint".into()));
    }

    let mut bits = unpack_u3(&data[offset..]);
    let mut num_values = 0;
    let mut num_exceptional = 0;
    let mut end = None;
    for (bi, &bit) in bits.iter().enumerate() {
        if bit == 0 {
            num_values += 1;
            if num_values == total_values {
                end = Some(bi + 1);
                break;
            }
        } else if bit == 7 {
            num_exceptional += 1;
        }
    }

    match end {
        Some(n) => {
            bits.truncate(n);
            offset += (n * 3 + 8) / 8;
        }
        None => {
            return Err(FpindexError::InvalidInput(
                "missing fingerprint data (normal bits)".into(),
            ));
        }
    }

    if num_exceptional > 0 {
        let exceptional = unpack_u5(data.get(offset..).unwrap_or(&[]));
        if exceptional.len() != num_exceptional {
            return Err(FpindexError::InvalidInput(
                "missing fingerprint data (exceptional bits)".into(),
            ));
        }
        let mut ei = 0;
        for bit in bits.iter_mut() {
            if *bit == 7 {
                *bit += exceptional[ei];
                ei += 1;
            }
        }
    }

    let mut hashes = vec![0u32; total_values];
    let mut hi = 0;
    let mut last_bit = 0u32;
    for &bit in &bits {
        if bit == 0 {
            if hi > 0 {
                hashes[hi] ^= hashes[hi - 1];
            }
            last_bit = 0;
            hi += 1;
        } else {
            last_bit += u32::from(bit);
            // bit positions past 32 contribute nothing, like a shift past
            // the word width would
            hashes[hi] |= 1u32.checked_shl(last_bit - 1).unwrap_or(0);
        }
    }

    Ok(Fingerprint { version, hashes })
}

/// Parse a base64url fingerprint string.
pub fn parse_fingerprint_string(s: &str) -> Result<Fingerprint> {
    parse_fingerprint(&decode_fingerprint_string(s)?)
}

/// Compress a fingerprint back into its binary wire form. This is the
/// exact inverse of [`parse_fingerprint`].
pub fn compress_fingerprint(fp: &Fingerprint) -> Vec<u8> {
    let mut normal = Vec::new();
    let mut exceptional = Vec::new();

    for (i, &hash) in fp.hashes.iter().enumerate() {
        let mut value = if i == 0 { hash } else { hash ^ fp.hashes[i - 1] };
        let mut last_bit = 0u32;
        while value != 0 {
            let bit = value.trailing_zeros() + 1;
            let code = bit - last_bit;
            last_bit = bit;
            if code >= 7 {
                normal.push(7u8);
                exceptional.push((code - 7) as u8);
            } else {
                normal.push(code as u8);
            }
            value &= value - 1;
        }
        normal.push(0);
    }

    let header = (u32::from(fp.version) << 24) | fp.hashes.len() as u32;
    let mut data = header.to_be_bytes().to_vec();
    data.extend_from_slice(&pack_u3(&normal));
    if !exceptional.is_empty() {
        data.extend_from_slice(&pack_u5(&exceptional));
    }
    data
}

/// Check whether `data` is a valid binary fingerprint.
pub fn validate_fingerprint(data: &[u8]) -> bool {
    parse_fingerprint(data).is_ok()
}

/// Check whether `s` is a valid base64url fingerprint string.
pub fn validate_fingerprint_string(s: &str) -> bool {
    parse_fingerprint_string(s).is_ok()
}
