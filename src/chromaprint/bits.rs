//! Bit-packed small-integer streams used by the fingerprint wire format.
//!
//! Packing fills bytes LSB-first. The unpackers work on fixed-width
//! superblocks (3 bytes / 8 values for 3-bit codes, 5 bytes / 8 values for
//! 5-bit codes) and decode a short tail from the remaining bytes, so the
//! output length is always `len * 8 / k`.

/// Unpack a 3-bit-packed stream into one value per element.
pub fn unpack_u3(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() * 8 / 3);
    let mut chunks = src.chunks_exact(3);
    for chunk in &mut chunks {
        let val = u32::from(chunk[0]) | u32::from(chunk[1]) << 8 | u32::from(chunk[2]) << 16;
        for k in 0..8 {
            dst.push(((val >> (3 * k)) & 0x7) as u8);
        }
    }
    match chunks.remainder() {
        [b0, b1] => {
            let val = u32::from(*b0) | u32::from(*b1) << 8;
            for k in 0..5 {
                dst.push(((val >> (3 * k)) & 0x7) as u8);
            }
        }
        [b0] => {
            let val = u32::from(*b0);
            for k in 0..2 {
                dst.push(((val >> (3 * k)) & 0x7) as u8);
            }
        }
        _ => {}
    }
    dst
}

/// Unpack a 5-bit-packed stream into one value per element.
pub fn unpack_u5(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() * 8 / 5);
    let mut chunks = src.chunks_exact(5);
    for chunk in &mut chunks {
        let mut val = 0u64;
        for (b, &byte) in chunk.iter().enumerate() {
            val |= u64::from(byte) << (8 * b);
        }
        for k in 0..8 {
            dst.push(((val >> (5 * k)) & 0x1f) as u8);
        }
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut val = 0u64;
        for (b, &byte) in tail.iter().enumerate() {
            val |= u64::from(byte) << (8 * b);
        }
        // tail_values = floor(tail_bits / 5)
        let tail_values = tail.len() * 8 / 5;
        for k in 0..tail_values {
            dst.push(((val >> (5 * k)) & 0x1f) as u8);
        }
    }
    dst
}

/// Pack 3-bit values LSB-first into the minimal number of bytes.
pub fn pack_u3(values: &[u8]) -> Vec<u8> {
    pack_bits(values, 3)
}

/// Pack 5-bit values LSB-first into the minimal number of bytes.
pub fn pack_u5(values: &[u8]) -> Vec<u8> {
    pack_bits(values, 5)
}

fn pack_bits(values: &[u8], width: usize) -> Vec<u8> {
    let mut dst = vec![0u8; (values.len() * width + 7) / 8];
    for (i, &value) in values.iter().enumerate() {
        let bit = i * width;
        let byte = bit / 8;
        let shift = bit % 8;
        dst[byte] |= value << shift;
        if shift + width > 8 {
            dst[byte + 1] |= value >> (8 - shift);
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_u3() {
        assert_eq!(unpack_u3(&[]), Vec::<u8>::new());
        assert_eq!(unpack_u3(&[0b0000_1001]), vec![1, 1]);
        assert_eq!(unpack_u3(&[0xff, 0xff, 0xff]), vec![7; 8]);
        // 2-byte tail yields 5 values
        assert_eq!(unpack_u3(&[0b0000_1001, 0]), vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_unpack_u5() {
        assert_eq!(unpack_u5(&[]), Vec::<u8>::new());
        assert_eq!(unpack_u5(&[0b0000_0001]), vec![1]);
        assert_eq!(unpack_u5(&[0xff; 5]), vec![31; 8]);
        assert_eq!(unpack_u5(&[0b0100_0001, 0b0001_0000]), vec![1, 2, 4]);
    }

    #[test]
    fn test_pack_unpack_u3() {
        let values: Vec<u8> = (0u8..21).map(|i| i % 8).collect();
        let packed = pack_u3(&values);
        let unpacked = unpack_u3(&packed);
        assert!(unpacked.len() >= values.len());
        assert_eq!(&unpacked[..values.len()], values.as_slice());
        assert!(unpacked[values.len()..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_pack_unpack_u5() {
        let values: Vec<u8> = (0u8..17).map(|i| i % 32).collect();
        let packed = pack_u5(&values);
        let unpacked = unpack_u5(&packed);
        assert!(unpacked.len() >= values.len());
        assert_eq!(&unpacked[..values.len()], values.as_slice());
        assert!(unpacked[values.len()..].iter().all(|&v| v == 0));
    }
}
