#![forbid(unsafe_code)]
//! Fixed-width and varint encoders shared by the index codecs.
//!
//! Decoders here read bytes that came back from storage, so they report
//! `StoreError::Corruption` instead of panicking on short or oversized input.

pub mod ord {
    //! Order-preserving fixed-width encoders.

    use crate::types::{Result, StoreError};

    const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Appends `v` in big-endian order so byte order matches numeric order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u64 from the head of `src`.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head: [u8; U64_LEN] = src
            .get(..U64_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(StoreError::Corruption("u64 source shorter than 8 bytes"))?;
        Ok(u64::from_be_bytes(head))
    }

    /// Appends a big-endian u16.
    pub fn put_u16_be(dst: &mut Vec<u8>, v: u16) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Splits `src` into its 8-byte chunks, failing if the length is ragged.
    pub fn u64_chunks(src: &[u8]) -> Result<impl Iterator<Item = u64> + '_> {
        if src.len() % U64_LEN != 0 {
            return Err(StoreError::Corruption(
                "value length is not a multiple of 8 bytes",
            ));
        }
        Ok(src.chunks_exact(U64_LEN).map(|chunk| {
            let mut bytes = [0u8; U64_LEN];
            bytes.copy_from_slice(chunk);
            u64::from_be_bytes(bytes)
        }))
    }
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{Result, StoreError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(StoreError::Corruption("varint decode truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(StoreError::Corruption("varint overflow (more than 64 bits)"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StoreError::Corruption("varint too long (exceeded 10 bytes)"))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }

    /// Decodes a value that must consist of exactly one ZigZag varint.
    pub fn decode_i64_exact(src: &[u8]) -> Result<i64> {
        let mut off = 0;
        let value = decode_i64(src, &mut off)?;
        if off != src.len() {
            return Err(StoreError::Corruption("trailing bytes after varint"));
        }
        Ok(value)
    }
}
