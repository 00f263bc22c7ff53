//! Byte-comparable VLV sort key encoding.
//!
//! An ascending value encodes as a `0x00` presence byte, the content with
//! `0x00` and `0x01` escaped to `0x01 0x01` and `0x01 0x02`, and a `0x00`
//! terminator. A missing value encodes as the single byte `0xFF`. Under
//! unsigned byte comparison this orders values by content, puts a value
//! before every longer value it prefixes, and puts missing values last.
//! Encodings are prefix-free, so several of them can be concatenated into a
//! composite key that still compares component by component.
//!
//! Descending keys are the bit complement of the ascending encoding.

const PRESENT: u8 = 0x00;
const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;
const MISSING: u8 = 0xFF;

/// Appends the ascending encoding of `value`.
pub fn encode_ascending(value: Option<&[u8]>, out: &mut Vec<u8>) {
    let Some(value) = value else {
        out.push(MISSING);
        return;
    };
    out.reserve(value.len() + 2);
    out.push(PRESENT);
    for &byte in value {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, 0x01]),
            0x01 => out.extend_from_slice(&[ESCAPE, 0x02]),
            other => out.push(other),
        }
    }
    out.push(TERMINATOR);
}

/// Flips every bit of `bytes` in place.
pub fn complement(bytes: &mut [u8]) {
    for byte in bytes {
        *byte = !*byte;
    }
}

/// Appends the descending encoding of `value`: the complement of its
/// ascending encoding.
pub fn encode_descending(value: Option<&[u8]>, out: &mut Vec<u8>) {
    let start = out.len();
    encode_ascending(value, out);
    complement(&mut out[start..]);
}

/// Appends the encoding of `value` in the requested direction.
pub fn encode_vlv_key_value(value: Option<&[u8]>, out: &mut Vec<u8>, ascending: bool) {
    if ascending {
        encode_ascending(value, out);
    } else {
        encode_descending(value, out);
    }
}

/// Normalizes an attribute value for ordering: trimmed and lower-cased.
pub fn normalize_value(value: &str) -> String {
    value.trim().to_lowercase()
}
