//! The application-level `Test` message checksum (§6). This is a custom,
//! intentionally non-cryptographic 32-byte digest that must stay bit-for-bit
//! compatible with existing peers — it is not to be "improved" into a real
//! hash (§1 non-goals).

use base64::Engine as _;

/// Compute the raw 32-byte checksum over `data`.
///
/// Returns `None` for empty input. The finalization loop indexes the input
/// with `i % n`; for `n == 0` that's undefined, and the spec's own design
/// notes recommend rejecting empty input at this boundary rather than
/// guessing at unspecified behavior.
#[must_use]
pub fn checksum(data: &[u8]) -> Option<[u8; 32]> {
    let n = data.len();
    if n == 0 {
        return None;
    }

    let mut s: u32 = 0x5A5A_5A5A;
    for &x in data {
        s = (s << 5).wrapping_add(s).wrapping_add(u32::from(x));
        s ^= s >> 16;
    }

    let mut out = [0u8; 32];
    for (i, out_byte) in out.iter_mut().enumerate() {
        *out_byte = ((s >> ((i % 4) * 8)) & 0xFF) as u8;
        if i % 4 == 3 {
            s = ((s << 7) ^ (s >> 11)).wrapping_add(u32::from(data[i % n]));
        }
    }
    Some(out)
}

/// Compute the checksum and base64-encode it (no trailing newline), the
/// wire representation used for `Base64MessageHash`.
#[must_use]
pub fn checksum_base64(data: &[u8]) -> Option<String> {
    checksum(data).map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(checksum(b""), None);
        assert_eq!(checksum_base64(b""), None);
    }

    #[test]
    fn deterministic_across_calls() {
        let a = checksum(b"hello world").unwrap();
        let b = checksum(b"hello world").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn differs_on_single_byte_change() {
        let a = checksum(b"hello").unwrap();
        let b = checksum(b"hellp").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn single_byte_input_does_not_panic_on_modulus() {
        // n == 1: every `i % n` access in the finalization loop hits index 0.
        let out = checksum(b"A").unwrap();
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn base64_round_trips_through_no_trailing_newline() {
        let encoded = checksum_base64(b"A").unwrap();
        assert!(!encoded.ends_with('\n'));
        assert!(!encoded.is_empty());
    }
}
