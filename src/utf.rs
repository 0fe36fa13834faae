//! UTF conversions for the argument encoder.
//!
//! Besides the standard UTF-8 ⇌ UTF-16 bridges, this module implements the
//! compact mixed encoding used for UTF-16 text whose prefix is plain
//! ASCII: the ASCII-only prefix collapses to one byte per unit, the rest
//! stays as raw UTF-16 code units. Wire layout: `ascii_len: u32 LE`, the
//! ASCII bytes, then the remaining units little-endian.
//!
//! Correctness only; no SIMD paths.

/// Encodes a string as UTF-16 code units.
pub fn utf8_to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Strict UTF-16 → UTF-8; `None` on unpaired surrogates.
pub fn utf16_to_utf8(units: &[u16]) -> Option<String> {
    String::from_utf16(units).ok()
}

/// Lossy UTF-16 → UTF-8; invalid code units become U+FFFD. This is the
/// consumer-side behavior for text that passed through the buffer
/// unvalidated.
pub fn utf16_to_utf8_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Length of the leading ASCII-only span of `units`.
fn ascii_prefix_len(units: &[u16]) -> usize {
    units.iter().take_while(|&&u| u < 0x80).count()
}

/// Encoded byte length of `units` under the mixed encoding.
pub fn mixed_len(units: &[u16]) -> usize {
    let ascii = ascii_prefix_len(units);
    4 + ascii + 2 * (units.len() - ascii)
}

/// Compact mixed encoding of UTF-16 `units`.
pub fn encode_mixed(units: &[u16]) -> Vec<u8> {
    let ascii = ascii_prefix_len(units);
    let mut out = Vec::with_capacity(mixed_len(units));
    out.extend_from_slice(&(ascii as u32).to_le_bytes());
    for &u in &units[..ascii] {
        out.push(u as u8);
    }
    for &u in &units[ascii..] {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

/// Decodes the mixed encoding back to UTF-16 units. `None` on a malformed
/// buffer (truncated prefix or odd trailing length).
pub fn decode_mixed(bytes: &[u8]) -> Option<Vec<u16>> {
    if bytes.len() < 4 {
        return None;
    }
    let ascii = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let rest = bytes.get(4 + ascii..)?;
    if rest.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(ascii + rest.len() / 2);
    for &b in &bytes[4..4 + ascii] {
        out.push(u16::from(b));
    }
    for pair in rest.chunks_exact(2) {
        out.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    Some(out)
}

/// Verifies that the mixed encoding of `units` round-trips, including
/// through standard UTF-8 when the input is valid UTF-16.
pub fn verify_mixed_roundtrip(units: &[u16]) -> bool {
    let decoded = match decode_mixed(&encode_mixed(units)) {
        Some(d) => d,
        None => return false,
    };
    if decoded != units {
        return false;
    }
    match utf16_to_utf8(units) {
        // Valid text must agree through the UTF-8 bridge as well.
        Some(via_utf8) => utf16_to_utf8(&decoded).as_deref() == Some(via_utf8.as_str()),
        // Invalid UTF-16 passes through verbatim; unit equality suffices.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_utf16_identity() {
        for s in ["", "ascii only", "müller", "日本語テキスト", "mixed 文本 text", "🦀"] {
            let units = utf8_to_utf16(s);
            assert_eq!(utf16_to_utf8(&units).as_deref(), Some(s));
        }
    }

    #[test]
    fn test_lossy_replaces_unpaired_surrogate() {
        let units = [0x0061, 0xD800, 0x0062]; // a, lone high surrogate, b
        assert_eq!(utf16_to_utf8(&units), None);
        assert_eq!(utf16_to_utf8_lossy(&units), "a\u{FFFD}b");
    }

    #[test]
    fn test_mixed_collapses_ascii_prefix() {
        let units = utf8_to_utf16("abc文本");
        let bytes = encode_mixed(&units);
        // 4-byte prefix + 3 ascii bytes + 2 units × 2 bytes
        assert_eq!(bytes.len(), 4 + 3 + 4);
        assert_eq!(decode_mixed(&bytes).unwrap(), units);
    }

    #[test]
    fn test_mixed_all_ascii_and_none_ascii() {
        let all = utf8_to_utf16("hello");
        assert_eq!(encode_mixed(&all).len(), 4 + 5);
        assert!(verify_mixed_roundtrip(&all));

        let none = utf8_to_utf16("文本");
        assert_eq!(encode_mixed(&none).len(), 4 + 4);
        assert!(verify_mixed_roundtrip(&none));
    }

    #[test]
    fn test_mixed_roundtrip_invalid_utf16() {
        // Unpaired surrogates travel through the mixed encoding untouched.
        let units = [0x0041, 0xDC00, 0xD800];
        assert!(verify_mixed_roundtrip(&units));
    }

    #[test]
    fn test_decode_mixed_rejects_malformed() {
        assert!(decode_mixed(&[]).is_none());
        assert!(decode_mixed(&[5, 0, 0, 0, b'a']).is_none()); // prefix truncated
        let units = utf8_to_utf16("文");
        let mut bytes = encode_mixed(&units);
        bytes.push(0); // odd tail
        assert!(decode_mixed(&bytes).is_none());
    }
}
