//! KQ-encoding: the bespoke string-to-bytes scheme used before URL-safe
//! base64 when assembling the JWT header/payload. Each
//! character's code point `c` is emitted as a single byte `c & 0xFF` when
//! `c <= 255`, else as the little-endian pair `[c & 0xFF, c >> 8]`. The
//! bytes are then URL-safe-base64 encoded without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub fn kq_encode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    for ch in s.chars() {
        let v = ch as u32;
        if v <= 0xFF {
            bytes.push(v as u8);
        } else {
            bytes.push((v & 0xFF) as u8);
            bytes.push((v >> 8) as u8);
        }
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn urlsafe_b64encode_nopad(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode a URL-safe base64 string, padding with `=` up to a multiple of 4
/// first, matching the upstream `xsrfToken` encoding.
pub fn urlsafe_b64decode_with_pad(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut padded = value.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    base64::engine::general_purpose::URL_SAFE.decode(padded.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kq_encode_ascii_matches_plain_utf8_base64url() {
        let input = r#"{"alg":"HS256","typ":"JWT","kid":"abc"}"#;
        let encoded = kq_encode(input);
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .expect("decode");
        assert_eq!(decoded, input.as_bytes());
    }

    #[test]
    fn kq_encode_round_trips_for_wide_chars() {
        let input = "héllo\u{1F600}";
        let encoded = kq_encode(input);
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .expect("decode");
        let mut expected = Vec::new();
        for ch in input.chars() {
            let v = ch as u32;
            if v <= 0xFF {
                expected.push(v as u8);
            } else {
                expected.push((v & 0xFF) as u8);
                expected.push((v >> 8) as u8);
            }
        }
        assert_eq!(decoded, expected);
    }

    #[test]
    fn urlsafe_b64decode_with_pad_handles_unpadded_input() {
        let original = b"hello world, this is a token";
        let encoded = URL_SAFE_NO_PAD.encode(original);
        let decoded = urlsafe_b64decode_with_pad(&encoded).expect("decode");
        assert_eq!(decoded, original);
    }
}
