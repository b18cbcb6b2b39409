//! Text decoding for MIME leaves that arrive as raw bytes.
//!
//! Order of preference: byte-order mark, declared charset, statistical
//! detection, lossy UTF-8.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

use super::canonical::decode_utf16_dropping_lone;

/// Decode `bytes`, trusting `declared` only when it names a known encoding.
pub fn decode_text(bytes: &[u8], declared: Option<&str>) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        return decode_with(encoding, &bytes[bom_len..]);
    }

    if let Some(encoding) = declared.and_then(|label| Encoding::for_label(label.trim().as_bytes()))
    {
        let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
        if !had_errors {
            return text.into_owned();
        }
        tracing::debug!(
            charset = encoding.name(),
            "Declared charset does not match content, detecting"
        );
    }

    detect_and_decode(bytes)
}

/// Guess the encoding of `bytes` and decode with it.
pub fn detect_and_decode(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    text.into_owned()
}

fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> String {
    if encoding == UTF_16LE || encoding == UTF_16BE {
        let little = encoding == UTF_16LE;
        let units = bytes.chunks_exact(2).map(|pair| {
            if little {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        });
        return decode_utf16_dropping_lone(units);
    }
    if encoding == UTF_8 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    encoding.decode_without_bom_handling(bytes).0.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_passes_through() {
        assert_eq!(decode_text("héllo".as_bytes(), None), "héllo");
    }

    #[test]
    fn declared_latin1_is_honored() {
        // "café" in ISO-8859-1
        let bytes = [0x63, 0x61, 0x66, 0xE9];
        assert_eq!(decode_text(&bytes, Some("iso-8859-1")), "café");
    }

    #[test]
    fn unknown_label_falls_back_to_detection() {
        let bytes = [0x63, 0x61, 0x66, 0xE9];
        let text = decode_text(&bytes, Some("x-made-up"));
        assert!(text.starts_with("caf"));
        assert_eq!(text.chars().count(), 4);
    }

    #[test]
    fn utf16_bom_with_lone_surrogate() {
        // BOM (LE), 'h', lone low surrogate, 'i'
        let bytes = [0xFF, 0xFE, 0x68, 0x00, 0x00, 0xDC, 0x69, 0x00];
        assert_eq!(decode_text(&bytes, None), "hi");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        let bytes = [0xEF, 0xBB, 0xBF, b'o', b'k'];
        assert_eq!(decode_text(&bytes, Some("latin1")), "ok");
    }
}
