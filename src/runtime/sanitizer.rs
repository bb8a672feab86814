//! Response decoding and cleanup.
//!
//! Raw process output is a byte buffer of unknown encoding that usually
//! echoes the formatted prompt before the actual continuation. Decoding never
//! fails: undecodable bytes become U+FFFD.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use tracing::debug;

use super::template_engine::ChatFormat;

/// Result of running the encoding detector over a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub encoding: &'static Encoding,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Best-effort decoder for subprocess output.
///
/// A non-UTF-8 guess is only used when its confidence reaches the configured
/// threshold; otherwise the buffer is decoded as lossy UTF-8.
#[derive(Debug, Clone, Copy)]
pub struct ResponseDecoder {
    confidence_threshold: f32,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ResponseDecoder {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Guess the encoding of `bytes`.
    ///
    /// BOMs win outright. Otherwise UTF-8 is scored by the share of non-ASCII
    /// bytes that form valid sequences. If that falls short of the threshold,
    /// `chardetng` picks a legacy encoding, scored by the share of non-ASCII
    /// characters it decodes to that are printable. Guesses `chardetng` does
    /// not vouch for count half.
    pub fn detect(&self, bytes: &[u8]) -> Detection {
        if let Some((encoding, _)) = Encoding::for_bom(bytes) {
            return Detection {
                encoding,
                confidence: 1.0,
            };
        }

        let utf8 = utf8_confidence(bytes);
        if utf8 >= self.confidence_threshold {
            return Detection {
                encoding: UTF_8,
                confidence: utf8,
            };
        }

        let mut detector = EncodingDetector::new();
        detector.feed(bytes, true);
        let (encoding, vouched) = detector.guess_assess(None, false);
        let printable = legacy_confidence(encoding, bytes);

        Detection {
            encoding,
            confidence: if vouched { printable } else { printable * 0.5 },
        }
    }

    /// Detect the encoding and decode, falling back to lossy UTF-8.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let detection = self.detect(bytes);
        let encoding = if detection.confidence >= self.confidence_threshold {
            detection.encoding
        } else {
            debug!(
                guess = detection.encoding.name(),
                confidence = detection.confidence,
                "Low-confidence encoding guess, decoding as UTF-8"
            );
            UTF_8
        };

        let (text, used, had_errors) = encoding.decode(bytes);
        if had_errors {
            debug!(encoding = used.name(), "Replaced undecodable bytes in process output");
        }
        text.into_owned()
    }
}

/// Decode `bytes` with the default detector threshold.
pub fn detect_and_decode(bytes: &[u8]) -> String {
    ResponseDecoder::default().decode(bytes)
}

fn utf8_confidence(bytes: &[u8]) -> f32 {
    let mut rest = bytes;
    let mut valid_high = 0usize;
    let mut invalid = 0usize;

    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                valid_high += count_non_ascii(s.as_bytes());
                break;
            }
            Err(e) => {
                let (good, after) = rest.split_at(e.valid_up_to());
                valid_high += count_non_ascii(good);
                let bad = e.error_len().unwrap_or(after.len());
                invalid += bad;
                rest = &after[bad..];
            }
        }
    }

    ratio(valid_high, valid_high + invalid)
}

fn legacy_confidence(encoding: &'static Encoding, bytes: &[u8]) -> f32 {
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    let mut high = 0usize;
    let mut printable = 0usize;
    for c in text.chars().filter(|c| !c.is_ascii()) {
        high += 1;
        // C1 controls stand in for bytes the encoding leaves undefined
        if c != char::REPLACEMENT_CHARACTER && !('\u{80}'..='\u{9F}').contains(&c) {
            printable += 1;
        }
    }
    ratio(printable, high)
}

fn count_non_ascii(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| !b.is_ascii()).count()
}

fn ratio(part: usize, total: usize) -> f32 {
    if total == 0 {
        1.0
    } else {
        part as f32 / total as f32
    }
}

/// Strip prompt echo and role delimiters from decoded output.
///
/// Applied once, in a fixed order:
/// 1. keep only what follows the last `assistant_prefix`, if present;
/// 2. remove every `system_prefix`, `user_prefix`, `assistant_prefix`,
///    `assistant_suffix` and system prompt occurrence, in that order;
/// 3. cut at the first remaining `assistant_suffix`;
/// 4. trim surrounding whitespace.
///
/// Matching is literal; empty markers are skipped.
pub fn clean(raw: &str, format: &ChatFormat, system_prompt: &str) -> String {
    let continuation = match raw.rfind(format.assistant_prefix.as_str()) {
        Some(idx) if !format.assistant_prefix.is_empty() => {
            &raw[idx + format.assistant_prefix.len()..]
        }
        _ => raw,
    };

    let mut text = continuation.to_string();
    for marker in [
        format.system_prefix.as_str(),
        format.user_prefix.as_str(),
        format.assistant_prefix.as_str(),
        format.assistant_suffix.as_str(),
        system_prompt,
    ] {
        if !marker.is_empty() && text.contains(marker) {
            text = text.replace(marker, "");
        }
    }

    if !format.assistant_suffix.is_empty() {
        if let Some(idx) = text.find(format.assistant_suffix.as_str()) {
            text.truncate(idx);
        }
    }

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tagged() -> ChatFormat {
        ChatFormat {
            system_prefix: "<|system|>".into(),
            user_prefix: "<|user|>".into(),
            assistant_prefix: "<|assistant|>".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_strips_prompt_echo() {
        let raw = "<|system|>S<|user|>Hi<|assistant|>Hello there";
        assert_eq!(clean(raw, &tagged(), "S"), "Hello there");
    }

    #[test]
    fn test_clean_without_markers_only_trims() {
        let raw = "  The capital of France is Paris.\n";
        assert_eq!(
            clean(raw, &tagged(), "You are helpful."),
            "The capital of France is Paris."
        );
    }

    #[test]
    fn test_clean_is_literal_not_fuzzy() {
        // Near-misses of the markers are legitimate content
        let raw = "Use <|user> or <user|> tags, not |assistant|.";
        assert_eq!(clean(raw, &tagged(), "SYS"), raw);
    }

    #[test]
    fn test_clean_uses_last_assistant_prefix() {
        let raw = "<|assistant|>first<|user|>again<|assistant|> second ";
        assert_eq!(clean(raw, &tagged(), ""), "second");
    }

    #[test]
    fn test_clean_removes_repeated_markers_mid_stream() {
        let format = ChatFormat {
            assistant_suffix: "</s>".into(),
            ..tagged()
        };
        let raw = "<|assistant|>Paris<|user|> is</s> the capital";
        // The suffix is removed with the other markers before truncation runs
        assert_eq!(clean(raw, &format, "SYS"), "Paris is the capital");
    }

    #[test]
    fn test_clean_truncates_at_spliced_suffix() {
        let format = ChatFormat {
            assistant_suffix: "</s>".into(),
            ..tagged()
        };
        // Removing the system prompt last joins "</" and "s>" into a fresh suffix
        let raw = "<|assistant|>answer</SYSs> trailing noise";
        assert_eq!(clean(raw, &format, "SYS"), "answer");
    }

    #[test]
    fn test_clean_removes_system_prompt_text() {
        let raw = "Be concise. Sure, here it is. Be concise.";
        assert_eq!(clean(raw, &tagged(), "Be concise."), "Sure, here it is.");
    }

    #[test]
    fn test_decode_utf8() {
        assert_eq!(detect_and_decode("héllo wörld".as_bytes()), "héllo wörld");
        assert_eq!(detect_and_decode(b""), "");
    }

    #[test]
    fn test_decode_latin1() {
        let decoder = ResponseDecoder::default();
        let bytes = b"caf\xe9 cr\xe8me";
        let detection = decoder.detect(bytes);
        assert_ne!(detection.encoding, UTF_8);
        assert!(detection.confidence >= decoder.confidence_threshold());
        assert_eq!(decoder.decode(bytes), "café crème");
    }

    #[test]
    fn test_decode_mostly_utf8_is_lossy() {
        let mut bytes = "héllo wörld ".as_bytes().to_vec();
        bytes.push(0xFF);
        let text = detect_and_decode(&bytes);
        assert_eq!(text, "héllo wörld \u{FFFD}");
    }

    #[test]
    fn test_low_confidence_falls_back_to_utf8() {
        // Undefined Windows-1252 bytes only: neither guess is credible
        let decoder = ResponseDecoder::new(0.9);
        let text = decoder.decode(b"ok \x81\x8d\x8f");
        assert!(text.starts_with("ok "));
        assert_eq!(text.matches('\u{FFFD}').count(), 3);
    }

    #[test]
    fn test_bom_is_respected() {
        let bytes = [0xFF, 0xFE, b'h', 0x00, b'i', 0x00];
        assert_eq!(detect_and_decode(&bytes), "hi");
    }

    proptest! {
        #[test]
        fn test_decode_never_fails(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = detect_and_decode(&bytes);
        }

        #[test]
        fn test_clean_returns_continuation(
            echo in "[A-Za-z .]{0,40}",
            answer in "[a-z0-9 ]{0,40}",
        ) {
            let format = tagged();
            let raw = format!("{}{}", format.format("Be brief.", &echo), answer);
            let cleaned = clean(&raw, &format, "Be brief.");

            prop_assert_eq!(cleaned.as_str(), answer.trim());
            prop_assert!(!cleaned.contains("<|"));
        }
    }
}
