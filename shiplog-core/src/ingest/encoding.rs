//! Byte-encoding detection for machine-written files.
//!
//! Machines in the field write UTF-8, but Windows toolchains leave BOMs
//! and the odd logger emits UTF-16. Detection never fails: on ambiguity we
//! pick UTF-8 and flag the file descriptor so the drop counters can be
//! read in context.

use encoding_rs::{Decoder, Encoding, UTF_8, UTF_16BE, UTF_16LE};

/// Result of sniffing the head of a file.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub encoding: &'static Encoding,
    /// Length of the byte-order mark to skip, 0 if none.
    pub bom_len: usize,
    /// True when the bytes were not clearly any supported encoding and
    /// UTF-8 was assumed.
    pub ambiguous: bool,
}

/// Null-byte share above which a BOM-less sample is suspected UTF-16.
const NULL_RATIO_THRESHOLD: f64 = 0.10;
/// Share of nulls on one byte parity needed to call the endianness.
const PARITY_DECISIVE: f64 = 0.8;

/// Sniff `first_bytes` (the reader hands in up to 4 KiB). Order: explicit
/// BOM, then a null-byte heuristic for BOM-less UTF-16, then a UTF-8
/// validity check, defaulting to UTF-8.
pub fn detect(first_bytes: &[u8]) -> Detection {
    if let Some((encoding, bom_len)) = Encoding::for_bom(first_bytes) {
        return Detection {
            encoding,
            bom_len,
            ambiguous: false,
        };
    }

    if first_bytes.is_empty() {
        return Detection {
            encoding: UTF_8,
            bom_len: 0,
            ambiguous: false,
        };
    }

    let nulls = first_bytes.iter().filter(|b| **b == 0).count();
    let null_ratio = nulls as f64 / first_bytes.len() as f64;
    if null_ratio > NULL_RATIO_THRESHOLD {
        // ASCII-heavy UTF-16 has its null bytes on one parity: odd offsets
        // for little-endian, even for big-endian.
        let odd_nulls = first_bytes
            .iter()
            .enumerate()
            .filter(|(i, b)| i % 2 == 1 && **b == 0)
            .count();
        let even_nulls = nulls - odd_nulls;
        if odd_nulls as f64 >= nulls as f64 * PARITY_DECISIVE {
            return Detection {
                encoding: UTF_16LE,
                bom_len: 0,
                ambiguous: false,
            };
        }
        if even_nulls as f64 >= nulls as f64 * PARITY_DECISIVE {
            return Detection {
                encoding: UTF_16BE,
                bom_len: 0,
                ambiguous: false,
            };
        }
        return Detection {
            encoding: UTF_8,
            bom_len: 0,
            ambiguous: true,
        };
    }

    match std::str::from_utf8(first_bytes) {
        Ok(_) => Detection {
            encoding: UTF_8,
            bom_len: 0,
            ambiguous: false,
        },
        Err(error) => {
            // A truncated multi-byte sequence at the end of the sample is
            // expected; anything earlier means the bytes are suspect.
            let truncation = first_bytes.len() - error.valid_up_to() <= 4
                && error.error_len().is_none();
            Detection {
                encoding: UTF_8,
                bom_len: 0,
                ambiguous: !truncation,
            }
        }
    }
}

/// Incremental decoder that turns raw chunks into complete lines.
///
/// Carries the partial trailing line between chunks; `finish` flushes a
/// final unterminated line, so files without a trailing newline still
/// yield their last record.
pub struct LineDecoder {
    decoder: Decoder,
    pending: String,
}

impl std::fmt::Debug for LineDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineDecoder")
            .field("encoding", &self.decoder.encoding().name())
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}

impl LineDecoder {
    pub fn new(detection: &Detection) -> Self {
        Self {
            decoder: detection.encoding.new_decoder_with_bom_removal(),
            pending: String::new(),
        }
    }

    /// Decode a chunk and append any completed lines to `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        self.decode(bytes, false);
        self.split_lines(out);
    }

    /// Signal end-of-input and flush the final line, if any.
    pub fn finish(&mut self, out: &mut Vec<String>) {
        self.decode(&[], true);
        self.split_lines(out);
        if !self.pending.is_empty() {
            out.push(std::mem::take(&mut self.pending));
        }
    }

    fn decode(&mut self, bytes: &[u8], last: bool) {
        let needed = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 4 + 16);
        self.pending.reserve(needed);
        let (_result, _read, had_errors) = self.decoder.decode_to_string(bytes, &mut self.pending, last);
        if had_errors {
            // Replacement characters flow through; malformed JSON lines
            // are dropped downstream with a counter.
            tracing::debug!("undecodable bytes replaced during line decode");
        }
    }

    fn split_lines(&mut self, out: &mut Vec<String>) {
        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop(); // the newline
            if line.ends_with('\r') {
                line.pop();
            }
            out.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bom_wins() {
        let detection = detect(b"\xEF\xBB\xBF{\"id\":\"r1\"}");
        assert_eq!(detection.encoding, UTF_8);
        assert_eq!(detection.bom_len, 3);
        assert!(!detection.ambiguous);

        let detection = detect(b"\xFF\xFE{\x00\"\x00");
        assert_eq!(detection.encoding, UTF_16LE);
        assert_eq!(detection.bom_len, 2);
    }

    #[test]
    fn bomless_utf16le_by_null_parity() {
        let text: Vec<u8> = "{\"id\":\"r1\"}\n"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let detection = detect(&text);
        assert_eq!(detection.encoding, UTF_16LE);
        assert!(!detection.ambiguous);
    }

    #[test]
    fn plain_utf8_is_unambiguous() {
        let detection = detect(b"{\"id\":\"r1\",\"message\":\"ok\"}\n");
        assert_eq!(detection.encoding, UTF_8);
        assert!(!detection.ambiguous);
    }

    #[test]
    fn truncated_multibyte_tail_is_fine() {
        // A 4 KiB window can cut a UTF-8 character in half.
        let mut bytes = "{\"message\":\"температура\"}".as_bytes().to_vec();
        bytes.truncate(bytes.len() - 1);
        let detection = detect(&bytes);
        assert_eq!(detection.encoding, UTF_8);
        assert!(!detection.ambiguous);
    }

    #[test]
    fn binary_noise_is_ambiguous_utf8() {
        let detection = detect(&[0xC3, 0x28, 0xA0, 0xFF, 0x01, 0x02]);
        assert_eq!(detection.encoding, UTF_8);
        assert!(detection.ambiguous);
    }

    #[test]
    fn decoder_splits_lines_across_chunks() {
        let detection = detect(b"{\"a\":1}");
        let mut decoder = LineDecoder::new(&detection);
        let mut lines = Vec::new();
        decoder.feed(b"{\"a\":1}\n{\"b\"", &mut lines);
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
        decoder.feed(b":2}\r\n", &mut lines);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "{\"b\":2}");
        decoder.finish(&mut lines);
        assert_eq!(lines.len(), 2, "no phantom trailing line");
    }

    #[test]
    fn decoder_flushes_unterminated_final_line() {
        let detection = detect(b"{\"a\":1}");
        let mut decoder = LineDecoder::new(&detection);
        let mut lines = Vec::new();
        decoder.feed(b"{\"a\":1}", &mut lines);
        assert!(lines.is_empty());
        decoder.finish(&mut lines);
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn utf16_roundtrip_through_decoder() {
        let body = "{\"id\":\"r1\"}\n{\"id\":\"r2\"}\n";
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(body.encode_utf16().flat_map(|unit| unit.to_le_bytes()));

        let detection = detect(&bytes);
        let mut decoder = LineDecoder::new(&detection);
        let mut lines = Vec::new();
        decoder.feed(&bytes, &mut lines);
        decoder.finish(&mut lines);
        assert_eq!(lines, vec!["{\"id\":\"r1\"}", "{\"id\":\"r2\"}"]);
    }
}
