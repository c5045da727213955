//! Plain-text transform codec (".txt").
//!
//! One write per line, `offset: bytes`, both in hex:
//!
//! ```text
//! # widescreen fix
//! 0x1DA4: 40 38 00 00
//! 3B10: DEADBEEF
//! ```
//!
//! Offsets may carry a `0x` prefix; byte runs may be spaced or contiguous.
//! Everything after `#` is a comment.

use super::{CodecError, PatchCodec};

pub struct TextCodec;

impl PatchCodec for TextCodec {
    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, CodecError> {
        let text = std::str::from_utf8(patch)
            .map_err(|_| CodecError::Corrupt("patch is not valid UTF-8".to_string()))?;

        let mut target = base.to_vec();

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let (offset_part, bytes_part) = line.split_once(':').ok_or_else(|| {
                CodecError::Corrupt(format!("line {line_no}: expected 'offset: bytes'"))
            })?;

            let offset = parse_offset(offset_part.trim())
                .ok_or_else(|| CodecError::Corrupt(format!("line {line_no}: bad offset")))?;
            let bytes = parse_bytes(bytes_part)
                .ok_or_else(|| CodecError::Corrupt(format!("line {line_no}: bad byte run")))?;
            if bytes.is_empty() {
                return Err(CodecError::Corrupt(format!("line {line_no}: empty write")));
            }

            let end = offset.checked_add(bytes.len()).filter(|end| *end <= target.len());
            match end {
                Some(end) => target[offset..end].copy_from_slice(&bytes),
                None => {
                    return Err(CodecError::OutOfRange {
                        offset,
                        len: bytes.len(),
                        image: target.len(),
                    });
                }
            }
        }

        Ok(target)
    }
}

fn parse_offset(text: &str) -> Option<usize> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    usize::from_str_radix(digits, 16).ok()
}

fn parse_bytes(text: &str) -> Option<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&compact[i..i + 2], 16).ok())
        .collect()
}
