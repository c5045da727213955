//! Archive-based splice codec (".mpk").
//!
//! Container layout:
//!
//! ```text
//! "MPK1" | u16 version | lz4 block (size-prepended)
//! ```
//!
//! The decompressed block is a sequence of splice entries, each
//! `u32 offset | u32 length | bytes`, applied in order against the base
//! image. Every entry must land inside the base image.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{CodecError, PatchCodec};

const MAGIC: &[u8; 4] = b"MPK1";
const VERSION: u16 = 1;

pub struct ArchiveCodec;

impl ArchiveCodec {
    /// Build a container from `(offset, bytes)` splice entries.
    pub fn encode(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (offset, bytes) in entries {
            body.write_u32::<LittleEndian>(*offset).expect("vec write");
            body.write_u32::<LittleEndian>(bytes.len() as u32)
                .expect("vec write");
            body.extend_from_slice(bytes);
        }

        let mut container = Vec::with_capacity(body.len() / 2 + 8);
        container.extend_from_slice(MAGIC);
        container.write_u16::<LittleEndian>(VERSION).expect("vec write");
        container.extend_from_slice(&lz4_flex::compress_prepend_size(&body));
        container
    }
}

impl PatchCodec for ArchiveCodec {
    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, CodecError> {
        if patch.len() < MAGIC.len() + 2 {
            return Err(CodecError::Corrupt("container shorter than header".to_string()));
        }
        if &patch[..MAGIC.len()] != MAGIC {
            return Err(CodecError::Corrupt("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([patch[4], patch[5]]);
        if version != VERSION {
            return Err(CodecError::Corrupt(format!(
                "unsupported container version {version}"
            )));
        }

        let body = lz4_flex::decompress_size_prepended(&patch[6..])
            .map_err(|e| CodecError::Corrupt(format!("decompression failed: {e}")))?;

        let mut target = base.to_vec();
        let mut cursor = Cursor::new(body.as_slice());

        while (cursor.position() as usize) < body.len() {
            let offset = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| CodecError::Corrupt("truncated entry header".to_string()))?
                as usize;
            let len = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| CodecError::Corrupt("truncated entry header".to_string()))?
                as usize;

            let mut bytes = vec![0u8; len];
            cursor
                .read_exact(&mut bytes)
                .map_err(|_| CodecError::Corrupt("truncated entry data".to_string()))?;

            let end = offset.checked_add(len).filter(|end| *end <= target.len());
            match end {
                Some(end) => target[offset..end].copy_from_slice(&bytes),
                None => {
                    return Err(CodecError::OutOfRange {
                        offset,
                        len,
                        image: target.len(),
                    });
                }
            }
        }

        Ok(target)
    }
}
