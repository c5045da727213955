//! Header data parsed from a loaded binary image.
//!
//! The header region carries the identifier used to fingerprint the image
//! when selecting a compatible core module. Layout of the header region:
//!
//! ```text
//! 0x20..0x34  title   (ASCII, space padded)
//! 0x3B..0x3F  game id (ASCII, the fingerprint)
//! ```

use serde::{Deserialize, Serialize};

/// Byte offset of the title field.
const TITLE_OFFSET: usize = 0x20;
/// Length of the title field.
const TITLE_LEN: usize = 0x14;
/// Byte offset of the game id field.
const GAME_ID_OFFSET: usize = 0x3B;
/// Length of the game id field.
const GAME_ID_LEN: usize = 4;

/// Smallest image that still carries a full header region.
pub const MIN_IMAGE_SIZE: usize = 0x40;

/// Errors produced while parsing an image header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageHeaderError {
    #[error("image too small for header: {0} bytes")]
    TooSmall(usize),
}

/// Parsed image header.
///
/// `id` is the fingerprint matched against core module descriptors; `title`
/// is display-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub id: String,
    pub title: String,
}

impl ImageHeader {
    /// Parse the header region of a loaded image.
    pub fn parse(image: &[u8]) -> Result<Self, ImageHeaderError> {
        if image.len() < MIN_IMAGE_SIZE {
            return Err(ImageHeaderError::TooSmall(image.len()));
        }

        let id = ascii_field(&image[GAME_ID_OFFSET..GAME_ID_OFFSET + GAME_ID_LEN]);
        let title = ascii_field(&image[TITLE_OFFSET..TITLE_OFFSET + TITLE_LEN]);

        Ok(Self { id, title })
    }
}

/// Decode a fixed ASCII field, dropping padding and non-printable bytes.
fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .copied()
        .filter(|b| b.is_ascii_graphic() || *b == b' ')
        .map(char::from)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal image with the given title and id in the header.
    pub fn test_image(title: &str, id: &str) -> Vec<u8> {
        let mut image = vec![0u8; MIN_IMAGE_SIZE * 4];
        let title_bytes = title.as_bytes();
        image[TITLE_OFFSET..TITLE_OFFSET + title_bytes.len()].copy_from_slice(title_bytes);
        let id_bytes = id.as_bytes();
        image[GAME_ID_OFFSET..GAME_ID_OFFSET + id_bytes.len()].copy_from_slice(id_bytes);
        image
    }

    #[test]
    fn parse_header_fields() {
        let image = test_image("STARFIELD QUEST", "SFQE");
        let header = ImageHeader::parse(&image).unwrap();
        assert_eq!(header.id, "SFQE");
        assert_eq!(header.title, "STARFIELD QUEST");
    }

    #[test]
    fn parse_rejects_truncated_image() {
        let image = vec![0u8; MIN_IMAGE_SIZE - 1];
        assert_eq!(
            ImageHeader::parse(&image),
            Err(ImageHeaderError::TooSmall(MIN_IMAGE_SIZE - 1))
        );
    }

    #[test]
    fn parse_strips_padding() {
        let image = test_image("PADDED  ", "AB");
        let header = ImageHeader::parse(&image).unwrap();
        assert_eq!(header.title, "PADDED");
        assert_eq!(header.id, "AB");
    }
}
