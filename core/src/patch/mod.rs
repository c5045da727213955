//! Pluggable binary-patch pipeline.
//!
//! A [`PatchRegistry`] maps a file-suffix-like format identifier (".bps",
//! ".txt", ".mpk") to a stateless [`PatchCodec`] that derives a patched
//! image from a base image and a patch payload. Codecs are registered once
//! at startup; the startup runner looks the codec up by the suffix of the
//! patch artifact carried in the session config.
//!
//! Applying an empty payload is always a no-op that returns the base
//! unchanged, so callers do not need to special-case "no patch configured".

use hashbrown::HashMap;

pub mod archive;
pub mod bps;
pub mod text;

pub use archive::ArchiveCodec;
pub use bps::BpsCodec;
pub use text::TextCodec;

/// Rejection produced by a codec itself.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The patch payload is malformed.
    #[error("corrupt patch: {0}")]
    Corrupt(String),
    /// The patch is well-formed but does not fit this base image.
    #[error("patch does not match image: {0}")]
    Mismatch(String),
    /// A write falls outside the base image.
    #[error("write out of range: offset {offset}, len {len}, image {image}")]
    OutOfRange {
        offset: usize,
        len: usize,
        image: usize,
    },
}

/// Patch application failure as seen by callers of the registry.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("no patch codec registered for format '{0}'")]
    UnknownFormat(String),
    #[error("codec '{format}' rejected the patch: {source}")]
    Codec {
        format: String,
        #[source]
        source: CodecError,
    },
}

/// A stateless patch algorithm.
pub trait PatchCodec {
    /// Derive the patched image. Must not mutate `base`.
    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Registry of interchangeable patch codecs, keyed by format identifier.
pub struct PatchRegistry {
    codecs: HashMap<String, Box<dyn PatchCodec>>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in codecs registered.
    pub fn with_default_codecs() -> Self {
        let mut registry = Self::new();
        registry.register(".bps", Box::new(BpsCodec));
        registry.register(".txt", Box::new(TextCodec));
        registry.register(".mpk", Box::new(ArchiveCodec));
        registry
    }

    /// Register a codec under a format identifier.
    ///
    /// A duplicate identifier replaces the earlier codec; the replacement is
    /// logged as a configuration diagnostic.
    pub fn register(&mut self, format: &str, codec: Box<dyn PatchCodec>) {
        if self.codecs.insert(format.to_string(), codec).is_some() {
            tracing::warn!(format, "patch codec replaced by later registration");
        }
    }

    pub fn contains(&self, format: &str) -> bool {
        self.codecs.contains_key(format)
    }

    /// Apply a patch payload to a base image.
    ///
    /// An empty payload returns the base unchanged without consulting any
    /// codec.
    pub fn apply(&self, format: &str, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
        if patch.is_empty() {
            return Ok(base.to_vec());
        }
        let codec = self
            .codecs
            .get(format)
            .ok_or_else(|| PatchError::UnknownFormat(format.to_string()))?;
        codec.apply(base, patch).map_err(|source| PatchError::Codec {
            format: format.to_string(),
            source,
        })
    }
}

impl Default for PatchRegistry {
    fn default() -> Self {
        Self::with_default_codecs()
    }
}

/// Format identifier for a patch artifact name ("mods/fix.bps" -> ".bps").
pub fn format_id(patch_name: &str) -> Option<String> {
    let ext = std::path::Path::new(patch_name).extension()?;
    Some(format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperCodec;

    impl PatchCodec for UpperCodec {
        fn apply(&self, base: &[u8], _patch: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(base.to_ascii_uppercase())
        }
    }

    struct RejectingCodec;

    impl PatchCodec for RejectingCodec {
        fn apply(&self, _base: &[u8], _patch: &[u8]) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Corrupt("always rejects".to_string()))
        }
    }

    #[test]
    fn empty_payload_is_noop() {
        let registry = PatchRegistry::with_default_codecs();
        let base = b"unchanged".to_vec();
        let out = registry.apply(".bps", &base, &[]).unwrap();
        assert_eq!(out, base);
        // Even for formats nobody registered.
        let out = registry.apply(".xyz", &base, &[]).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn unknown_format_fails() {
        let registry = PatchRegistry::new();
        let err = registry.apply(".bps", b"base", b"patch").unwrap_err();
        assert!(matches!(err, PatchError::UnknownFormat(f) if f == ".bps"));
    }

    #[test]
    fn codec_rejection_is_wrapped() {
        let mut registry = PatchRegistry::new();
        registry.register(".bad", Box::new(RejectingCodec));
        let err = registry.apply(".bad", b"base", b"x").unwrap_err();
        assert!(matches!(err, PatchError::Codec { format, .. } if format == ".bad"));
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = PatchRegistry::new();
        registry.register(".up", Box::new(RejectingCodec));
        registry.register(".up", Box::new(UpperCodec));
        let out = registry.apply(".up", b"abc", b"x").unwrap();
        assert_eq!(out, b"ABC");
    }

    #[test]
    fn format_id_from_artifact_name() {
        assert_eq!(format_id("mods/fix.bps").as_deref(), Some(".bps"));
        assert_eq!(format_id("Fix.TXT").as_deref(), Some(".txt"));
        assert_eq!(format_id("no-extension"), None);
    }
}
