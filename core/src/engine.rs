//! Emulation engine interface.
//!
//! The engine executing the loaded image is an external collaborator; the
//! core drives it through this narrow trait. The important contract is
//! around [`Engine::start`]: the supplied callback is invoked exactly once,
//! with the base image, at the moment the image becomes available and
//! before execution begins. Whatever the callback returns is the image the
//! engine runs, which makes startup deterministic with respect to patch
//! application.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use modhost_shared::ImageHeader;

/// Callback handed to [`Engine::start`].
///
/// Receives the base image and synchronously returns the image to run.
pub type PatchFn<'a> = Box<dyn FnOnce(Vec<u8>) -> Vec<u8> + 'a>;

/// Narrow interface to the emulation engine.
pub trait Engine {
    /// Parse the header of the currently loaded image.
    fn image_header(&self) -> Result<ImageHeader>;

    /// Copy of the currently loaded image buffer.
    fn loaded_image(&self) -> Vec<u8>;

    /// Size of the image as originally loaded.
    fn original_size(&self) -> usize;

    /// Write bytes into the loaded image buffer.
    fn write_image(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Select the directory the engine persists saves into.
    fn set_save_dir(&mut self, dir: &Path);

    /// Start execution. `patch` runs exactly once against the base image.
    fn start(&mut self, patch: PatchFn<'_>) -> Result<()>;

    /// Whether the engine finished starting up.
    fn is_ready(&self) -> bool;

    /// Stop execution.
    fn stop(&mut self);
}

/// In-memory engine used by the host role and by tests.
///
/// Holds the image buffer but executes nothing.
pub struct StubEngine {
    image: Vec<u8>,
    original_size: usize,
    save_dir: Option<PathBuf>,
    started: bool,
    ready: bool,
}

impl StubEngine {
    pub fn new(image: Vec<u8>) -> Self {
        let original_size = image.len();
        Self {
            image,
            original_size,
            save_dir: None,
            started: false,
            ready: false,
        }
    }

    /// Direct view of the image buffer (test inspection).
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn save_dir(&self) -> Option<&Path> {
        self.save_dir.as_deref()
    }
}

impl Engine for StubEngine {
    fn image_header(&self) -> Result<ImageHeader> {
        Ok(ImageHeader::parse(&self.image)?)
    }

    fn loaded_image(&self) -> Vec<u8> {
        self.image.clone()
    }

    fn original_size(&self) -> usize {
        self.original_size
    }

    fn write_image(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.image.len());
        match end {
            Some(end) => {
                self.image[offset..end].copy_from_slice(data);
                Ok(())
            }
            None => bail!(
                "write of {} bytes at {offset} exceeds image size {}",
                data.len(),
                self.image.len()
            ),
        }
    }

    fn set_save_dir(&mut self, dir: &Path) {
        self.save_dir = Some(dir.to_path_buf());
    }

    fn start(&mut self, patch: PatchFn<'_>) -> Result<()> {
        if self.started {
            bail!("engine already started");
        }
        self.image = patch(std::mem::take(&mut self.image));
        self.started = true;
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn stop(&mut self) {
        self.ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_image;

    #[test]
    fn start_runs_patch_callback_on_base_image() {
        let mut engine = StubEngine::new(test_image("GAME", "GM01"));
        engine
            .start(Box::new(|mut image| {
                image[0] = 0xAB;
                image
            }))
            .unwrap();
        assert!(engine.is_ready());
        assert_eq!(engine.image()[0], 0xAB);
    }

    #[test]
    fn start_twice_fails() {
        let mut engine = StubEngine::new(test_image("GAME", "GM01"));
        engine.start(Box::new(|image| image)).unwrap();
        assert!(engine.start(Box::new(|image| image)).is_err());
    }

    #[test]
    fn header_comes_from_image_bytes() {
        let engine = StubEngine::new(test_image("STARFIELD", "SFQE"));
        let header = engine.image_header().unwrap();
        assert_eq!(header.id, "SFQE");
        assert_eq!(header.title, "STARFIELD");
    }

    #[test]
    fn write_image_bounds_checked() {
        let mut engine = StubEngine::new(test_image("GAME", "GM01"));
        let size = engine.original_size();
        assert!(engine.write_image(size - 1, &[0, 0]).is_err());
        assert!(engine.write_image(size - 1, &[0]).is_ok());
    }
}
