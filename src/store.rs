//! Latest-upload slot store.
//!
//! The dashboard keeps exactly one uploaded image. Storing a new image
//! overwrites the slot and destroys the previous one, including a
//! previous image of the other format; there is no retention and no
//! versioning. Reads resolve only the two fixed slot filenames, so
//! request paths can never reach other files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};

/// Upload image format accepted by the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    pub fn slot_filename(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "latest_upload.jpg",
            ImageKind::Png => "latest_upload.png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
        }
    }

    fn other(self) -> Self {
        match self {
            ImageKind::Jpeg => ImageKind::Png,
            ImageKind::Png => ImageKind::Jpeg,
        }
    }

    fn from_slot_filename(filename: &str) -> Option<Self> {
        match filename {
            "latest_upload.jpg" => Some(ImageKind::Jpeg),
            "latest_upload.png" => Some(ImageKind::Png),
            _ => None,
        }
    }
}

/// A conforming upload filename must carry a jpg/jpeg/png extension.
/// Positive allowlist to avoid trivial bypasses; the name itself is
/// never used as a path, only its extension selects the slot format.
pub fn validate_upload_filename(filename: &str) -> Result<ImageKind> {
    static UPLOAD_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UPLOAD_NAME_RE
        .get_or_init(|| regex::Regex::new(r"^.{1,128}\.(jpe?g|png)$").unwrap());

    let lower = filename.to_lowercase();
    let caps = re
        .captures(&lower)
        .ok_or_else(|| anyhow!("invalid file type '{}': use jpg or png", filename))?;
    match caps.get(1).map(|m| m.as_str()) {
        Some("png") => Ok(ImageKind::Png),
        _ => Ok(ImageKind::Jpeg),
    }
}

/// Single-slot store for the most recent upload.
pub struct UploadSlot {
    dir: PathBuf,
}

impl UploadSlot {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create upload dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store a new latest image, returning its slot filename. Any
    /// previously stored image is destroyed.
    pub fn store(&self, kind: ImageKind, bytes: &[u8]) -> Result<&'static str> {
        let path = self.dir.join(kind.slot_filename());
        fs::write(&path, bytes)
            .with_context(|| format!("write upload {}", path.display()))?;

        let other = self.dir.join(kind.other().slot_filename());
        if other.exists() {
            fs::remove_file(&other)
                .with_context(|| format!("remove stale upload {}", other.display()))?;
        }
        Ok(kind.slot_filename())
    }

    /// Read a slot file by name. Only the two slot filenames resolve;
    /// anything else reads as absent.
    pub fn read(&self, filename: &str) -> Result<Option<(Vec<u8>, &'static str)>> {
        let Some(kind) = ImageKind::from_slot_filename(filename) else {
            return Ok(None);
        };
        let path = self.dir.join(kind.slot_filename());
        match fs::read(&path) {
            Ok(bytes) => Ok(Some((bytes, kind.content_type()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("read upload {}", path.display()))
            }
        }
    }

    /// Slot filename of the current latest image, if one exists.
    pub fn latest(&self) -> Option<&'static str> {
        [ImageKind::Jpeg, ImageKind::Png]
            .into_iter()
            .find(|kind| self.dir.join(kind.slot_filename()).exists())
            .map(ImageKind::slot_filename)
    }
}
