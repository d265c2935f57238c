use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Upload extensions accepted as still images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
/// Upload extensions accepted as videos.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "webm", "mkv"];

/// Lowercased extension of a client-supplied filename.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Uploaded bytes written to a temporary file for decoders that need a
/// path. The file is removed when this value is dropped.
pub struct StagedMedia {
    file: NamedTempFile,
}

impl StagedMedia {
    pub fn write(bytes: &[u8], extension: &str) -> Result<Self> {
        let suffix = format!(".{}", extension);
        let mut file = tempfile::Builder::new()
            .prefix("weapon-upload-")
            .suffix(&suffix)
            .tempfile()
            .context("create staging file")?;
        file.write_all(bytes).context("write staging file")?;
        file.flush().context("flush staging file")?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_lowercased() {
        assert_eq!(extension_of("CLIP.MP4").as_deref(), Some("mp4"));
        assert_eq!(extension_of("photo.jpeg").as_deref(), Some("jpeg"));
        assert_eq!(extension_of("noext"), None);
    }

    #[test]
    fn staged_file_is_removed_on_drop() {
        let staged = StagedMedia::write(b"fake video", "mp4").unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"fake video");
        drop(staged);
        assert!(!path.exists());
    }
}
