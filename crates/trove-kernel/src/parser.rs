//! Metadata extraction seam.
//!
//! The checker calls [`MetadataParser::parse`] from a blocking worker thread,
//! so implementations may do synchronous I/O. Format-specific extraction
//! (audio tags, EXIF, container probing) plugs in here; the built-in
//! [`FsMetadataParser`] only records what the filesystem itself knows.

use std::path::Path;

use thiserror::Error;
use trove_types::{AttrValue, Attributes, TYPE_DIR, TYPE_FILE};

use crate::schema::{TYPE_AUDIO, TYPE_IMAGE, TYPE_VIDEO};

/// A single object could not be parsed.
#[derive(Debug, Error)]
#[error("cannot parse {path}: {reason}")]
pub struct ParseFailure {
    pub path: String,
    pub reason: String,
}

impl ParseFailure {
    pub fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// `parse(path) -> attributes | ParseFailure`.
pub trait MetadataParser: Send + Sync {
    fn parse(&self, path: &Path, object_type: &str) -> Result<Attributes, ParseFailure>;
}

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "oga", "opus", "m4a", "aac", "wav", "wma"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "m4v", "mpg", "mpeg", "wmv"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "heic"];

/// Object type for a path, from its extension.
pub fn classify_path(path: &Path, is_dir: bool) -> &'static str {
    if is_dir {
        return TYPE_DIR;
    }
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return TYPE_FILE;
    };
    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        TYPE_AUDIO
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        TYPE_VIDEO
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        TYPE_IMAGE
    } else {
        TYPE_FILE
    }
}

/// Filesystem-level attributes: `extension`, `size`, and a `title` fallback
/// (the file stem) for audio and video.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMetadataParser;

impl MetadataParser for FsMetadataParser {
    fn parse(&self, path: &Path, object_type: &str) -> Result<Attributes, ParseFailure> {
        let meta = std::fs::metadata(path).map_err(|e| ParseFailure::new(path, e.to_string()))?;
        let mut attrs = Attributes::new();
        if object_type == TYPE_DIR {
            return Ok(attrs);
        }
        if let Some(ext) = path.extension() {
            attrs.insert("extension".into(), AttrValue::Text(ext.to_string_lossy().into_owned()));
        }
        attrs.insert("size".into(), AttrValue::Int(meta.len() as i64));
        if (object_type == TYPE_AUDIO || object_type == TYPE_VIDEO)
            && let Some(stem) = path.file_stem()
        {
            attrs.insert("title".into(), AttrValue::Text(stem.to_string_lossy().into_owned()));
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify_path(Path::new("/m/A.MP3"), false), "audio");
        assert_eq!(classify_path(Path::new("/m/clip.mkv"), false), "video");
        assert_eq!(classify_path(Path::new("/m/cover.jpg"), false), "image");
        assert_eq!(classify_path(Path::new("/m/notes"), false), "file");
        assert_eq!(classify_path(Path::new("/m/album.mp3"), true), "dir");
    }

    #[test]
    fn fs_parser_reads_size_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Song.mp3");
        std::fs::write(&path, b"12345").unwrap();

        let attrs = FsMetadataParser.parse(&path, "audio").unwrap();
        assert_eq!(attrs["size"], AttrValue::Int(5));
        assert_eq!(attrs["extension"], AttrValue::from("mp3"));
        assert_eq!(attrs["title"], AttrValue::from("Song"));
    }

    #[test]
    fn missing_file_is_a_parse_failure() {
        let err = FsMetadataParser
            .parse(Path::new("/nonexistent/x.mp3"), "audio")
            .unwrap_err();
        assert!(err.to_string().starts_with("cannot parse /nonexistent/x.mp3"));
    }
}
