//! The remote-item value type shared by every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse classification of a remote item, used by callers to decide how to
/// render or handle it without inspecting MIME types themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Directory,
    Image,
    Video,
    Audio,
    Document,
    Unknown,
}

impl ItemKind {
    /// Best-effort classification from a file extension, matched
    /// case-insensitively.
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "svg" => ItemKind::Image,
            "mp4" | "mkv" | "mov" | "avi" | "webm" => ItemKind::Video,
            "mp3" | "wav" | "flac" | "ogg" | "m4a" => ItemKind::Audio,
            "pdf" | "doc" | "docx" | "txt" | "md" | "odt" => ItemKind::Document,
            _ => ItemKind::Unknown,
        }
    }
}

/// An immutable snapshot of a single remote file or directory.
///
/// `renamed` returns a new `Item` rather than mutating in place — callers
/// hold an `Item` as a value, not a handle the provider can invalidate
/// underneath them. Move/rename verbs on `CloudAccess` likewise return a
/// freshly parsed `Item` from the provider's response rather than patching
/// the caller's copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub filename: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub kind: ItemKind,
    /// A direct, provider-resolved URL to the item's bytes, when the
    /// provider can produce one without a full download round trip (e.g.
    /// AnimeZone's `getDaemonUrl`).
    pub content_url: Option<String>,
}

impl Item {
    pub fn directory(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Item {
            id: id.into(),
            filename: filename.into(),
            size: None,
            modified: None,
            kind: ItemKind::Directory,
            content_url: None,
        }
    }

    pub fn file(id: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        let filename = filename.into();
        let kind = filename
            .rsplit_once('.')
            .map(|(_, ext)| ItemKind::from_extension(ext))
            .unwrap_or(ItemKind::Unknown);
        Item {
            id: id.into(),
            filename,
            size: Some(size),
            modified: None,
            kind,
            content_url: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    pub fn extension(&self) -> Option<&str> {
        self.filename.rsplit_once('.').map(|(_, ext)| ext)
    }

    /// Returns a copy of this item with a new display name.
    pub fn renamed(&self, filename: impl Into<String>) -> Self {
        Item {
            filename: filename.into(),
            ..self.clone()
        }
    }
}
