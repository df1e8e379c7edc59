//! Metadata entities for syncable entries in a shared folder.
//!
//! Every entry is a tagged variant: folders and documents carry only identity
//! and version, binary kinds additionally require a content hash, sync time,
//! and mimetype.

use serde::{Deserialize, Serialize};

/// Kind of a syncable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaKind {
    /// Directory entry
    Folder,
    /// Plain-text collaborative document
    Document,
    /// Image file
    Image,
    /// PDF file
    Pdf,
    /// Audio file
    Audio,
    /// Video file
    Video,
    /// Any other binary file
    File,
}

impl std::fmt::Display for MetaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetaKind::Folder => "folder",
            MetaKind::Document => "document",
            MetaKind::Image => "image",
            MetaKind::Pdf => "pdf",
            MetaKind::Audio => "audio",
            MetaKind::Video => "video",
            MetaKind::File => "file",
        };
        write!(f, "{}", name)
    }
}

/// Fields shared by all binary entry kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryFields {
    /// Stable entry id
    pub id: String,
    /// Protocol version
    #[serde(default)]
    pub version: u32,
    /// Hex-encoded content digest
    pub hash: String,
    /// Unix timestamp of last sync (milliseconds)
    pub synctime: i64,
    /// MIME type
    pub mimetype: String,
}

/// Metadata for one syncable entry, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Meta {
    /// Directory entry
    Folder {
        /// Stable entry id
        id: String,
        /// Protocol version
        #[serde(default)]
        version: u32,
    },
    /// Plain-text collaborative document
    Document {
        /// Stable entry id
        id: String,
        /// Protocol version
        #[serde(default)]
        version: u32,
    },
    /// Image file
    Image(BinaryFields),
    /// PDF file
    Pdf(BinaryFields),
    /// Audio file
    Audio(BinaryFields),
    /// Video file
    Video(BinaryFields),
    /// Any other binary file
    File(BinaryFields),
}

impl Meta {
    /// Create a folder entry.
    pub fn folder(id: impl Into<String>) -> Self {
        Meta::Folder {
            id: id.into(),
            version: 0,
        }
    }

    /// Create a document entry.
    pub fn document(id: impl Into<String>) -> Self {
        Meta::Document {
            id: id.into(),
            version: 0,
        }
    }

    /// Create a binary entry of the given kind.
    pub fn binary(
        kind: MetaKind,
        id: impl Into<String>,
        hash: impl Into<String>,
        synctime: i64,
        mimetype: impl Into<String>,
    ) -> Self {
        let fields = BinaryFields {
            id: id.into(),
            version: 0,
            hash: hash.into(),
            synctime,
            mimetype: mimetype.into(),
        };
        match kind {
            MetaKind::Image => Meta::Image(fields),
            MetaKind::Pdf => Meta::Pdf(fields),
            MetaKind::Audio => Meta::Audio(fields),
            MetaKind::Video => Meta::Video(fields),
            // Folders and documents are not binary kinds; fall through to the
            // generic file entry rather than inventing one.
            MetaKind::Folder | MetaKind::Document | MetaKind::File => Meta::File(fields),
        }
    }

    /// Stable entry id.
    pub fn id(&self) -> &str {
        match self {
            Meta::Folder { id, .. } | Meta::Document { id, .. } => id,
            Meta::Image(f) | Meta::Pdf(f) | Meta::Audio(f) | Meta::Video(f) | Meta::File(f) => {
                &f.id
            }
        }
    }

    /// Protocol version.
    pub fn version(&self) -> u32 {
        match self {
            Meta::Folder { version, .. } | Meta::Document { version, .. } => *version,
            Meta::Image(f) | Meta::Pdf(f) | Meta::Audio(f) | Meta::Video(f) | Meta::File(f) => {
                f.version
            }
        }
    }

    /// Kind tag.
    pub fn kind(&self) -> MetaKind {
        match self {
            Meta::Folder { .. } => MetaKind::Folder,
            Meta::Document { .. } => MetaKind::Document,
            Meta::Image(_) => MetaKind::Image,
            Meta::Pdf(_) => MetaKind::Pdf,
            Meta::Audio(_) => MetaKind::Audio,
            Meta::Video(_) => MetaKind::Video,
            Meta::File(_) => MetaKind::File,
        }
    }

    /// Whether this is a folder entry.
    pub fn is_folder(&self) -> bool {
        matches!(self, Meta::Folder { .. })
    }

    /// Whether this is a document entry.
    pub fn is_document(&self) -> bool {
        matches!(self, Meta::Document { .. })
    }
}

/// Maps file extensions to entry kinds and mimetypes.
///
/// Legacy migration only knows paths, so the registry decides what kind of
/// entry a path becomes. Unknown extensions default to the generic file kind.
pub struct TypeRegistry;

impl TypeRegistry {
    /// Entry kind for a path, by extension.
    pub fn kind_for_path(path: &str) -> MetaKind {
        match extension(path) {
            Some("md") | Some("txt") | Some("canvas") => MetaKind::Document,
            Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp") | Some("svg")
            | Some("bmp") => MetaKind::Image,
            Some("pdf") => MetaKind::Pdf,
            Some("mp3") | Some("wav") | Some("ogg") | Some("flac") | Some("m4a") => MetaKind::Audio,
            Some("mp4") | Some("mov") | Some("webm") | Some("mkv") | Some("avi") => MetaKind::Video,
            _ => MetaKind::File,
        }
    }

    /// MIME type for a path, by extension.
    pub fn mimetype_for_path(path: &str) -> String {
        let mime = match extension(path) {
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("svg") => "image/svg+xml",
            Some("bmp") => "image/bmp",
            Some("pdf") => "application/pdf",
            Some("mp3") => "audio/mpeg",
            Some("wav") => "audio/wav",
            Some("ogg") => "audio/ogg",
            Some("flac") => "audio/flac",
            Some("m4a") => "audio/mp4",
            Some("mp4") => "video/mp4",
            Some("mov") => "video/quicktime",
            Some("webm") => "video/webm",
            Some("mkv") => "video/x-matroska",
            Some("avi") => "video/x-msvideo",
            Some("md") => "text/markdown",
            Some("txt") => "text/plain",
            _ => "application/octet-stream",
        };
        mime.to_string()
    }

    /// Build a new entry for a path with the given id.
    ///
    /// Documents need no hash; binary kinds get an empty hash until their
    /// content is uploaded and [`crate::store::SyncStore::mark_uploaded`] runs.
    pub fn meta_for_new(path: &str, id: impl Into<String>, synctime: i64) -> Meta {
        match Self::kind_for_path(path) {
            MetaKind::Document => Meta::document(id),
            MetaKind::Folder => Meta::folder(id),
            kind => Meta::binary(kind, id, "", synctime, Self::mimetype_for_path(path)),
        }
    }
}

fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 >= name.len() {
        return None;
    }
    Some(&name[dot + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_path() {
        assert_eq!(TypeRegistry::kind_for_path("notes/a.md"), MetaKind::Document);
        assert_eq!(TypeRegistry::kind_for_path("img/Pasted.png"), MetaKind::Image);
        assert_eq!(TypeRegistry::kind_for_path("docs/manual.pdf"), MetaKind::Pdf);
        assert_eq!(TypeRegistry::kind_for_path("a/b/song.mp3"), MetaKind::Audio);
        assert_eq!(TypeRegistry::kind_for_path("clip.mov"), MetaKind::Video);
        // Unknown extensions fall back to the generic file kind.
        assert_eq!(TypeRegistry::kind_for_path("data.xyz"), MetaKind::File);
        assert_eq!(TypeRegistry::kind_for_path("no-extension"), MetaKind::File);
    }

    #[test]
    fn test_meta_accessors() {
        let folder = Meta::folder("F");
        assert_eq!(folder.id(), "F");
        assert_eq!(folder.kind(), MetaKind::Folder);
        assert!(folder.is_folder());

        let image = Meta::binary(MetaKind::Image, "I", "abc", 100, "image/png");
        assert_eq!(image.id(), "I");
        assert_eq!(image.kind(), MetaKind::Image);
        assert_eq!(image.version(), 0);
    }

    #[test]
    fn test_meta_serde_tagging() {
        let doc = Meta::document("D1");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"document\""));
        let back: Meta = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);

        let image = Meta::binary(MetaKind::Image, "I1", "hash", 5, "image/png");
        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains("\"type\":\"image\""));
        assert!(json.contains("\"mimetype\":\"image/png\""));
        let back: Meta = serde_json::from_str(&json).unwrap();
        assert_eq!(image, back);
    }

    #[test]
    fn test_meta_for_new_by_extension() {
        let doc = TypeRegistry::meta_for_new("a/b.md", "D", 0);
        assert!(doc.is_document());

        let unknown = TypeRegistry::meta_for_new("a/archive.xyz", "X", 7);
        assert_eq!(unknown.kind(), MetaKind::File);
        if let Meta::File(fields) = &unknown {
            assert_eq!(fields.mimetype, "application/octet-stream");
            assert_eq!(fields.synctime, 7);
        } else {
            panic!("expected file meta");
        }
    }
}
