use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse file family used to keep sub-groups apart inside a theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Documents,
    Spreadsheets,
    Presentations,
    Images,
    Audio,
    Video,
    Archives,
    Code,
    Other,
}

impl FileKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Documents => "Documents",
            Self::Spreadsheets => "Spreadsheets",
            Self::Presentations => "Presentations",
            Self::Images => "Images",
            Self::Audio => "Audio",
            Self::Video => "Video",
            Self::Archives => "Archives",
            Self::Code => "Code",
            Self::Other => "Other",
        }
    }

    #[must_use]
    pub fn from_extension(extension: Option<&str>) -> Self {
        extension
            .map(str::to_ascii_lowercase)
            .and_then(|ext| KIND_BY_EXTENSION.get(ext.as_str()).copied())
            .unwrap_or(Self::Other)
    }
}

static KIND_BY_EXTENSION: Lazy<HashMap<&'static str, FileKind>> = Lazy::new(|| {
    let table: &[(FileKind, &[&str])] = &[
        (
            FileKind::Documents,
            &["pdf", "doc", "docx", "txt", "md", "rtf", "odt", "pages", "epub", "tex"],
        ),
        (FileKind::Spreadsheets, &["xls", "xlsx", "csv", "ods", "numbers", "tsv"]),
        (FileKind::Presentations, &["ppt", "pptx", "key", "odp"]),
        (
            FileKind::Images,
            &["jpg", "jpeg", "png", "gif", "heic", "webp", "tiff", "bmp", "svg", "raw"],
        ),
        (FileKind::Audio, &["mp3", "wav", "flac", "aac", "m4a", "ogg"]),
        (FileKind::Video, &["mp4", "mov", "mkv", "avi", "webm", "m4v"]),
        (FileKind::Archives, &["zip", "tar", "gz", "rar", "7z", "dmg", "iso"]),
        (
            FileKind::Code,
            &["rs", "py", "js", "ts", "go", "java", "c", "cpp", "h", "swift", "rb", "sh", "json", "toml", "yaml", "yml"],
        ),
    ];
    let mut map = HashMap::new();
    for (kind, extensions) in table {
        for ext in *extensions {
            map.insert(*ext, *kind);
        }
    }
    map
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_extensions_case_insensitively() {
        assert_eq!(FileKind::from_extension(Some("PDF")), FileKind::Documents);
        assert_eq!(FileKind::from_extension(Some("heic")), FileKind::Images);
        assert_eq!(FileKind::from_extension(Some("xyz")), FileKind::Other);
        assert_eq!(FileKind::from_extension(None), FileKind::Other);
    }
}
