// Content type resolution from stored file metadata.

/// Served when nothing better is known.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Broad kind of a stored file, as recorded at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Video,
    Audio,
    Image,
    Document,
}

impl FileCategory {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "image" | "photo" => Some(Self::Image),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    pub fn default_content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Audio => "audio/mpeg",
            Self::Image => "image/jpeg",
            Self::Document => FALLBACK_CONTENT_TYPE,
        }
    }

    /// Whether browsers can usually play this kind inline.
    pub fn is_streamable(self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }
}

/// Pick the `Content-Type` for a file.
///
/// `mime_or_category` holds either a full MIME type or a bare category.
/// A full type wins; otherwise the display name's extension is tried, then
/// the category's default.
pub fn content_type_for(mime_or_category: &str, display_name: &str) -> String {
    let stored = mime_or_category.trim();
    if is_mime_type(stored) {
        return stored.to_string();
    }

    if let Some(guess) = mime_guess::from_path(display_name).first() {
        return guess.essence_str().to_string();
    }

    FileCategory::parse(stored)
        .map(FileCategory::default_content_type)
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

fn is_mime_type(value: &str) -> bool {
    match value.split_once('/') {
        Some((kind, sub)) => {
            !kind.is_empty()
                && !sub.is_empty()
                && value
                    .bytes()
                    .all(|b| b.is_ascii_graphic() || b == b' ')
        }
        None => false,
    }
}
