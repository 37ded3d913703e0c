//! Extension and content-type tables
//!
//! Pure lookups. Every function here is total over its input.

use serde::{Deserialize, Serialize};

/// Extensions that are never allowed through, regardless of policy.
const BLOCKED_EXTENSIONS: &[&str] = &[
    "scr", "pif", "cpl", "com", "hta", "lnk", "msc", "vbe", "jse", "wsf", "wsh", "scf", "gadget",
];

const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "msi", "msix", "appx", "dll", "sys", "app", "dmg", "pkg", "mpkg", "deb", "rpm", "apk",
    "jar", "bin", "run", "appimage", "elf", "so", "dylib",
];

const SCRIPT_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "csh", "fish", "ps1", "psm1", "bat", "cmd", "vbs", "js", "mjs", "py",
    "rb", "pl", "php", "command", "applescript", "scpt", "workflow", "reg", "docm", "xlsm",
    "pptm",
];

const ARCHIVE_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz", "zst", "lzma", "cab", "iso",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "csv",
    "md", "epub", "pages", "numbers", "key", "json", "xml",
];

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "heic", "tif", "tiff", "ico", "mp3", "wav",
    "flac", "aac", "ogg", "m4a", "mp4", "m4v", "mkv", "mov", "avi", "webm",
];

/// Extensions the OS gatekeeper evaluates before first launch.
const GATEKEPT_EXTENSIONS: &[&str] = &["app", "dmg", "pkg", "mpkg"];

/// Declared content types that describe native executables or interpreters.
const DANGEROUS_CONTENT_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-msdos-program",
    "application/x-dosexec",
    "application/x-executable",
    "application/vnd.microsoft.portable-executable",
    "application/x-mach-binary",
    "application/x-elf",
    "application/x-msi",
    "application/x-ms-installer",
    "application/x-ms-shortcut",
    "application/hta",
    "application/x-apple-diskimage",
    "application/vnd.apple.installer+xml",
    "application/x-sh",
    "application/x-shellscript",
    "application/x-csh",
    "application/x-bat",
    "application/x-python",
    "application/x-perl",
    "application/x-ruby",
    "application/javascript",
    "text/javascript",
    "text/x-python",
    "text/x-shellscript",
    "text/vbscript",
];

/// The generic "we don't know what this is" binary type.
pub const UNKNOWN_BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Bidirectional formatting characters that reorder how a name is displayed.
const BIDI_CONTROL_CHARS: &[char] = &[
    '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}', '\u{2066}', '\u{2067}',
    '\u{2068}', '\u{2069}', '\u{200E}', '\u{200F}',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Blocked,
    Executable,
    Script,
    Archive,
    Document,
    Media,
    Unknown,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Blocked => "blocked",
            FileCategory::Executable => "executable",
            FileCategory::Script => "script",
            FileCategory::Archive => "archive",
            FileCategory::Document => "document",
            FileCategory::Media => "media",
            FileCategory::Unknown => "unknown",
        }
    }

    /// Can run code when opened.
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            FileCategory::Blocked | FileCategory::Executable | FileCategory::Script
        )
    }

    /// Looks harmless to a user skimming a filename.
    pub fn looks_safe(&self) -> bool {
        matches!(self, FileCategory::Document | FileCategory::Media)
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a bare extension (no leading dot, any case).
pub fn classify_extension(extension: &str) -> FileCategory {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    let ext = ext.as_str();

    if BLOCKED_EXTENSIONS.contains(&ext) {
        FileCategory::Blocked
    } else if EXECUTABLE_EXTENSIONS.contains(&ext) {
        FileCategory::Executable
    } else if SCRIPT_EXTENSIONS.contains(&ext) {
        FileCategory::Script
    } else if ARCHIVE_EXTENSIONS.contains(&ext) {
        FileCategory::Archive
    } else if DOCUMENT_EXTENSIONS.contains(&ext) {
        FileCategory::Document
    } else if MEDIA_EXTENSIONS.contains(&ext) {
        FileCategory::Media
    } else {
        FileCategory::Unknown
    }
}

pub fn is_gatekept_extension(extension: &str) -> bool {
    GATEKEPT_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

/// Drop trailing dots and whitespace, which Windows ignores when it
/// resolves a file name (`payload.scr.` runs as `payload.scr`).
pub fn trim_name_end(file_name: &str) -> &str {
    file_name.trim_end_matches(|c: char| c.is_whitespace() || c == '.')
}

/// Final extension of a file name, lowercased. Hidden files (`.bashrc`) have none.
pub fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = trim_name_end(file_name).rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Strip parameters (`; charset=...`) and normalize case.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_dangerous_content_type(content_type: &str) -> bool {
    DANGEROUS_CONTENT_TYPES.contains(&normalize_content_type(content_type).as_str())
}

pub fn is_unknown_binary_content_type(content_type: &str) -> bool {
    normalize_content_type(content_type) == UNKNOWN_BINARY_CONTENT_TYPE
}

/// Extensions a file served with `content_type` is expected to carry.
/// Empty when the type is too generic to say.
pub fn expected_extensions(content_type: &str) -> &'static [&'static str] {
    match normalize_content_type(content_type).as_str() {
        "application/pdf" => &["pdf"],
        "image/jpeg" | "image/pjpeg" => &["jpg", "jpeg", "jpe", "jfif"],
        "image/png" => &["png"],
        "image/gif" => &["gif"],
        "image/webp" => &["webp"],
        "image/bmp" => &["bmp"],
        "image/heic" => &["heic"],
        "image/tiff" => &["tif", "tiff"],
        "audio/mpeg" => &["mp3"],
        "audio/wav" | "audio/x-wav" => &["wav"],
        "audio/flac" => &["flac"],
        "audio/ogg" => &["ogg", "oga"],
        "video/mp4" => &["mp4", "m4v"],
        "video/webm" => &["webm"],
        "video/quicktime" => &["mov"],
        "application/zip" | "application/x-zip-compressed" => &["zip"],
        "application/x-7z-compressed" => &["7z"],
        "application/vnd.rar" | "application/x-rar-compressed" => &["rar"],
        "application/gzip" | "application/x-gzip" => &["gz", "tgz"],
        "application/msword" => &["doc"],
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => &["docx"],
        "application/vnd.ms-excel" => &["xls"],
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => &["xlsx"],
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => &["pptx"],
        "text/csv" => &["csv"],
        "application/epub+zip" => &["epub"],
        _ => &[],
    }
}

pub fn contains_bidi_controls(file_name: &str) -> bool {
    file_name.chars().any(|c| BIDI_CONTROL_CHARS.contains(&c))
}

/// Remove bidi controls so the name displays in its true order.
pub fn strip_bidi_controls(file_name: &str) -> String {
    file_name
        .chars()
        .filter(|c| !BIDI_CONTROL_CHARS.contains(c))
        .collect()
}
