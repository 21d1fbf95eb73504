//! Binary file detection by extension and content heuristics.
//!
//! Stateless; safe for concurrent use from scanner, processor, and watcher.

use std::path::Path;

/// Number of leading bytes inspected by the content heuristics.
const SAMPLE_SIZE: usize = 512;

/// Extensions always treated as binary (lowercase, without the dot).
const BINARY_EXTENSIONS: &[&str] = &[
    // Executables and libraries
    "exe", "dll", "so", "dylib", "a", "lib", "o", "obj", "bin", "class", "pyc", "pyo", "wasm",
    // Archives
    "zip", "tar", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "jar", "war",
    // Images
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "icns", "tiff", "webp", "heic",
    // Audio / video
    "mp3", "mp4", "m4a", "wav", "ogg", "flac", "avi", "mkv", "mov", "webm",
    // Documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    // Fonts
    "ttf", "otf", "woff", "woff2", "eot",
    // Data
    "db", "sqlite", "sqlite3", "dat", "pak", "idx", "pack",
];

/// Suffixes that look binary-adjacent but are explicitly textual.
const TEXTUAL_SUFFIXES: &[&str] = &[".min.js", ".min.css", ".map", ".svg", ".proto"];

/// Known magic number prefixes for common binary formats.
const MAGIC_PREFIXES: &[&[u8]] = &[
    &[0x1f, 0x8b], // gzip
    b"PK\x03\x04",             // ZIP
    &[0x89, b'P', b'N', b'G'], // PNG
    &[0xff, 0xd8, 0xff],       // JPEG
    b"GIF8",                   // GIF
    b"%PDF",                   // PDF
    &[0x7f, b'E', b'L', b'F'], // ELF
    b"MZ",                     // PE
    &[0xfe, 0xed, 0xfa, 0xce], // Mach-O 32
    &[0xfe, 0xed, 0xfa, 0xcf], // Mach-O 64
    &[0xce, 0xfa, 0xed, 0xfe], // Mach-O 32 LE
    &[0xcf, 0xfa, 0xed, 0xfe], // Mach-O 64 LE
    &[0xca, 0xfe, 0xba, 0xbe], // Mach-O fat / Java class
    b"wOFF",                   // WOFF
    b"wOF2",                   // WOFF2
];

/// Classify a path + content pair as binary.
///
/// Rule order: extension set first (with textual exceptions), then magic
/// numbers over the first 512 bytes, then NUL density, then non-printable
/// density. Bytes >= 0x80 are not counted as non-printable so multi-byte
/// UTF-8 sequences never trip the heuristic. Empty content is textual.
pub fn is_binary(path: &Path, content: &[u8]) -> bool {
    if has_binary_extension(path) {
        return true;
    }
    is_binary_content(content)
}

/// Extension-only check, usable before any bytes have been read.
pub fn has_binary_extension(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_lowercase(),
        None => return false,
    };

    if TEXTUAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return false;
    }

    match name.rsplit_once('.') {
        Some((_, ext)) => BINARY_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Magic-number-only check, used as the processor's defensive re-check.
pub fn is_binary_by_magic(content: &[u8]) -> bool {
    MAGIC_PREFIXES.iter().any(|m| content.starts_with(m))
}

/// Content heuristics over the first 512 bytes.
pub fn is_binary_content(content: &[u8]) -> bool {
    if content.is_empty() {
        return false;
    }

    if is_binary_by_magic(content) {
        return true;
    }

    let sample = &content[..content.len().min(SAMPLE_SIZE)];

    let nul_count = sample.iter().filter(|&&b| b == 0).count();
    if nul_count * 100 > sample.len() {
        return true;
    }

    let non_printable = sample
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();
    non_printable * 100 > sample.len() * 30
}
