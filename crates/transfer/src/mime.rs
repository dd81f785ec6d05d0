//! Extension ⇄ MIME type table for media commonly sent in chats.

use std::path::Path;

/// Fallback type for unknown content.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Wrapper extensions: when one ends the path, the real extension is the
/// one before it.
pub const CRYPTO_EXTENSIONS: [&str; 3] = ["pgp", "gpg", "otr"];

/// Wrapper extensions that mark PGP ciphertext awaiting local decryption.
pub const PGP_EXTENSIONS: [&str; 2] = ["pgp", "gpg"];

// First entry for a MIME type is its preferred extension.
const TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("heic", "image/heic"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("3gp", "video/3gpp"),
    ("mkv", "video/x-matroska"),
    ("m4a", "audio/mp4"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("opus", "audio/opus"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("amr", "audio/amr"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("apk", "application/vnd.android.package-archive"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("vcf", "text/vcard"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("odt", "application/vnd.oasis.opendocument.text"),
];

/// MIME type for an extension (case-insensitive).
pub fn guess_from_extension(ext: &str) -> Option<&'static str> {
    TABLE
        .iter()
        .find(|(e, _)| e.eq_ignore_ascii_case(ext))
        .map(|(_, m)| *m)
}

/// MIME type for a path, `application/octet-stream` when unknown.
pub fn guess_from_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(guess_from_extension)
        .unwrap_or(OCTET_STREAM)
}

/// Preferred extension for a `Content-Type` value. Parameters such as
/// `; charset=utf-8` are ignored.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    TABLE
        .iter()
        .find(|(_, m)| m.eq_ignore_ascii_case(essence))
        .map(|(e, _)| *e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_common_types() {
        assert_eq!(guess_from_extension("JPG"), Some("image/jpeg"));
        assert_eq!(guess_from_extension("opus"), Some("audio/opus"));
        assert_eq!(guess_from_extension("xyz"), None);
        assert_eq!(guess_from_path(Path::new("/a/b.png")), "image/png");
        assert_eq!(guess_from_path(Path::new("/a/noext")), OCTET_STREAM);
    }

    #[test]
    fn extension_for_content_type() {
        assert_eq!(extension_for("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for("Text/Plain; charset=utf-8"), Some("txt"));
        assert_eq!(extension_for("application/x-unknown"), None);
        assert_eq!(extension_for(OCTET_STREAM), None);
    }
}
