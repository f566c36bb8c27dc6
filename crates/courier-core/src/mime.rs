//! MIME detection for inbound media.
//!
//! Detection order: magic bytes → extension map → declared MIME
//! (normalized through a rewrite table) → `application/octet-stream`.
//! Magic sniffing wins except when it reports a generic type and the
//! extension knows better (e.g. `.jsonl` sniffs as plain text).

use tracing::debug;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Declared-MIME rewrites: transports and clients report these variants,
/// providers expect the canonical form.
const MIME_NORMALIZATION: &[(&str, &str)] = &[
    ("image/jpg", "image/jpeg"),
    ("image/x-png", "image/png"),
    ("audio/x-wav", "audio/wav"),
    ("audio/mp3", "audio/mpeg"),
    ("audio/x-m4a", "audio/mp4"),
    ("application/x-pdf", "application/pdf"),
    ("text/markdown; charset=utf-8", "text/markdown"),
    ("application/javascript", "text/javascript"),
];

/// Extensions the generic sniffers miss or misreport.
const EXTENSION_OVERRIDES: &[(&str, &str)] = &[
    ("jsonl", "application/jsonl"),
    ("ndjson", "application/jsonl"),
    ("md", "text/markdown"),
    ("toml", "text/x-toml"),
    ("yaml", "text/yaml"),
    ("yml", "text/yaml"),
    ("csv", "text/csv"),
    ("tsv", "text/tab-separated-values"),
    ("py", "text/x-python"),
    ("rs", "text/x-rust"),
    ("log", "text/plain"),
];

/// Normalize a declared MIME type through the rewrite table.
pub fn normalize(declared: &str) -> String {
    let lowered = declared.trim().to_ascii_lowercase();
    for (from, to) in MIME_NORMALIZATION {
        if lowered == *from {
            return (*to).to_string();
        }
    }
    lowered
}

fn from_extension(filename: &str) -> Option<String> {
    let ext = filename.rsplit('.').next()?.to_ascii_lowercase();
    if ext == filename.to_ascii_lowercase() {
        return None; // no dot at all
    }
    for (known, mime) in EXTENSION_OVERRIDES {
        if ext == *known {
            return Some((*mime).to_string());
        }
    }
    mime_guess::from_ext(&ext)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Detect the MIME type of a media item.
///
/// `bytes` and `filename` and `declared` are each optional; the chain
/// falls through to `application/octet-stream` when nothing matches.
pub fn detect(bytes: Option<&[u8]>, filename: Option<&str>, declared: Option<&str>) -> String {
    // 1. Magic bytes. Generic results defer to the extension, which knows
    //    about text formats the sniffer lumps together.
    if let Some(buf) = bytes {
        if let Some(kind) = infer::get(buf) {
            let sniffed = kind.mime_type();
            if sniffed == OCTET_STREAM || sniffed == "text/plain" {
                if let Some(ext_mime) = filename.and_then(from_extension) {
                    debug!(sniffed, ext_mime, "mime generic sniff, extension wins");
                    return ext_mime;
                }
            }
            return sniffed.to_string();
        }
    }

    // 2. Extension map.
    if let Some(ext_mime) = filename.and_then(from_extension) {
        return ext_mime;
    }

    // 3. Declared MIME, normalized.
    if let Some(decl) = declared {
        if !decl.is_empty() {
            return normalize(decl);
        }
    }

    OCTET_STREAM.to_string()
}

pub fn is_image(mime: &str) -> bool {
    mime.starts_with("image/")
}

pub fn is_audio(mime: &str) -> bool {
    mime.starts_with("audio/")
}

pub fn is_video(mime: &str) -> bool {
    mime.starts_with("video/")
}

pub fn is_pdf(mime: &str) -> bool {
    mime == "application/pdf"
}

pub fn is_text(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json" || mime == "application/jsonl"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_win_for_binary() {
        // PNG signature
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect(Some(&png), Some("photo.dat"), None), "image/png");
    }

    #[test]
    fn jsonl_extension_overrides_generic_sniff() {
        assert_eq!(
            detect(None, Some("events.jsonl"), Some("text/plain")),
            "application/jsonl"
        );
    }

    #[test]
    fn declared_mime_is_normalized() {
        assert_eq!(detect(None, None, Some("image/jpg")), "image/jpeg");
        assert_eq!(detect(None, None, Some("AUDIO/MP3")), "audio/mpeg");
    }

    #[test]
    fn falls_back_to_octet_stream() {
        assert_eq!(detect(None, None, None), OCTET_STREAM);
        assert_eq!(detect(None, Some("noext"), Some("")), OCTET_STREAM);
    }

    #[test]
    fn extension_map_handles_common_types() {
        assert_eq!(detect(None, Some("paper.pdf"), None), "application/pdf");
        assert_eq!(detect(None, Some("notes.md"), None), "text/markdown");
        assert_eq!(detect(None, Some("main.py"), None), "text/x-python");
    }

    #[test]
    fn predicates() {
        assert!(is_image("image/png"));
        assert!(is_pdf("application/pdf"));
        assert!(is_text("application/jsonl"));
        assert!(!is_audio("video/mp4"));
        assert!(is_video("video/mp4"));
    }
}
