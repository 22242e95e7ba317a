/// Detects a Content-Type from the first bytes of a response body, for
/// upstream handlers that write without setting one. Covers the common
/// signature table; anything unrecognised falls back to text or binary.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let trimmed = skip_ws(data);

    for (prefix, mime) in HTML_PREFIXES {
        if starts_with_ignore_case(trimmed, prefix) {
            return mime;
        }
    }

    for (magic, mime) in MAGIC {
        if data.starts_with(magic) {
            return mime;
        }
    }

    if data.len() >= 12 && &data[..4] == b"RIFF" {
        if &data[8..12] == b"WEBP" {
            return "image/webp";
        }
        if &data[8..12] == b"WAVE" {
            return "audio/wave";
        }
    }

    if looks_binary(data) {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}

const HTML_PREFIXES: &[(&[u8], &str)] = &[
    (b"<!DOCTYPE HTML", "text/html; charset=utf-8"),
    (b"<HTML", "text/html; charset=utf-8"),
    (b"<HEAD", "text/html; charset=utf-8"),
    (b"<SCRIPT", "text/html; charset=utf-8"),
    (b"<IFRAME", "text/html; charset=utf-8"),
    (b"<BODY", "text/html; charset=utf-8"),
    (b"<DIV", "text/html; charset=utf-8"),
    (b"<P", "text/html; charset=utf-8"),
    (b"<!--", "text/html; charset=utf-8"),
    (b"<?xml", "text/xml; charset=utf-8"),
];

const MAGIC: &[(&[u8], &str)] = &[
    (b"\xef\xbb\xbf", "text/plain; charset=utf-8"),
    (b"\xfe\xff", "text/plain; charset=utf-16be"),
    (b"\xff\xfe", "text/plain; charset=utf-16le"),
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"BM", "image/bmp"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"OggS", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"fLaC", "audio/flac"),
    (b"\x1a\x45\xdf\xa3", "video/webm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1a\x07\x00", "application/x-rar-compressed"),
    (b"\x7fELF", "application/octet-stream"),
];

fn skip_ws(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    if data.len() < prefix.len() {
        return false;
    }
    data.iter()
        .zip(prefix)
        .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

fn looks_binary(data: &[u8]) -> bool {
    data.iter()
        .any(|b| matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f))
}
