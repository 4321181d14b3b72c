//! Shared helpers: text decoding, media types, package paths and
//! read-compare-write output.

use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::Path;

use memchr::memmem;

/// Decode source bytes as text.
///
/// Valid UTF-8 (with or without BOM) wins. Otherwise the label from the XML
/// declaration is tried, and Windows-1252 is the last resort so legacy
/// sources never fail to load.
pub fn decode_text<'a>(bytes: &'a [u8], declared: Option<&str>) -> Cow<'a, str> {
    let (text, _, malformed) = encoding_rs::UTF_8.decode(bytes);
    if !malformed {
        return text;
    }
    let encoding = declared
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::WINDOWS_1252);
    encoding.decode(bytes).0
}

/// Read a source document as text, honouring its XML declaration.
pub fn read_text(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(decode_text(&bytes, extract_xml_encoding(&bytes)).into_owned())
}

/// The `encoding` pseudo-attribute of a leading `<?xml ...?>` declaration.
pub fn extract_xml_encoding(bytes: &[u8]) -> Option<&str> {
    let head = &bytes[..bytes.len().min(100)];
    let decl_start = memmem::find(head, b"<?xml")?;
    let decl = &head[decl_start..];
    let decl = &decl[..memmem::find(decl, b"?>").unwrap_or(decl.len())];

    let value_start = memmem::find(decl, b"encoding=")? + "encoding=".len();
    let (&quote, rest) = decl[value_start..].split_first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let len = memchr::memchr(quote, rest)?;
    std::str::from_utf8(&rest[..len]).ok()
}

/// Pixel size of a raster image, read from its header.
///
/// Covers the raster formats of the image group (PNG, JPEG, GIF, WebP).
/// SVG and unknown data yield `None`, which exempts them from the pixel
/// budget.
pub fn extract_image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let le16 = |at: usize| data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]) as u32);
    let be32 = |at: usize| data.get(at..at + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));

    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        // IHDR is always the first chunk.
        return Some((be32(16)?, be32(20)?));
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some((le16(6)?, le16(8)?));
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return jpeg_dimensions(data);
    }
    if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        return webp_dimensions(data);
    }
    None
}

/// Walk JPEG segments up to the first start-of-frame marker.
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 9 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = data[pos + 1];
        let is_frame = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame {
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]);
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]);
            return Some((width as u32, height as u32));
        }
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 2 + len;
    }
    None
}

fn webp_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let le24 = |at: usize| data.get(at..at + 3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]));
    match data.get(12..16)? {
        b"VP8X" => Some((le24(24)? + 1, le24(27)? + 1)),
        b"VP8L" => {
            let bits = u32::from_le_bytes(data.get(21..25)?.try_into().ok()?);
            Some(((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1))
        }
        b"VP8 " => {
            let width = u16::from_le_bytes(data.get(26..28)?.try_into().ok()?) & 0x3FFF;
            let height = u16::from_le_bytes(data.get(28..30)?.try_into().ok()?) & 0x3FFF;
            Some((width as u32, height as u32))
        }
        _ => None,
    }
}

/// Media type for a package path, by extension.
pub fn media_type(path: &str) -> &'static str {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "xhtml" | "html" | "htm" => "application/xhtml+xml",
        "css" => "text/css",
        "js" => "application/javascript",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ncx" => "application/x-dtbncx+xml",
        "opf" => "application/oebps-package+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Escape XML special characters.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Normalize a `/`-separated relative path, resolving `.` and `..`.
/// Returns `None` when the path escapes its root.
pub fn normalize_path(path: &str) -> Option<String> {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Directory part of a package path (`""` for top-level files).
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Join a directory and a relative path without normalizing.
pub fn join_path(dir: &str, path: &str) -> String {
    if dir.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), path)
    }
}

/// Path of `to` relative to the directory `from_dir`.
pub fn relative_path(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let target: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();

    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    parts.extend(std::iter::repeat_n("..", from.len() - common));
    parts.extend(&target[common..]);
    parts.join("/")
}

/// Swap the extension of a package path.
pub fn with_extension(path: &str, ext: &str) -> String {
    let dir = parent_dir(path);
    let name = &path[if dir.is_empty() { 0 } else { dir.len() + 1 }..];
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    join_path(dir, &format!("{stem}.{ext}"))
}

/// Lowercased extension of a package path.
pub fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => Some(name[idx + 1..].to_ascii_lowercase()),
        _ => None,
    }
}

/// Convert a filesystem-relative path to a package path.
pub fn to_package_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write `contents` to `path` unless the file already holds exactly these
/// bytes. Parent directories are created as needed. Returns whether a write
/// happened.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("text/ch01.xhtml"), "application/xhtml+xml");
        assert_eq!(media_type("style.css"), "text/css");
        assert_eq!(media_type("images/Cover.JPG"), "image/jpeg");
        assert_eq!(media_type("fonts/a.woff2"), "font/woff2");
        assert_eq!(media_type("mimetype"), "application/octet-stream");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/./b/../c").as_deref(), Some("a/c"));
        assert_eq!(normalize_path("a//b/").as_deref(), Some("a/b"));
        assert_eq!(normalize_path("../a"), None);
        assert_eq!(normalize_path("a/../..").as_deref(), None);
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("OEBPS/text", "OEBPS/text/ch02.xhtml"), "ch02.xhtml");
        assert_eq!(relative_path("OEBPS/text", "OEBPS/images/a.png"), "../images/a.png");
        assert_eq!(relative_path("", "OEBPS/a.css"), "OEBPS/a.css");
        assert_eq!(relative_path("OEBPS", "OEBPS/text/a.xhtml"), "text/a.xhtml");
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("styles/main.styl", "css"), "styles/main.css");
        assert_eq!(with_extension("x.md", "xhtml"), "x.xhtml");
        assert_eq!(with_extension("a.b/c", "xhtml"), "a.b/c.xhtml");
    }

    #[test]
    fn test_extract_xml_encoding() {
        assert_eq!(
            extract_xml_encoding(b"<?xml version=\"1.0\" encoding='ISO-8859-1'?><a/>"),
            Some("ISO-8859-1")
        );
        assert_eq!(extract_xml_encoding(b"<html/>"), None);
    }

    #[test]
    fn test_decode_text_fallback() {
        let bytes = [0x63, 0x61, 0x66, 0xE9];
        assert_eq!(decode_text(&bytes, None), "café");
    }

    #[test]
    fn test_png_dimensions() {
        let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&2000u32.to_be_bytes());
        png.extend_from_slice(&1600u32.to_be_bytes());
        assert_eq!(extract_image_dimensions(&png), Some((2000, 1600)));
    }

    #[test]
    fn test_gif_and_webp_dimensions() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&640u16.to_le_bytes());
        gif.extend_from_slice(&480u16.to_le_bytes());
        assert_eq!(extract_image_dimensions(&gif), Some((640, 480)));

        let mut webp = b"RIFF\0\0\0\0WEBPVP8X".to_vec();
        webp.extend_from_slice(&[0; 8]);
        webp.extend_from_slice(&[0x1F, 0x03, 0x00]);
        webp.extend_from_slice(&[0x57, 0x02, 0x00]);
        assert_eq!(extract_image_dimensions(&webp), Some((800, 600)));

        assert_eq!(extract_image_dimensions(b"<svg/>"), None);
    }

    #[test]
    fn test_write_if_changed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/out.txt");
        assert!(write_if_changed(&path, b"hello").unwrap());
        assert!(!write_if_changed(&path, b"hello").unwrap());
        assert!(write_if_changed(&path, b"world").unwrap());
    }
}
