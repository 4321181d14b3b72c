//! Package metadata documents.
//!
//! Each generator is a pure function of the final [`FileResolver`] state
//! and the book/target metadata:
//!
//! | File                                   | Generator        |
//! |----------------------------------------|------------------|
//! | `mimetype`                             | [`MIMETYPE`]     |
//! | `META-INF/container.xml`               | [`meta_inf`]     |
//! | `META-INF/com.apple.ibooks.display-options.xml` | [`meta_inf`] |
//! | `<content>/content.opf`                | [`opf`]          |
//! | `<content>/nav.xhtml` (EPUB 3)         | [`nav`]          |
//! | `<content>/nav.ncx` (EPUB 2)           | [`ncx`]          |

pub mod meta_inf;
pub mod nav;
pub mod ncx;
pub mod opf;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use sha1_smol::Sha1;

use crate::book::{Book, Landmark, Target, TocItem};
use crate::error::Result;
use crate::file::{FileId, Generator};
use crate::resolver::FileResolver;
use crate::util::relative_path;

pub const MIMETYPE: &str = "application/epub+zip";

/// Produce the content of `generator`'s document.
pub fn generate(generator: Generator, resolver: &FileResolver, book: &Book, target: &Target) -> Result<String> {
    Ok(match generator {
        Generator::MimeType => MIMETYPE.to_string(),
        Generator::ContainerXml => meta_inf::container_xml(resolver),
        Generator::IbooksDisplayOptions => meta_inf::ibooks_display_options(target),
        Generator::Opf => opf::generate_opf(resolver, book, target),
        Generator::Nav => nav::generate_nav(resolver, book, target),
        Generator::Ncx => ncx::generate_ncx(resolver, book, target),
    })
}

/// The package's unique identifier.
///
/// A target ISBN wins over the book identifier; without either, a UUID is
/// derived from the title and target name so rebuilds stay identical.
pub fn book_identifier(book: &Book, target: &Target) -> String {
    if let Some(isbn) = &target.isbn {
        return format!("urn:isbn:{isbn}");
    }
    if let Some(identifier) = &book.identifier {
        return identifier.clone();
    }

    let mut sha = Sha1::new();
    sha.update(book.title.as_bytes());
    sha.update(b"\0");
    sha.update(target.name.as_bytes());
    let mut bytes = sha.digest().bytes();
    bytes[6] = (bytes[6] & 0x0f) | 0x50;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "urn:uuid:{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// `dcterms:modified` value: the book's own date, or the newest manifest
/// source modification time.
pub fn modified_date(resolver: &FileResolver, book: &Book) -> String {
    if let Some(modified) = &book.modified {
        return modified.clone();
    }
    let newest = resolver
        .manifest()
        .iter()
        .filter_map(|&id| resolver.file(id).source())
        .filter_map(|source| fs::metadata(&source.abs_source_path).and_then(|m| m.modified()).ok())
        .max()
        .unwrap_or(UNIX_EPOCH);
    DateTime::<Utc>::from(newest).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Stable XML ids for every manifest item, derived from destination paths.
pub fn manifest_ids(resolver: &FileResolver) -> HashMap<FileId, String> {
    let mut used = HashSet::new();
    let mut ids = HashMap::new();
    for &id in resolver.manifest() {
        let base = xml_id(&resolver.file(id).destination_path);
        let mut candidate = base.clone();
        let mut n = 2;
        while !used.insert(candidate.clone()) {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        ids.insert(id, candidate);
    }
    ids
}

fn xml_id(path: &str) -> String {
    let mut id: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if !id.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        id.insert(0, 'i');
    }
    id
}

/// A navigation entry resolved to a package href.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavEntry {
    pub title: String,
    pub href: String,
    pub children: Vec<NavEntry>,
}

/// Titled TOC items as navigation entries with hrefs relative to
/// `from_dir`. Untitled items contribute their children in their place.
pub fn nav_entries(items: &[TocItem], resolver: &FileResolver, from_dir: &str) -> Vec<NavEntry> {
    let mut entries = Vec::new();
    for item in items {
        let children = nav_entries(&item.children, resolver, from_dir);
        match (&item.title, toc_href(item, resolver, from_dir)) {
            (Some(title), Some(href)) => entries.push(NavEntry {
                title: title.clone(),
                href,
                children,
            }),
            _ => entries.extend(children),
        }
    }
    entries
}

/// Href of a TOC item's file (and fragment), relative to `from_dir`.
pub fn toc_href(item: &TocItem, resolver: &FileResolver, from_dir: &str) -> Option<String> {
    let id = resolver.file_from_request(item.file.as_ref()?)?;
    let mut href = crate::xhtml::encode_path(&relative_path(from_dir, &resolver.file(id).destination_path));
    if let Some(fragment) = &item.fragment {
        href.push('#');
        href.push_str(fragment);
    }
    Some(href)
}

/// Landmarks of the book in TOC order, without iBooks-only types unless
/// the target is iBooks.
pub fn landmarks(book: &Book, target: &Target, resolver: &FileResolver, from_dir: &str) -> Vec<(Landmark, String)> {
    let mut out = Vec::new();
    for item in book.toc_items() {
        for &landmark in &item.landmarks {
            if landmark.is_ibooks_only() && !target.ibooks {
                continue;
            }
            if let Some(href) = toc_href(item, resolver, from_dir) {
                out.push((landmark, href));
            }
        }
    }
    out
}

/// Nesting depth of the entry tree.
pub fn depth(entries: &[NavEntry]) -> usize {
    entries.iter().map(|e| 1 + depth(&e.children)).max().unwrap_or(0)
}
