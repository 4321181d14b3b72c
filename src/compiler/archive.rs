//! Incremental EPUB archiving.
//!
//! The destination tree is mirrored into a zip file. When an archive
//! already exists, entries whose CRC-32 is unchanged are raw-copied from
//! it, entries that are gone are dropped, and an archive whose entries
//! are all identical is left untouched.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Result;

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// One file to store in the archive.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Path inside the archive.
    pub name: String,
    pub source: PathBuf,
}

/// What [`write_archive`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub written: bool,
    pub entries: usize,
    pub copied: usize,
    pub removed: usize,
}

/// Bring the archive at `path` in line with `entries`.
///
/// An entry named `mimetype` is stored first and uncompressed; every other
/// entry is deflated.
pub fn write_archive(path: &Path, entries: &[Entry], compression_level: Option<u32>) -> Result<ArchiveStats> {
    let mut ordered: Vec<(&Entry, Vec<u8>, u32)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let data = fs::read(&entry.source)?;
        let crc = crc32fast::hash(&data);
        ordered.push((entry, data, crc));
    }
    ordered.sort_by_key(|(entry, _, _)| entry.name != "mimetype");

    let mut old = open_existing(path);
    let old_crcs: HashMap<String, (usize, u32)> = match old.as_mut() {
        Some(archive) => existing_crcs(archive),
        None => HashMap::new(),
    };

    let mut stats = ArchiveStats {
        entries: ordered.len(),
        ..Default::default()
    };
    stats.removed = old_crcs
        .keys()
        .filter(|name| !ordered.iter().any(|(entry, _, _)| &entry.name == *name))
        .count();

    let unchanged = old.as_ref().is_some_and(|archive| {
        archive.len() == ordered.len()
            && ordered.iter().enumerate().all(|(index, (entry, _, crc))| {
                old_crcs.get(&entry.name) == Some(&(index, *crc))
            })
    });
    if unchanged {
        debug!(path = %path.display(), "archive is up to date");
        return Ok(stats);
    }

    let level = compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(i64::from(level)));

    let partial = partial_path(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(BufWriter::new(fs::File::create(&partial)?));

    for (entry, data, crc) in &ordered {
        let reusable = match (old.as_mut(), old_crcs.get(&entry.name)) {
            (Some(archive), Some(&(index, old_crc))) if old_crc == *crc => Some((archive, index)),
            _ => None,
        };
        if let Some((archive, index)) = reusable {
            let file = archive.by_index_raw(index)?;
            zip.raw_copy_file(file)?;
            stats.copied += 1;
            continue;
        }

        let options = if entry.name == "mimetype" { stored } else { deflated };
        zip.start_file(entry.name.as_str(), options)?;
        zip.write_all(data)?;
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    drop(writer);
    drop(old);
    fs::rename(&partial, path)?;

    stats.written = true;
    info!(
        path = %path.display(),
        entries = stats.entries,
        copied = stats.copied,
        removed = stats.removed,
        "archive written"
    );
    Ok(stats)
}

fn open_existing(path: &Path) -> Option<ZipArchive<BufReader<fs::File>>> {
    let file = fs::File::open(path).ok()?;
    match ZipArchive::new(BufReader::new(file)) {
        Ok(archive) => Some(archive),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "existing archive is unreadable, rewriting");
            None
        }
    }
}

/// Entry name to (index, CRC-32) for every file entry of `archive`.
fn existing_crcs(archive: &mut ZipArchive<BufReader<fs::File>>) -> HashMap<String, (usize, u32)> {
    let mut crcs = HashMap::new();
    for index in 0..archive.len() {
        if let Ok(file) = archive.by_index_raw(index)
            && file.is_file()
        {
            crcs.insert(file.name().to_string(), (index, file.crc32()));
        }
    }
    crcs
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn entries(dir: &Path, files: &[(&str, &str)]) -> Vec<Entry> {
        files
            .iter()
            .map(|(name, content)| {
                let source = dir.join("src").join(name);
                fs::create_dir_all(source.parent().unwrap()).unwrap();
                fs::write(&source, content).unwrap();
                Entry {
                    name: name.to_string(),
                    source,
                }
            })
            .collect()
    }

    fn names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn test_mimetype_first_and_stored() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("book.epub");
        let files = entries(
            dir.path(),
            &[("OEBPS/a.xhtml", "<a/>"), ("mimetype", "application/epub+zip")],
        );
        let stats = write_archive(&out, &files, None).unwrap();
        assert!(stats.written);

        let mut archive = ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        let mut first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        let mut text = String::new();
        first.read_to_string(&mut text).unwrap();
        assert_eq!(text, "application/epub+zip");
    }

    #[test]
    fn test_unchanged_archive_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("book.epub");
        let files = entries(dir.path(), &[("mimetype", "application/epub+zip"), ("a.css", "p{}")]);
        write_archive(&out, &files, None).unwrap();
        let stats = write_archive(&out, &files, None).unwrap();
        assert!(!stats.written);
    }

    #[test]
    fn test_removed_entry_is_pruned() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("book.epub");
        let files = entries(
            dir.path(),
            &[("mimetype", "application/epub+zip"), ("a.xhtml", "a"), ("b.xhtml", "b")],
        );
        write_archive(&out, &files, Some(9)).unwrap();
        assert_eq!(names(&out).len(), 3);

        let stats = write_archive(&out, &files[..2], Some(9)).unwrap();
        assert!(stats.written);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.copied, 2);
        let mut after = names(&out);
        after.sort();
        assert_eq!(after, vec!["a.xhtml", "mimetype"]);
        assert!(!partial_path(&out).exists());
    }

    #[test]
    fn test_changed_entry_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("book.epub");
        let files = entries(dir.path(), &[("mimetype", "application/epub+zip"), ("a.xhtml", "one")]);
        write_archive(&out, &files, None).unwrap();
        fs::write(&files[1].source, "two").unwrap();

        let stats = write_archive(&out, &files, None).unwrap();
        assert_eq!(stats.copied, 1);
        let mut archive = ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        let mut text = String::new();
        archive.by_name("a.xhtml").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "two");
    }
}
