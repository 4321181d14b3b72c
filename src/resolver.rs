//! Registry of build artifacts.
//!
//! The [`FileResolver`] turns [`FileRequest`]s into [`File`]s, gives each a
//! unique final destination, and classifies it into the spine, manifest
//! and package collections. Two registrations resolving to the same final
//! path merge into the first-registered file.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::book::{FileRequest, Group};
use crate::error::{Error, Result};
use crate::file::{File, FileId, FileKind, PathType, destination_path_for, source_extensions_for};
use crate::find::{FileFinder, FileTree, SourceTree, VirtualTree};
use crate::util::{extension, join_path, normalize_path, to_package_path, with_extension};

pub struct FileResolver {
    source_tree: SourceTree,
    /// Content-folder-relative destinations of manifest files.
    destination_tree: VirtualTree,
    content_folder: String,
    destination_root: PathBuf,
    files: Vec<File>,
    by_final: HashMap<PathBuf, FileId>,
    by_source: HashMap<String, FileId>,
    by_destination: HashMap<String, FileId>,
    by_request: HashMap<FileRequest, Vec<FileId>>,
    spine: Vec<FileId>,
    manifest: Vec<FileId>,
    package: Vec<FileId>,
}

impl FileResolver {
    pub fn new(source_tree: SourceTree, destination_root: impl Into<PathBuf>, content_folder: impl Into<String>) -> Self {
        Self {
            source_tree,
            destination_tree: VirtualTree::new(),
            content_folder: content_folder.into(),
            destination_root: destination_root.into(),
            files: Vec::new(),
            by_final: HashMap::new(),
            by_source: HashMap::new(),
            by_destination: HashMap::new(),
            by_request: HashMap::new(),
            spine: Vec::new(),
            manifest: Vec::new(),
            package: Vec::new(),
        }
    }

    pub fn source_tree(&self) -> &SourceTree {
        &self.source_tree
    }

    pub fn destination_tree(&self) -> &VirtualTree {
        &self.destination_tree
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn content_folder(&self) -> &str {
        &self.content_folder
    }

    /// Resolve `request` against the source tree and register the match
    /// (or every match, when the request is not `only_one`).
    pub fn add_file_from_request(&mut self, request: &FileRequest, path_type: PathType) -> Result<Vec<FileId>> {
        let groups = [request.group];
        let finder = FileFinder::new(&self.source_tree);
        let paths = if request.only_one {
            vec![finder.find_file(&request.source_pattern, &groups, None)?]
        } else {
            finder.find_files(&request.source_pattern, &groups, None)?
        };

        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            let mut file = self.file_for_source(&path);
            file.properties.extend(request.properties.iter().cloned());
            if let FileKind::Source(source) = &mut file.kind {
                source.requests.push(request.clone());
            }
            let id = self.add_file(file, path_type);
            let by_request = self.by_request.entry(request.clone()).or_default();
            if !by_request.contains(&id) {
                by_request.push(id);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Register the project source at `source_path`.
    pub fn add_source_file(&mut self, source_path: &str, path_type: PathType) -> FileId {
        let file = self.file_for_source(source_path);
        self.add_file(file, path_type)
    }

    fn file_for_source(&self, source_path: &str) -> File {
        File::from_source(source_path, self.source_tree.abs_path(source_path))
    }

    /// Register an already constructed file.
    ///
    /// Computes its package and final paths, then merges it into an
    /// existing file with the same final path or adds it as a new one.
    pub fn add_file(&mut self, mut file: File, path_type: PathType) -> FileId {
        file.path_type = path_type;
        file.pkg_destination_path = match path_type {
            PathType::Spine | PathType::Manifest => join_path(&self.content_folder, &file.destination_path),
            PathType::Package | PathType::None => file.destination_path.clone(),
        };
        file.final_destination_path = self.destination_root.join(&file.pkg_destination_path);

        let id = match self.by_final.get(&file.final_destination_path) {
            Some(&id) => {
                self.merge(id, file);
                id
            }
            None => {
                let id = self.files.len();
                trace!(path = %file.pkg_destination_path, ?path_type, "registered file");
                self.by_final.insert(file.final_destination_path.clone(), id);
                if let Some(source_path) = file.source_path() {
                    self.by_source.insert(source_path.to_string(), id);
                }
                self.files.push(file);
                id
            }
        };
        self.enroll(id);
        id
    }

    fn merge(&mut self, id: FileId, file: File) {
        let existing = &mut self.files[id];
        existing.path_type = existing.path_type.max(file.path_type);
        existing.properties.extend(file.properties);
        if existing.title.is_none() {
            existing.title = file.title;
        }
        existing.linear &= file.linear;
        if let (FileKind::Source(existing), FileKind::Source(new)) = (&mut existing.kind, file.kind) {
            for request in new.requests {
                if !existing.requests.contains(&request) {
                    existing.requests.push(request);
                }
            }
        }
    }

    /// Add `id` to every collection its path type implies.
    fn enroll(&mut self, id: FileId) {
        let path_type = self.files[id].path_type;
        if path_type >= PathType::Package && !self.package.contains(&id) {
            self.package.push(id);
        }
        if path_type >= PathType::Manifest && !self.manifest.contains(&id) {
            self.manifest.push(id);
            let destination = self.files[id].destination_path.clone();
            self.destination_tree.insert(&destination);
            self.by_destination.insert(destination, id);
        }
        if path_type == PathType::Spine && !self.spine.contains(&id) {
            self.spine.push(id);
        }
    }

    pub fn file(&self, id: FileId) -> &File {
        &self.files[id]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut File {
        &mut self.files[id]
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every file in registration order.
    pub fn files(&self) -> impl Iterator<Item = (FileId, &File)> {
        self.files.iter().enumerate()
    }

    pub fn spine(&self) -> &[FileId] {
        &self.spine
    }

    pub fn manifest(&self) -> &[FileId] {
        &self.manifest
    }

    pub fn package(&self) -> &[FileId] {
        &self.package
    }

    /// First file registered for `request`.
    pub fn file_from_request(&self, request: &FileRequest) -> Option<FileId> {
        self.files_from_request(request).first().copied()
    }

    pub fn files_from_request(&self, request: &FileRequest) -> &[FileId] {
        self.by_request.get(request).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn file_with_source_path(&self, source_path: &str) -> Option<FileId> {
        self.by_source.get(source_path).copied()
    }

    /// Manifest file with the given content-folder-relative destination.
    pub fn file_with_destination_path(&self, destination_path: &str) -> Option<FileId> {
        self.by_destination.get(destination_path).copied()
    }

    /// Resolve a reference against the destination tree.
    ///
    /// `context` is the content-relative directory of the referring file.
    pub fn find_destination(&self, pattern: &str, groups: &[Group], context: &str) -> Result<String> {
        FileFinder::new(&self.destination_tree).find_file(pattern, groups, Some(context))
    }

    /// Resolve a resource reference and register it as a manifest member
    /// when it was not known yet.
    ///
    /// The destination tree is searched first (relative to
    /// `destination_context`), then the source tree (relative to
    /// `source_context`). Returns the content-relative destination path.
    pub fn resolve_resource(
        &mut self,
        pattern: &str,
        group: Group,
        destination_context: &str,
        source_context: &str,
    ) -> Result<String> {
        let groups = [group];
        match self.find_destination(pattern, &groups, destination_context) {
            Ok(found) => return Ok(found),
            Err(Error::FileNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let source = FileFinder::new(&self.source_tree).find_file(pattern, &groups, Some(source_context))?;
        let id = self.add_source_file(&source, PathType::Manifest);
        debug!(path = %source, "registered discovered resource");
        Ok(self.files[id].destination_path.clone())
    }

    /// Register the file producing the content-relative `destination_path`,
    /// looking its source up by path. Used to rebuild the manifest from
    /// already written output.
    pub fn register_destination(&mut self, destination_path: &str) -> Option<FileId> {
        let destination_path = normalize_path(destination_path)?;
        if let Some(id) = self.file_with_destination_path(&destination_path) {
            return Some(id);
        }
        let candidates = std::iter::once(destination_path.clone()).chain(
            source_extensions_for(&destination_path)
                .iter()
                .map(|ext| with_extension(&destination_path, ext)),
        );
        for candidate in candidates {
            if self.source_tree.contains(&candidate) && destination_path_for(&candidate) == destination_path {
                return Some(self.add_source_file(&candidate, PathType::Manifest));
            }
        }
        None
    }

    /// Files present under the destination root that no registered package
    /// file accounts for, as package-relative paths.
    pub fn unneeded_files_in_destination(&self) -> Vec<String> {
        let needed: BTreeSet<&str> = self
            .package
            .iter()
            .map(|&id| self.files[id].pkg_destination_path.as_str())
            .collect();

        let mut unneeded: Vec<String> = WalkDir::new(&self.destination_root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.destination_root)
                    .ok()
                    .map(to_package_path)
            })
            .filter(|path| !needed.contains(path.as_str()))
            .collect();
        unneeded.sort();
        unneeded
    }

    /// Manifest files with a given extension, in manifest order.
    pub fn manifest_with_extension<'a>(&'a self, ext: &'a str) -> impl Iterator<Item = FileId> + 'a {
        self.manifest
            .iter()
            .copied()
            .filter(move |&id| extension(&self.files[id].destination_path).as_deref() == Some(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Generator;
    use std::fs;
    use tempfile::TempDir;

    fn project(paths: &[&str]) -> (TempDir, FileResolver) {
        let dir = TempDir::new().unwrap();
        for path in paths {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, "x").unwrap();
        }
        let tree = SourceTree::scan(dir.path());
        let resolver = FileResolver::new(tree, dir.path().join(".quire/build/t/package"), "OEBPS");
        (dir, resolver)
    }

    #[test]
    fn test_request_resolves_and_renames() {
        let (_dir, mut resolver) = project(&["text/ch01.rxhtml", "styles/main.styl"]);
        let ids = resolver
            .add_file_from_request(&FileRequest::new("ch01", Group::Text), PathType::Spine)
            .unwrap();
        let file = resolver.file(ids[0]);
        assert_eq!(file.destination_path, "text/ch01.xhtml");
        assert_eq!(file.pkg_destination_path, "OEBPS/text/ch01.xhtml");
        assert!(file.final_destination_path.ends_with("package/OEBPS/text/ch01.xhtml"));

        let ids = resolver
            .add_file_from_request(&FileRequest::new("main", Group::Style), PathType::Manifest)
            .unwrap();
        assert_eq!(resolver.file(ids[0]).destination_path, "styles/main.css");
    }

    #[test]
    fn test_same_final_path_merges() {
        let (_dir, mut resolver) = project(&["text/ch01.xhtml"]);
        let first = FileRequest::new("ch01", Group::Text);
        let second = FileRequest::new("text/ch01.xhtml", Group::Text).with_property("svg");
        let a = resolver.add_file_from_request(&first, PathType::Manifest).unwrap()[0];
        let b = resolver.add_file_from_request(&second, PathType::Spine).unwrap()[0];
        assert_eq!(a, b);
        assert_eq!(resolver.len(), 1);

        let file = resolver.file(a);
        assert_eq!(file.path_type, PathType::Spine);
        assert!(file.properties.contains("svg"));
        assert_eq!(file.source().unwrap().requests.len(), 2);
        assert_eq!(resolver.file_from_request(&first), Some(a));
        assert_eq!(resolver.file_from_request(&second), Some(a));
        assert_eq!(resolver.file_with_source_path("text/ch01.xhtml"), Some(a));
    }

    #[test]
    fn test_containment() {
        let (_dir, mut resolver) = project(&["text/ch01.xhtml", "images/a.png"]);
        resolver
            .add_file_from_request(&FileRequest::new("ch01", Group::Text), PathType::Spine)
            .unwrap();
        resolver
            .add_file_from_request(&FileRequest::new("a", Group::Image), PathType::Manifest)
            .unwrap();
        resolver.add_file(File::generated(Generator::MimeType), PathType::Package);

        for &id in resolver.spine() {
            assert!(resolver.manifest().contains(&id));
        }
        for &id in resolver.manifest() {
            assert!(resolver.package().contains(&id));
        }
        assert_eq!(resolver.spine().len(), 1);
        assert_eq!(resolver.manifest().len(), 2);
        assert_eq!(resolver.package().len(), 3);
        assert_eq!(resolver.file(resolver.package()[2]).pkg_destination_path, "mimetype");
    }

    #[test]
    fn test_all_matches() {
        let (_dir, mut resolver) = project(&["fonts/a.otf", "fonts/b.ttf"]);
        let ids = resolver
            .add_file_from_request(&FileRequest::new("fonts/*", Group::Font).all(), PathType::Manifest)
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_resolve_resource_registers() {
        let (_dir, mut resolver) = project(&["text/ch01.xhtml", "images/a.png"]);
        let found = resolver.resolve_resource("../images/a.png", Group::Image, "text", "text").unwrap();
        assert_eq!(found, "images/a.png");
        assert_eq!(resolver.manifest().len(), 1);
        assert!(resolver.destination_tree().contains("images/a.png"));

        // Second lookup hits the destination tree.
        resolver.resolve_resource("a", Group::Image, "", "").unwrap();
        assert_eq!(resolver.manifest().len(), 1);
    }

    #[test]
    fn test_register_destination_maps_back_to_source() {
        let (_dir, mut resolver) = project(&["styles/main.styl", "images/a.png"]);
        let id = resolver.register_destination("styles/main.css").unwrap();
        assert_eq!(resolver.file(id).source_path(), Some("styles/main.styl"));
        assert!(resolver.register_destination("images/a.png").is_some());
        assert!(resolver.register_destination("images/missing.png").is_none());
    }

    #[test]
    fn test_unneeded_files() {
        let (dir, mut resolver) = project(&["text/ch01.xhtml"]);
        resolver
            .add_file_from_request(&FileRequest::new("ch01", Group::Text), PathType::Spine)
            .unwrap();
        let package = dir.path().join(".quire/build/t/package");
        fs::create_dir_all(package.join("OEBPS/text")).unwrap();
        fs::write(package.join("OEBPS/text/ch01.xhtml"), "x").unwrap();
        fs::write(package.join("OEBPS/text/old.xhtml"), "x").unwrap();

        assert_eq!(resolver.unneeded_files_in_destination(), vec!["OEBPS/text/old.xhtml"]);
    }
}
