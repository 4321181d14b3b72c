//! File trees the finder searches: the real source tree on disk and the
//! in-memory destination tree.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::util::{normalize_path, to_package_path};

/// A searchable set of files addressed by `/`-separated relative paths.
pub trait FileTree {
    /// Every file path in the tree, sorted.
    fn files(&self) -> Box<dyn Iterator<Item = &str> + '_>;

    /// Whether `dir` is a directory of this tree (`""` is the root).
    fn is_dir(&self, dir: &str) -> bool;

    fn contains(&self, path: &str) -> bool;
}

/// In-memory tree of files that need not exist on disk yet.
///
/// Directories are implied by the files they contain.
#[derive(Debug, Clone, Default)]
pub struct VirtualTree {
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
}

impl VirtualTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file (and its parent directories). Paths escaping the root are ignored.
    pub fn insert(&mut self, path: &str) {
        let Some(path) = normalize_path(path) else {
            return;
        };
        if path.is_empty() {
            return;
        }
        let mut dir = path.as_str();
        while let Some(idx) = dir.rfind('/') {
            dir = &dir[..idx];
            if !self.dirs.insert(dir.to_string()) {
                break;
            }
        }
        self.files.insert(path);
    }

    /// Remove a file. Directories stay until [`VirtualTree::rebuild_dirs`].
    pub fn remove(&mut self, path: &str) -> bool {
        self.files.remove(path)
    }

    pub fn rebuild_dirs(&mut self) {
        let files = std::mem::take(&mut self.files);
        self.dirs.clear();
        for file in &files {
            self.insert(file);
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FromIterator<String> for VirtualTree {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut tree = VirtualTree::new();
        for path in iter {
            tree.insert(&path);
        }
        tree
    }
}

impl FileTree for VirtualTree {
    fn files(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.files.iter().map(String::as_str))
    }

    fn is_dir(&self, dir: &str) -> bool {
        dir.is_empty() || self.dirs.contains(dir)
    }

    fn contains(&self, path: &str) -> bool {
        self.files.contains(path)
    }
}

/// Snapshot of the project's source files on disk.
///
/// Hidden files and directories (leading `.`) are skipped, which keeps the
/// working directory and VCS metadata out of every search.
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
    tree: VirtualTree,
}

impl SourceTree {
    /// Scan `root` recursively.
    pub fn scan(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut tree = VirtualTree::new();

        let walker = WalkDir::new(&root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&root) {
                tree.insert(&to_package_path(rel));
            }
        }

        debug!(root = %root.display(), files = tree.len(), "scanned source tree");
        Self { root, tree }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl FileTree for SourceTree {
    fn files(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        self.tree.files()
    }

    fn is_dir(&self, dir: &str) -> bool {
        self.tree.is_dir(dir)
    }

    fn contains(&self, path: &str) -> bool {
        self.tree.contains(path)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_virtual_tree_dirs() {
        let tree: VirtualTree = ["OEBPS/text/ch01.xhtml".to_string(), "mimetype".to_string()]
            .into_iter()
            .collect();
        assert!(tree.is_dir(""));
        assert!(tree.is_dir("OEBPS"));
        assert!(tree.is_dir("OEBPS/text"));
        assert!(!tree.is_dir("OEBPS/text/ch01.xhtml"));
        assert!(tree.contains("mimetype"));
        assert_eq!(tree.files().count(), 2);
    }

    #[test]
    fn test_source_tree_skips_hidden() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("text")).unwrap();
        fs::create_dir_all(dir.path().join(".quire/build")).unwrap();
        fs::write(dir.path().join("text/ch01.xhtml"), "<p/>").unwrap();
        fs::write(dir.path().join(".quire/build/x.xhtml"), "<p/>").unwrap();
        fs::write(dir.path().join(".DS_Store"), "").unwrap();

        let tree = SourceTree::scan(dir.path());
        let files: Vec<&str> = tree.files().collect();
        assert_eq!(files, vec!["text/ch01.xhtml"]);
        assert!(tree.is_dir("text"));
    }
}
