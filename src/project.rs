//! Project discovery.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::book::Book;
use crate::compiler::Compiler;
use crate::error::{Error, Result};
use crate::util::to_package_path;

const SPEC_SUFFIXES: [&str; 2] = [".book.yml", ".book.yaml"];

/// A book project: a root directory with exactly one specification file.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    spec_path: String,
    book: Book,
}

impl Project {
    /// Locate the specification file in `root` and load the book from it.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let spec = find_spec(&root)?;
        let text = fs::read_to_string(&spec)?;
        let book: Book = serde_yaml::from_str(&text).map_err(|e| Error::Specification {
            path: spec.clone(),
            message: e.to_string(),
        })?;

        let spec_path = spec
            .strip_prefix(&root)
            .map(to_package_path)
            .unwrap_or_else(|_| to_package_path(&spec));
        debug!(spec = %spec_path, title = %book.title, "opened project");
        Ok(Self { root, spec_path, book })
    }

    /// A project around an already loaded book.
    pub fn new(root: impl Into<PathBuf>, spec_path: impl Into<String>, book: Book) -> Self {
        Self {
            root: root.into(),
            spec_path: spec_path.into(),
            book,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Specification file path, relative to the root.
    pub fn spec_path(&self) -> &str {
        &self.spec_path
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    /// A compiler with default configuration and collaborators.
    pub fn compiler(self) -> Compiler {
        Compiler::new(self)
    }
}

fn find_spec(root: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| SPEC_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
        })
        .collect();
    found.sort();

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(Error::Specification {
            path: root.to_path_buf(),
            message: "no *.book.yml specification file found".into(),
        }),
        n => Err(Error::Specification {
            path: root.to_path_buf(),
            message: format!("{n} specification files found, expected exactly one"),
        }),
    }
}
