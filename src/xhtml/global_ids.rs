//! Cross-document anchor linking.
//!
//! A document may declare `id="$intro"` and any other document may link to
//! it with `href="$intro"` without knowing where it will end up. Once every
//! document has been processed, [`collect_ids`] maps each declared id to
//! its owner and [`link_document`] rewrites the markers:
//!
//! ```text
//! <p id="$intro">          ->  <p id="intro">
//! <a href="$intro">        ->  <a href="../text/ch01.xhtml#intro">
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::{GLOBAL_PREFIX, dom, encode_path};
use crate::error::{Error, Result, XmlProblem};
use crate::file::FileId;
use crate::resolver::FileResolver;
use crate::util::{parent_dir, relative_path, write_if_changed};

/// A global link no document declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedGlobalId {
    /// Package path of the linking document.
    pub file: String,
    pub id: String,
}

/// Source documents whose output carried global markers in the last build
/// of a target.
///
/// Rendered documents can produce markers their source bytes do not show,
/// so this record is what keeps them out of the skip path: every listed
/// document is rebuilt and linked again on the next compile.
#[derive(Debug, Clone)]
pub struct MarkedDocuments {
    path: PathBuf,
    sources: BTreeSet<String>,
}

impl MarkedDocuments {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sources: BTreeSet::new(),
        }
    }

    /// Load the record at `path`. `None` when it is missing or unreadable,
    /// in which case nothing is known about earlier markers.
    pub fn load(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let text = fs::read_to_string(&path).ok()?;
        match serde_yaml::from_str::<Option<BTreeSet<String>>>(&text) {
            Ok(sources) => Some(Self {
                path,
                sources: sources.unwrap_or_default(),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt global id record");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, source_path: &str) -> bool {
        self.sources.contains(source_path)
    }

    pub fn insert(&mut self, source_path: impl Into<String>) {
        self.sources.insert(source_path.into());
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Persist to disk. Returns whether the file was rewritten.
    pub fn save(&self) -> Result<bool> {
        let text = serde_yaml::to_string(&self.sources)?;
        let wrote = write_if_changed(&self.path, text.as_bytes())?;
        if wrote {
            debug!(path = %self.path.display(), documents = self.sources.len(), "saved global id record");
        }
        Ok(wrote)
    }
}

/// Map every declared global id to the file declaring it.
///
/// `files` is visited in order, so the first declaration wins. A second
/// declaration is an error in release builds and a warning otherwise.
pub fn collect_ids(resolver: &FileResolver, files: &[FileId], release: bool) -> Result<BTreeMap<String, FileId>> {
    let mut owners: BTreeMap<String, FileId> = BTreeMap::new();
    for &id in files {
        let file = resolver.file(id);
        for global in &file.global_ids {
            match owners.get(global) {
                Some(&first) if first != id => {
                    let first = resolver.file(first).pkg_destination_path.clone();
                    let second = file.pkg_destination_path.clone();
                    if release {
                        return Err(Error::DuplicateGlobalId {
                            id: global.clone(),
                            first,
                            second,
                        });
                    }
                    warn!(id = %global, %first, %second, "duplicate global id");
                }
                Some(_) => {}
                None => {
                    owners.insert(global.clone(), id);
                }
            }
        }
    }
    Ok(owners)
}

/// Result of [`link_document`].
#[derive(Debug, Clone, Default)]
pub struct LinkedDocument {
    pub content: String,
    pub unresolved: Vec<UnresolvedGlobalId>,
}

/// Strip markers from declared ids and point global links at their owners.
pub fn link_document(
    content: &str,
    id: FileId,
    owners: &BTreeMap<String, FileId>,
    resolver: &FileResolver,
    problems: &mut Vec<XmlProblem>,
) -> LinkedDocument {
    let file = resolver.file(id);
    let pkg_path = file.pkg_destination_path.as_str();
    let dir = parent_dir(&file.destination_path);
    let mut doc = dom::parse(content, pkg_path, problems);
    let mut unresolved = Vec::new();

    doc.walk_mut(&mut |e| {
        if let Some(declared) = e.attr("id").and_then(|v| v.strip_prefix(GLOBAL_PREFIX).map(str::to_string)) {
            e.set_attr("id", &declared);
        }

        let Some(global) = e.attr("href").and_then(|v| v.strip_prefix(GLOBAL_PREFIX).map(str::to_string)) else {
            return;
        };
        match owners.get(&global) {
            Some(&owner) if owner == id => e.set_attr("href", &format!("#{global}")),
            Some(&owner) => {
                let target = &resolver.file(owner).destination_path;
                e.set_attr("href", &format!("{}#{global}", encode_path(&relative_path(dir, target))));
            }
            None => {
                error!(path = %pkg_path, id = %global, "link to undeclared global id");
                unresolved.push(UnresolvedGlobalId {
                    file: pkg_path.to_string(),
                    id: global,
                });
            }
        }
    });

    LinkedDocument {
        content: dom::serialize(&doc),
        unresolved,
    }
}
