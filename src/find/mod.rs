//! Pattern-based file lookup.
//!
//! [`FileFinder`] resolves a logical pattern such as `ch01`, `images/*.png`
//! or `**/cover.*` against a [`FileTree`]. The same algorithm runs over the
//! real source tree and over the in-memory destination tree, so references
//! can be resolved before anything is written.
//!
//! Resolution order:
//! 1. inside the context directory, when one is given and lies in the tree;
//! 2. from the tree root;
//! 3. recursively from the root (`**/pattern`), unless the pattern already
//!    starts with `**`.
//!
//! Each step first tries the literal pattern, then `pattern.*` so files can
//! be referenced by base name. Candidates are filtered by the extension
//! allowlist of the requested groups.
//!
//! Results are tree-root-relative even when the context step found them,
//! so they can key the resolver directly. [`FileFinder::find_file_relative`]
//! rebases a result onto the context for callers writing hrefs.

mod glob;
mod tree;

pub use glob::{Glob, has_magic};
pub use tree::{FileTree, SourceTree, VirtualTree};

use crate::book::Group;
use crate::error::{Error, Result};
use crate::util::{join_path, normalize_path, relative_path};

/// Looks files up in a [`FileTree`].
pub struct FileFinder<'t, T: FileTree + ?Sized> {
    tree: &'t T,
}

impl<'t, T: FileTree + ?Sized> FileFinder<'t, T> {
    pub fn new(tree: &'t T) -> Self {
        Self { tree }
    }

    /// Find exactly one file.
    ///
    /// Returns the path relative to the tree root (not to `context`), or
    /// [`Error::FileNotFound`] / [`Error::MultipleFilesFound`].
    pub fn find_file(&self, pattern: &str, groups: &[Group], context: Option<&str>) -> Result<String> {
        let mut found = self.find_files(pattern, groups, context)?;
        if found.len() > 1 {
            return Err(Error::MultipleFilesFound {
                pattern: pattern.to_string(),
                groups: groups.to_vec(),
                context: context.map(str::to_string),
                candidates: found,
            });
        }
        Ok(found.remove(0))
    }

    /// Like [`find_file`](Self::find_file), but the result is relative to
    /// the `context` directory, ready to be written into a document there.
    pub fn find_file_relative(&self, pattern: &str, groups: &[Group], context: &str) -> Result<String> {
        let found = self.find_file(pattern, groups, Some(context))?;
        let dir = normalize_path(context).unwrap_or_default();
        Ok(relative_path(&dir, &found))
    }

    /// Find every file matching at the first resolution step that yields
    /// anything. Errors with [`Error::FileNotFound`] when nothing matches.
    pub fn find_files(&self, pattern: &str, groups: &[Group], context: Option<&str>) -> Result<Vec<String>> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(not_found(pattern, context));
        }

        if let Some(ctx) = context.and_then(normalize_path)
            && !ctx.is_empty()
            && self.tree.is_dir(&ctx)
        {
            let found = self.search(&ctx, pattern, groups);
            if !found.is_empty() {
                return Ok(found);
            }
        }

        let found = self.search("", pattern, groups);
        if !found.is_empty() {
            return Ok(found);
        }

        let pattern = pattern.trim_start_matches('/');
        if !pattern.starts_with("**") {
            let found = self.search("", &format!("**/{pattern}"), groups);
            if !found.is_empty() {
                return Ok(found);
            }
        }

        Err(not_found(pattern, context))
    }

    /// One resolution step: literal pattern, then with a wildcard extension.
    fn search(&self, dir: &str, pattern: &str, groups: &[Group]) -> Vec<String> {
        let Some(full) = normalize_path(&join_path(dir, pattern.trim_start_matches('/'))) else {
            return Vec::new();
        };
        if full.is_empty() {
            return Vec::new();
        }

        let found = self.matching(&full, groups);
        if !found.is_empty() {
            return found;
        }
        self.matching(&format!("{full}.*"), groups)
    }

    fn matching(&self, pattern: &str, groups: &[Group]) -> Vec<String> {
        if !has_magic(pattern) {
            return if self.tree.contains(pattern) && Group::accepts(groups, pattern) {
                vec![pattern.to_string()]
            } else {
                Vec::new()
            };
        }

        let glob = Glob::new(pattern);
        self.tree
            .files()
            .filter(|path| glob.is_match(path) && Group::accepts(groups, path))
            .map(str::to_string)
            .collect()
    }
}

fn not_found(pattern: &str, context: Option<&str>) -> Error {
    Error::FileNotFound {
        pattern: pattern.to_string(),
        context: context.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(paths: &[&str]) -> VirtualTree {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_find_by_base_name() {
        let tree = tree(&["text/ch01.xhtml", "text/ch02.xhtml", "images/cover.png"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(finder.find_file("ch01", &[Group::Text], None).unwrap(), "text/ch01.xhtml");
        assert_eq!(
            finder.find_file("images/cover", &[Group::Image], None).unwrap(),
            "images/cover.png"
        );
    }

    #[test]
    fn test_ambiguity_is_reported() {
        let tree = tree(&["text/ch01.xhtml", "other/ch01.md"]);
        let finder = FileFinder::new(&tree);
        match finder.find_file("ch01", &[Group::Text], None) {
            Err(Error::MultipleFilesFound { candidates, .. }) => {
                assert_eq!(candidates, vec!["other/ch01.md", "text/ch01.xhtml"]);
            }
            other => panic!("expected MultipleFilesFound, got {other:?}"),
        }
    }

    #[test]
    fn test_context_wins_over_root() {
        let tree = tree(&["a/note.xhtml", "b/note.xhtml"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(finder.find_file("note", &[Group::Text], Some("b")).unwrap(), "b/note.xhtml");
        assert!(finder.find_file("note", &[Group::Text], None).is_err());
    }

    #[test]
    fn test_context_relative_parent() {
        let tree = tree(&["text/ch01.xhtml", "images/a.png"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(
            finder.find_file("../images/a.png", &[Group::Image], Some("text")).unwrap(),
            "images/a.png"
        );
    }

    #[test]
    fn test_results_are_root_relative_unless_rebased() {
        let tree = tree(&["text/ch01.xhtml", "text/notes/n1.xhtml", "images/a.png"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(finder.find_file("notes/n1", &[Group::Text], Some("text")).unwrap(), "text/notes/n1.xhtml");
        assert_eq!(
            finder.find_file_relative("notes/n1", &[Group::Text], "text").unwrap(),
            "notes/n1.xhtml"
        );
        assert_eq!(
            finder.find_file_relative("a", &[Group::Image], "text/notes").unwrap(),
            "../../images/a.png"
        );
    }

    #[test]
    fn test_group_filtering() {
        let tree = tree(&["text/ch01.xhtml", "text/ch01.css"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(finder.find_file("ch01", &[Group::Style], None).unwrap(), "text/ch01.css");
        assert_eq!(finder.find_file("ch01", &[Group::Text], None).unwrap(), "text/ch01.xhtml");
        assert!(matches!(
            finder.find_file("ch01", &[Group::Image], None),
            Err(Error::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_find_all_with_glob() {
        let tree = tree(&["fonts/a.otf", "fonts/b.ttf", "fonts/readme.txt"]);
        let finder = FileFinder::new(&tree);
        let found = finder.find_files("fonts/*", &[Group::Font], None).unwrap();
        assert_eq!(found, vec!["fonts/a.otf", "fonts/b.ttf"]);
    }

    #[test]
    fn test_escaping_context_is_ignored() {
        let tree = tree(&["ch01.xhtml"]);
        let finder = FileFinder::new(&tree);
        assert_eq!(finder.find_file("ch01", &[Group::Text], Some("../..")).unwrap(), "ch01.xhtml");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_unique_name_is_found_anywhere(dirs in proptest::collection::vec("[a-z]{1,6}", 0..4), name in "[a-z]{1,8}") {
                let path = if dirs.is_empty() {
                    format!("{name}.xhtml")
                } else {
                    format!("{}/{name}.xhtml", dirs.join("/"))
                };
                let tree: VirtualTree = std::iter::once(path.clone()).collect();
                let finder = FileFinder::new(&tree);
                prop_assert_eq!(finder.find_file(&name, &[Group::Text], None).unwrap(), path);
            }
        }
    }
}
