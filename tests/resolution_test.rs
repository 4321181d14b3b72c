//! File resolution and dependency tracking over real source trees.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use proptest::prelude::*;
use quire::file::{File, Generator};
use quire::{Error, FileDatabase, FileFinder, FileRequest, FileResolver, Group, PathType, SourceTree};
use tempfile::TempDir;

fn write(root: &Path, path: &str, contents: &str) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, contents).unwrap();
}

#[test]
fn test_pattern_resolution_is_deterministic() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "text/ch01.xhtml", "<p/>");

    let tree = SourceTree::scan(dir.path());
    let finder = FileFinder::new(&tree);
    for _ in 0..3 {
        assert_eq!(finder.find_file("ch01", &[Group::Text], None).unwrap(), "text/ch01.xhtml");
    }

    write(dir.path(), "other/ch01.md", "# One");
    let tree = SourceTree::scan(dir.path());
    let finder = FileFinder::new(&tree);
    match finder.find_file("ch01", &[Group::Text], None) {
        Err(Error::MultipleFilesFound { candidates, groups, .. }) => {
            assert_eq!(candidates, vec!["other/ch01.md", "text/ch01.xhtml"]);
            assert_eq!(groups, vec![Group::Text]);
        }
        other => panic!("expected MultipleFilesFound, got {other:?}"),
    }
}

#[test]
fn test_hidden_files_are_not_sources() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), ".quire/build/t/package/OEBPS/ch01.xhtml", "<p/>");
    write(dir.path(), "text/ch01.xhtml", "<p/>");

    let tree = SourceTree::scan(dir.path());
    assert_eq!(tree.len(), 1);
}

#[test]
fn test_dependency_propagation() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.rxhtml", "a");
    write(dir.path(), "b.yml", "b");
    write(dir.path(), "c.css", "c");

    let mut db = FileDatabase::new(dir.path(), dir.path().join("db.yml"));
    for path in ["a.rxhtml", "b.yml", "c.css"] {
        db.update_metadata(path);
    }
    db.add_dependency(&["b.yml"], "a.rxhtml").unwrap();
    assert!(!db.changed("a.rxhtml", true));

    write(dir.path(), "c.css", "c, changed");
    assert!(!db.changed("a.rxhtml", true));

    write(dir.path(), "b.yml", "b, changed");
    assert!(db.changed("a.rxhtml", true));
    assert!(!db.changed("a.rxhtml", false));

    db.save().unwrap();
    let reloaded = FileDatabase::load(dir.path(), dir.path().join("db.yml"));
    assert!(reloaded.changed("a.rxhtml", true));
    assert_eq!(reloaded.file_stat("a.rxhtml"), db.file_stat("a.rxhtml"));
}

#[test]
fn test_dependency_on_untracked_file_fails() {
    let dir = TempDir::new().unwrap();
    let mut db = FileDatabase::new(dir.path(), dir.path().join("db.yml"));
    assert!(matches!(
        db.add_dependency(&["b.yml"], "a.rxhtml"),
        Err(Error::NotTracked(ref path)) if path == "a.rxhtml"
    ));
}

const SOURCES: [&str; 8] = [
    "text/ch01.xhtml",
    "text/ch02.md",
    "text/ch03.rxhtml",
    "styles/main.styl",
    "styles/print.css",
    "images/a.png",
    "images/b.jpg",
    "fonts/serif.otf",
];

fn request_strategy() -> impl Strategy<Value = (FileRequest, PathType)> {
    let pattern = prop::sample::select(vec![
        ("ch01", Group::Text, true),
        ("ch02", Group::Text, true),
        ("text/*", Group::Text, false),
        ("styles/*", Group::Style, false),
        ("main", Group::Style, true),
        ("images/*", Group::Image, false),
        ("a", Group::Image, true),
        ("fonts/*", Group::Font, false),
    ]);
    let path_type = prop::sample::select(vec![PathType::Spine, PathType::Manifest, PathType::Package]);
    (pattern, path_type).prop_map(|((source, group, only_one), path_type)| {
        let request = FileRequest::new(source, group);
        let request = if only_one { request } else { request.all() };
        (request, path_type)
    })
}

proptest! {
    #[test]
    fn prop_containment_and_unique_final_paths(requests in prop::collection::vec(request_strategy(), 1..12)) {
        let dir = TempDir::new().unwrap();
        for source in SOURCES {
            write(dir.path(), source, "x");
        }
        let mut resolver = FileResolver::new(SourceTree::scan(dir.path()), dir.path().join("out"), "OEBPS");
        for (request, path_type) in &requests {
            resolver.add_file_from_request(request, *path_type).unwrap();
        }
        resolver.add_file(File::generated(Generator::Nav), PathType::Manifest);

        let manifest: HashSet<_> = resolver.manifest().iter().copied().collect();
        let package: HashSet<_> = resolver.package().iter().copied().collect();
        for id in resolver.spine() {
            prop_assert!(manifest.contains(id));
        }
        for id in &manifest {
            prop_assert!(package.contains(id));
        }

        let mut finals = HashSet::new();
        for (_, file) in resolver.files() {
            prop_assert!(finals.insert(file.final_destination_path.clone()));
        }

        for (request, _) in &requests {
            for &id in resolver.files_from_request(request) {
                let source = resolver.file(id).source().unwrap();
                prop_assert!(source.requests.contains(request));
            }
        }
    }
}
