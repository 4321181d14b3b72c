//! Persistent dependency graph for incremental builds.
//!
//! A [`FileDatabase`] maps project-relative paths to a [`FileStat`]: a cheap
//! fingerprint (`mtime`, `ctime`, `size`) plus the paths the file's build
//! output depends on. Two databases are kept per build: one for the source
//! tree regardless of target, and one for the target being built.
//!
//! # Storage
//!
//! ```text
//! .quire/source-db.yml                 # source-level database
//! .quire/build/<target>/target-db.yml  # target-level database
//! ```
//!
//! A missing or unreadable database file loads as an empty database, which
//! simply forces a full rebuild.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::write_if_changed;

/// Change-detection fingerprint. All fields are `None` for files that did
/// not exist when snapshotted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime: Option<u64>,
    /// Status change time in nanoseconds since the Unix epoch.
    pub ctime: Option<u64>,
    pub size: Option<u64>,
}

impl Fingerprint {
    /// Stat `path`; a missing file yields an empty fingerprint.
    pub fn of(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => Self {
                mtime: meta.modified().ok().and_then(nanos_since_epoch),
                ctime: change_time(&meta),
                size: Some(meta.len()),
            },
            Err(_) => Self::default(),
        }
    }

    pub fn exists(&self) -> bool {
        self.size.is_some()
    }
}

#[cfg(unix)]
fn change_time(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u64::try_from(meta.ctime_nsec()).ok()?;
    Some(secs * 1_000_000_000 + nanos)
}

#[cfg(not(unix))]
fn change_time(meta: &fs::Metadata) -> Option<u64> {
    meta.created().ok().and_then(nanos_since_epoch)
}

fn nanos_since_epoch(time: SystemTime) -> Option<u64> {
    let nanos = time.duration_since(UNIX_EPOCH).ok()?.as_nanos();
    u64::try_from(nanos).ok()
}

/// Snapshot of one tracked file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    #[serde(skip)]
    pub file_path: String,
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub dependency_paths: Vec<String>,
}

/// Path-keyed store of [`FileStat`]s persisted as YAML.
#[derive(Debug, Clone)]
pub struct FileDatabase {
    root: PathBuf,
    db_path: PathBuf,
    files: BTreeMap<String, FileStat>,
}

impl FileDatabase {
    /// An empty database resolving paths against `root` and persisting to `db_path`.
    pub fn new(root: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            db_path: db_path.into(),
            files: BTreeMap::new(),
        }
    }

    /// Load from `db_path`, degrading to an empty database when the file is
    /// missing or corrupt.
    pub fn load(root: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        let mut db = Self::new(root, db_path);
        let text = match fs::read_to_string(&db.db_path) {
            Ok(text) => text,
            Err(_) => {
                debug!(path = %db.db_path.display(), "no dependency database, starting empty");
                return db;
            }
        };

        match serde_yaml::from_str::<Option<BTreeMap<String, FileStat>>>(&text) {
            Ok(files) => {
                db.files = files.unwrap_or_default();
                for (path, stat) in db.files.iter_mut() {
                    stat.file_path = path.clone();
                }
            }
            Err(e) => {
                warn!(path = %db.db_path.display(), error = %e, "corrupt dependency database, forcing full rebuild");
            }
        }
        db
    }

    /// Persist to disk. Returns whether the file was rewritten.
    pub fn save(&self) -> Result<bool> {
        let text = serde_yaml::to_string(&self.files)?;
        Ok(write_if_changed(&self.db_path, text.as_bytes())?)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn file_stat(&self, path: &str) -> Option<&FileStat> {
        self.files.get(path)
    }

    /// Snapshot the current fingerprint of `path`, keeping recorded dependencies.
    pub fn update_metadata(&mut self, path: &str) {
        let fingerprint = Fingerprint::of(&self.root.join(path));
        let stat = self.files.entry(path.to_string()).or_insert_with(|| FileStat {
            file_path: path.to_string(),
            ..Default::default()
        });
        stat.fingerprint = fingerprint;
    }

    /// Record that the build output of `to` depends on each of `paths`.
    ///
    /// `to` must already be tracked. Unknown dependency paths are snapshotted
    /// on first sight, including paths that do not exist yet.
    pub fn add_dependency<S: AsRef<str>>(&mut self, paths: &[S], to: &str) -> Result<()> {
        if !self.files.contains_key(to) {
            return Err(Error::NotTracked(to.to_string()));
        }

        for path in paths {
            let path = path.as_ref();
            if path == to {
                continue;
            }
            if !self.files.contains_key(path) {
                self.update_metadata(path);
            }
            if let Some(stat) = self.files.get_mut(to)
                && !stat.dependency_paths.iter().any(|p| p == path)
            {
                stat.dependency_paths.push(path.to_string());
            }
        }
        Ok(())
    }

    /// Whether `path` changed since it was last snapshotted.
    ///
    /// Unknown paths count as changed. With `transitive`, a change in any
    /// (recursive) dependency also counts.
    pub fn changed(&self, path: &str, transitive: bool) -> bool {
        let mut visited = HashSet::new();
        self.changed_inner(path, transitive, &mut visited)
    }

    fn changed_inner<'a>(&'a self, path: &'a str, transitive: bool, visited: &mut HashSet<&'a str>) -> bool {
        if !visited.insert(path) {
            return false;
        }
        let Some(stat) = self.files.get(path) else {
            return true;
        };
        if Fingerprint::of(&self.root.join(path)) != stat.fingerprint {
            return true;
        }
        transitive
            && stat
                .dependency_paths
                .iter()
                .any(|dep| self.changed_inner(dep, true, visited))
    }

    /// Every path reachable from `paths` through dependency edges, including
    /// the starting paths.
    pub fn dependency_closure<'a, I>(&self, paths: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashSet::new();
        let mut stack: Vec<String> = paths.into_iter().map(str::to_string).collect();
        while let Some(path) = stack.pop() {
            if !out.insert(path.clone()) {
                continue;
            }
            if let Some(stat) = self.files.get(&path) {
                stack.extend(stat.dependency_paths.iter().cloned());
            }
        }
        out
    }

    /// Drop every entry not in `keep_paths` and prune dependency lists down
    /// to surviving entries.
    pub fn cleanup(&mut self, keep_paths: &HashSet<String>) {
        let before = self.files.len();
        self.files.retain(|path, _| keep_paths.contains(path));

        let alive: HashSet<String> = self.files.keys().cloned().collect();
        for stat in self.files.values_mut() {
            stat.dependency_paths.retain(|dep| alive.contains(dep));
        }

        let removed = before - self.files.len();
        if removed > 0 {
            debug!(removed, path = %self.db_path.display(), "pruned dependency database");
        }
    }

    /// Re-snapshot every path that some entry depends on.
    ///
    /// Runs once at the end of a build, after every dependent has been
    /// checked against the old snapshots.
    pub fn refresh_dependencies(&mut self) {
        let deps: HashSet<String> = self
            .files
            .values()
            .flat_map(|stat| stat.dependency_paths.iter().cloned())
            .collect();
        for dep in deps {
            self.update_metadata(&dep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::TempDir::new().unwrap(),
            }
        }

        fn write(&self, name: &str, contents: &str) {
            fs::write(self.dir.path().join(name), contents).unwrap();
        }

        fn db(&self) -> FileDatabase {
            FileDatabase::new(self.dir.path(), self.dir.path().join("db.yml"))
        }
    }

    #[test]
    fn test_unknown_path_is_changed() {
        let fx = Fixture::new();
        fx.write("a.md", "a");
        let db = fx.db();
        assert!(db.changed("a.md", false));
    }

    #[test]
    fn test_snapshot_then_unchanged() {
        let fx = Fixture::new();
        fx.write("a.md", "a");
        let mut db = fx.db();
        db.update_metadata("a.md");
        assert!(!db.changed("a.md", true));

        fx.write("a.md", "longer");
        assert!(db.changed("a.md", false));
    }

    #[test]
    fn test_dependency_propagation() {
        let fx = Fixture::new();
        fx.write("a.md", "a");
        fx.write("b.css", "b");
        fx.write("c.css", "c");
        let mut db = fx.db();
        db.update_metadata("a.md");
        db.update_metadata("c.css");
        db.add_dependency(&["b.css"], "a.md").unwrap();

        fx.write("c.css", "changed c");
        assert!(!db.changed("a.md", true));

        fx.write("b.css", "changed b");
        assert!(db.changed("a.md", true));
        assert!(!db.changed("a.md", false));
    }

    #[test]
    fn test_transitive_chain_and_cycles() {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fx.write(name, name);
        }
        let mut db = fx.db();
        db.update_metadata("a");
        db.add_dependency(&["b"], "a").unwrap();
        db.add_dependency(&["c"], "b").unwrap();
        db.add_dependency(&["a"], "c").unwrap();
        assert!(!db.changed("a", true));

        fx.write("c", "cc");
        assert!(db.changed("a", true));
    }

    #[test]
    fn test_add_dependency_requires_tracked_target() {
        let fx = Fixture::new();
        let mut db = fx.db();
        assert!(matches!(db.add_dependency(&["x"], "y"), Err(Error::NotTracked(_))));
    }

    #[test]
    fn test_missing_dependency_appearing_is_a_change() {
        let fx = Fixture::new();
        fx.write("a.md", "a");
        let mut db = fx.db();
        db.update_metadata("a.md");
        db.add_dependency(&["optional.css"], "a.md").unwrap();
        assert!(!db.changed("a.md", true));
        assert!(!db.file_stat("optional.css").unwrap().fingerprint.exists());

        fx.write("optional.css", "x");
        assert!(db.changed("a.md", true));
    }

    #[test]
    fn test_cleanup_prunes_edges() {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fx.write(name, name);
        }
        let mut db = fx.db();
        db.update_metadata("a");
        db.add_dependency(&["b", "c"], "a").unwrap();

        let keep: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        db.cleanup(&keep);
        assert_eq!(db.len(), 2);
        assert_eq!(db.file_stat("a").unwrap().dependency_paths, vec!["c"]);
    }

    #[test]
    fn test_dependency_closure() {
        let fx = Fixture::new();
        let mut db = fx.db();
        db.update_metadata("a");
        db.add_dependency(&["b"], "a").unwrap();
        db.add_dependency(&["c"], "b").unwrap();
        db.update_metadata("z");

        let closure = db.dependency_closure(["a"]);
        assert_eq!(closure.len(), 3);
        assert!(!closure.contains("z"));
    }

    #[test]
    fn test_round_trip_and_corruption() {
        let fx = Fixture::new();
        fx.write("a.md", "a");
        let mut db = fx.db();
        db.update_metadata("a.md");
        db.add_dependency(&["b.css"], "a.md").unwrap();
        assert!(db.save().unwrap());
        assert!(!db.save().unwrap());

        let loaded = FileDatabase::load(fx.dir.path(), fx.dir.path().join("db.yml"));
        assert_eq!(loaded.file_stat("a.md"), db.file_stat("a.md"));
        assert_eq!(loaded.file_stat("a.md").unwrap().file_path, "a.md");

        fx.write("db.yml", "a.md: [unclosed");
        let corrupt = FileDatabase::load(fx.dir.path(), fx.dir.path().join("db.yml"));
        assert!(corrupt.is_empty());
    }

    #[test]
    fn test_refresh_dependencies() {
        let fx = Fixture::new();
        fx.write("a", "a");
        fx.write("b", "b");
        let mut db = fx.db();
        db.update_metadata("a");
        db.add_dependency(&["b"], "a").unwrap();

        std::thread::sleep(Duration::from_millis(5));
        fx.write("b", "bigger b");
        assert!(db.changed("a", true));
        db.refresh_dependencies();
        assert!(!db.changed("a", true));
    }
}
