//! Build orchestration.
//!
//! A [`Compiler`] turns a [`Project`] into an EPUB for one target:
//!
//! 1. register every file the book names (TOC, other files, cover) plus
//!    the generated package documents
//! 2. process each source file once, skipping files both databases
//!    consider up to date (pass 1)
//! 3. link global ids across all documents (pass 2)
//! 4. generate the navigation and package documents
//! 5. remove stale artifacts, persist the databases and update the archive

pub mod archive;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::book::{FileRequest, Target};
use crate::collab::Collaborators;
use crate::config::CompilerConfig;
use crate::database::FileDatabase;
use crate::error::{Error, Result, XmlProblem};
use crate::file::{self, File, FileId, FileState, Generator, PathType, ProcessContext, write_document};
use crate::find::SourceTree;
use crate::generate::meta_inf::needs_display_options;
use crate::project::Project;
use crate::resolver::FileResolver;
use crate::util::join_path;
use crate::xhtml::global_ids::{self, MarkedDocuments, UnresolvedGlobalId};
use crate::xhtml::{check_problems, contains_global_marker};

use archive::{ArchiveStats, Entry};

/// Shared flag that aborts an in-flight compile at the next file boundary.
///
/// Clones observe the same flag, so a watcher thread can cancel a compile
/// running elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the flag so the token can guard the next compile.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Summary of one compile.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub target: String,
    /// Source files processed in pass 1.
    pub processed: usize,
    /// Source files found up to date.
    pub skipped: usize,
    /// Destination files written (pass 1, pass 2 and generated documents).
    pub written: usize,
    /// Stale destination files deleted.
    pub removed: usize,
    pub problems: Vec<XmlProblem>,
    pub unresolved_global_ids: Vec<UnresolvedGlobalId>,
    /// Path of the EPUB archive.
    pub archive: PathBuf,
    pub archive_stats: ArchiveStats,
}

/// Compiles a project into EPUB archives.
pub struct Compiler {
    project: Project,
    config: CompilerConfig,
    collaborators: Collaborators,
    cancel: CancelToken,
}

impl Compiler {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            config: CompilerConfig::default(),
            collaborators: Collaborators::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Token cancelling this compiler's builds.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Working directory holding databases, caches and build trees.
    pub fn working_dir(&self) -> PathBuf {
        self.project.root().join(&self.config.working_dir)
    }

    /// Directory holding the build tree and database of `target`.
    pub fn build_dir(&self, target: &str) -> PathBuf {
        self.working_dir().join("build").join(target)
    }

    /// Root of the package tree for `target`.
    pub fn destination_root(&self, target: &str) -> PathBuf {
        self.build_dir(target).join("package")
    }

    /// Where the archive for `target` is written.
    pub fn archive_path(&self, target: &str) -> PathBuf {
        match &self.config.output {
            Some(output) => self.project.root().join(output),
            None => self
                .project
                .root()
                .join(format!("{}-{}.epub", self.project.book().slug(), target)),
        }
    }

    /// Build `target` and update its archive.
    #[instrument(skip(self), fields(root = %self.project.root().display(), release = self.config.release))]
    pub fn compile(&self, target: &str) -> Result<CompileReport> {
        let target = self
            .project
            .book()
            .target(target)
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))?;

        let mut build = Build::new(self, target)?;
        build.register_files()?;
        build.process_sources()?;
        build.link_global_ids()?;
        build.check_problems()?;
        build.generate()?;
        build.remove_unneeded()?;
        build.checkpoint()?;
        build.save_databases()?;
        build.archive()?;

        let report = build.report;
        info!(
            target = %report.target,
            processed = report.processed,
            skipped = report.skipped,
            written = report.written,
            removed = report.removed,
            "compile finished"
        );
        Ok(report)
    }
}

/// State of one compile.
struct Build<'a> {
    compiler: &'a Compiler,
    target: &'a Target,
    resolver: FileResolver,
    source_db: FileDatabase,
    target_db: FileDatabase,
    /// Documents that carried global markers in the previous build.
    marked: MarkedDocuments,
    problems: Vec<XmlProblem>,
    template_cache: PathBuf,
    report: CompileReport,
}

impl<'a> Build<'a> {
    fn new(compiler: &'a Compiler, target: &'a Target) -> Result<Self> {
        let root = compiler.project.root();
        let working_dir = compiler.working_dir();
        let build_dir = compiler.build_dir(&target.name);
        let template_cache = working_dir.join("cache").join("templates");
        fs::create_dir_all(&template_cache)?;
        fs::create_dir_all(&build_dir)?;

        let source_db = FileDatabase::load(root, working_dir.join("source-db.yml"));
        let mut target_db = FileDatabase::load(root, build_dir.join("target-db.yml"));
        let marked_path = build_dir.join("global-ids.yml");
        let marked = match MarkedDocuments::load(&marked_path) {
            Some(marked) => marked,
            None => {
                if !target_db.is_empty() {
                    warn!(target = %target.name, "global id record missing, rebuilding target");
                    target_db = FileDatabase::new(root, build_dir.join("target-db.yml"));
                }
                MarkedDocuments::new(marked_path)
            }
        };
        let resolver = FileResolver::new(
            SourceTree::scan(root),
            compiler.destination_root(&target.name),
            compiler.config.content_folder.clone(),
        );
        debug!(sources = resolver.source_tree().len(), "scanned source tree");

        Ok(Self {
            compiler,
            target,
            resolver,
            source_db,
            target_db,
            marked,
            problems: Vec::new(),
            template_cache,
            report: CompileReport {
                target: target.name.clone(),
                archive: compiler.archive_path(&target.name),
                ..Default::default()
            },
        })
    }

    fn context(&mut self) -> ProcessContext<'_> {
        ProcessContext {
            book: self.compiler.project.book(),
            target: self.target,
            config: &self.compiler.config,
            collaborators: &self.compiler.collaborators,
            resolver: &mut self.resolver,
            problems: &mut self.problems,
            source_db: &self.source_db,
            template_cache: &self.template_cache,
            spec_path: self.compiler.project.spec_path(),
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if self.compiler.cancel.is_cancelled() {
            info!(target = %self.target.name, "compile cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Register the book's files and the generated package documents.
    fn register_files(&mut self) -> Result<()> {
        let book = self.compiler.project.book();

        for item in book.toc_items() {
            let Some(request) = &item.file else { continue };
            for id in self.resolver.add_file_from_request(request, PathType::Spine)? {
                let file = self.resolver.file_mut(id);
                if file.title.is_none() {
                    file.title = item.title.clone();
                }
                file.linear &= item.linear;
            }
        }

        for request in &book.other_files {
            self.resolver.add_file_from_request(request, PathType::Manifest)?;
        }

        if let Some(cover) = self.target.cover_image.as_ref().or(book.cover_image.as_ref()) {
            let request: FileRequest = cover.clone().with_property("cover-image");
            self.resolver.add_file_from_request(&request, PathType::Manifest)?;
        }

        let mut generators = vec![Generator::MimeType, Generator::ContainerXml];
        if needs_display_options(self.target) {
            generators.push(Generator::IbooksDisplayOptions);
        }
        generators.push(if self.target.is_epub3() { Generator::Nav } else { Generator::Ncx });
        generators.push(Generator::Opf);

        for generator in generators {
            let mut file = File::generated(generator);
            if generator == Generator::Opf {
                file.destination_path = join_path(&self.compiler.config.content_folder, generator.destination_path());
            }
            self.resolver.add_file(file, generator.path_type());
        }

        debug!(
            spine = self.resolver.spine().len(),
            manifest = self.resolver.manifest().len(),
            "registered files"
        );
        Ok(())
    }

    /// Pass 1: process every source file exactly once.
    ///
    /// Files discovered while processing are appended to the resolver and
    /// picked up by the same loop.
    fn process_sources(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.resolver.len() {
            let id = index;
            index += 1;
            self.checkpoint()?;

            let Some(source_path) = self.resolver.file(id).source_path().map(str::to_string) else {
                continue;
            };

            if up_to_date(&self.source_db, &self.target_db, &self.marked, self.resolver.file(id)) {
                debug!(path = %source_path, "up to date");
                file::restore(id, &mut self.context())?;
                self.report.skipped += 1;
                continue;
            }

            let processed = file::process(id, &mut self.context())?;
            debug!(path = %source_path, wrote = processed.wrote, "processed");
            self.report.processed += 1;
            if processed.wrote {
                self.report.written += 1;
            }

            for db in [&mut self.source_db, &mut self.target_db] {
                db.update_metadata(&source_path);
                db.add_dependency(&processed.dependencies, &source_path)?;
            }
        }
        Ok(())
    }

    /// Pass 2: resolve global ids now that every document is known.
    fn link_global_ids(&mut self) -> Result<()> {
        self.checkpoint()?;
        let documents: Vec<FileId> = self
            .resolver
            .files()
            .filter(|(_, file)| file.is_xhtml() && file.state == FileState::Processed && file.has_global_markers())
            .map(|(id, _)| id)
            .collect();
        if documents.is_empty() {
            return Ok(());
        }

        let owners = global_ids::collect_ids(&self.resolver, &documents, self.compiler.config.release)?;
        debug!(ids = owners.len(), documents = documents.len(), "linking global ids");

        for id in documents {
            self.checkpoint()?;
            let Some(content) = self.resolver.file_mut(id).pending_content.take() else {
                continue;
            };
            let linked = global_ids::link_document(&content, id, &owners, &self.resolver, &mut self.problems);
            self.report.unresolved_global_ids.extend(linked.unresolved);
            if write_document(&self.context(), id, linked.content)? {
                self.report.written += 1;
            }
        }
        Ok(())
    }

    /// Fail release builds on XML problems from either pass, warn otherwise.
    fn check_problems(&self) -> Result<()> {
        check_problems(&self.problems, self.compiler.config.release)
    }

    /// Generate the package documents, the OPF last so it sees the final
    /// manifest.
    fn generate(&mut self) -> Result<()> {
        self.checkpoint()?;
        let mut generated: Vec<(FileId, Generator)> = self
            .resolver
            .files()
            .filter_map(|(id, file)| file.generator().map(|g| (id, g)))
            .collect();
        generated.sort_by_key(|&(_, generator)| generator == Generator::Opf);

        for (id, generator) in generated {
            let processed = file::process(id, &mut self.context())?;
            debug!(?generator, wrote = processed.wrote, "generated");
            if processed.wrote {
                self.report.written += 1;
            }
        }
        Ok(())
    }

    /// Delete destination files left over from earlier builds.
    fn remove_unneeded(&mut self) -> Result<()> {
        let root = self.resolver.destination_root().to_path_buf();
        for path in self.resolver.unneeded_files_in_destination() {
            debug!(path = %path, "removing stale file");
            fs::remove_file(root.join(&path))?;
            self.report.removed += 1;
        }
        prune_empty_dirs(&root);
        Ok(())
    }

    fn save_databases(&mut self) -> Result<()> {
        let live: Vec<&str> = self
            .resolver
            .files()
            .filter_map(|(_, file)| file.source_path())
            .collect();

        for db in [&mut self.source_db, &mut self.target_db] {
            let keep: HashSet<String> = db.dependency_closure(live.iter().copied());
            db.cleanup(&keep);
            db.refresh_dependencies();
            db.save()?;
        }

        let mut marked = MarkedDocuments::new(self.marked.path());
        for (_, file) in self.resolver.files() {
            if file.has_global_markers()
                && let Some(source_path) = file.source_path()
            {
                marked.insert(source_path);
            }
        }
        marked.save()?;
        self.marked = marked;
        self.report.problems = std::mem::take(&mut self.problems);
        Ok(())
    }

    fn archive(&mut self) -> Result<()> {
        let entries: Vec<Entry> = self
            .resolver
            .package()
            .iter()
            .map(|&id| self.resolver.file(id))
            .map(|file| Entry {
                name: file.pkg_destination_path.clone(),
                source: file.final_destination_path.clone(),
            })
            .collect();
        self.report.archive_stats =
            archive::write_archive(&self.report.archive, &entries, self.compiler.config.compression_level)?;
        Ok(())
    }
}

/// Whether `file` can keep its previous output.
///
/// The target database must consider the source and its dependencies
/// unchanged, the source database must hold the very same snapshot, and
/// the output must still exist. Documents that carried global markers last
/// time, or whose source shows one, are always rebuilt so pass 2 sees every
/// declared id and link.
fn up_to_date(source_db: &FileDatabase, target_db: &FileDatabase, marked: &MarkedDocuments, file: &File) -> bool {
    let Some(source) = file.source() else {
        return false;
    };
    let source_path = source.source_path.as_str();
    if target_db.changed(source_path, true) {
        return false;
    }
    if source_db.file_stat(source_path) != target_db.file_stat(source_path) {
        return false;
    }
    if !file.final_destination_path.exists() {
        return false;
    }
    if !source.format.is_xhtml() {
        return true;
    }
    if marked.contains(source_path) {
        return false;
    }
    fs::read(&source.abs_source_path)
        .map(|bytes| !contains_global_marker(&bytes))
        .unwrap_or(false)
}

/// Remove empty directories below `root`, deepest first.
fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let is_empty = fs::read_dir(entry.path())
            .map(|mut dir| dir.next().is_none())
            .unwrap_or(false);
        if is_empty && let Err(e) = fs::remove_dir(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "cannot remove empty directory");
        }
    }
}
