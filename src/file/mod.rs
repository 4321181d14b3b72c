//! Build artifacts and their processing.
//!
//! Every artifact is a [`File`]: either backed by a project source
//! ([`SourceFile`]) or produced in memory ([`GeneratedFile`]). The concrete
//! kind is fixed at construction time from the source extension and
//! drives [`process`].
//!
//! ```text
//! styles/main.styl   -> CompiledStylesheet -> styles/main.css
//! text/ch01.rxhtml   -> Template           -> text/ch01.xhtml
//! text/ch02.md       -> Markdown           -> text/ch02.xhtml
//! images/cover.png   -> Image              -> images/cover.png
//! ```

mod generated;
mod image;
mod static_file;
pub(crate) mod stylesheet;
mod xhtml;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::book::{Book, FileRequest, Group, Target};
use crate::collab::{Collaborators, HookContext, HookPoint, run_hooks};
use crate::config::CompilerConfig;
use crate::database::FileDatabase;
use crate::error::{Result, XmlProblem};
use crate::resolver::FileResolver;
use crate::util::{extension, with_extension, write_if_changed};

pub use stylesheet::{UrlReference, scan_urls};

/// Index of a file inside its [`FileResolver`].
pub type FileId = usize;

/// Package membership, ordered so that a higher type implies every lower one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathType {
    /// Built but not part of the package.
    #[default]
    None,
    /// Stored in the archive outside the content folder.
    Package,
    /// Declared in the OPF manifest.
    Manifest,
    /// Part of the reading order.
    Spine,
}

/// How a source file is turned into its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Copied byte for byte (fonts, scripts, unknown assets).
    Static,
    Image,
    /// Plain CSS.
    Stylesheet,
    /// Stylesheet language compiled to CSS (`.styl`).
    CompiledStylesheet,
    /// Ready-made XHTML, post-processed only.
    Xhtml,
    /// Template rendered to XHTML (`.rxhtml`, `.bade`).
    Template,
    Markdown,
}

impl SourceFormat {
    pub fn for_path(path: &str) -> Self {
        match extension(path).as_deref() {
            Some("styl") => SourceFormat::CompiledStylesheet,
            Some("css") => SourceFormat::Stylesheet,
            Some("xhtml" | "html" | "htm") => SourceFormat::Xhtml,
            Some("rxhtml" | "bade") => SourceFormat::Template,
            Some("md") => SourceFormat::Markdown,
            Some("jpg" | "jpeg" | "png" | "gif" | "webp") => SourceFormat::Image,
            _ => SourceFormat::Static,
        }
    }

    pub fn is_xhtml(self) -> bool {
        matches!(self, SourceFormat::Xhtml | SourceFormat::Template | SourceFormat::Markdown)
    }

    pub fn is_stylesheet(self) -> bool {
        matches!(self, SourceFormat::Stylesheet | SourceFormat::CompiledStylesheet)
    }
}

/// Destination path of a source path: `.styl` becomes `.css`; `.bade`,
/// `.rxhtml` and `.md` become `.xhtml`; everything else is unchanged.
pub fn destination_path_for(source_path: &str) -> String {
    match extension(source_path).as_deref() {
        Some("styl") => with_extension(source_path, "css"),
        Some("bade" | "rxhtml" | "md") => with_extension(source_path, "xhtml"),
        _ => source_path.to_string(),
    }
}

/// Source extensions that can produce a file with this destination extension.
pub(crate) fn source_extensions_for(destination_path: &str) -> &'static [&'static str] {
    match extension(destination_path).as_deref() {
        Some("css") => &["styl"],
        Some("xhtml") => &["rxhtml", "bade", "md"],
        _ => &[],
    }
}

/// Package documents produced in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generator {
    MimeType,
    ContainerXml,
    IbooksDisplayOptions,
    Opf,
    Nav,
    Ncx,
}

impl Generator {
    /// Path relative to the package root (package files) or the content
    /// folder (manifest files).
    pub fn destination_path(self) -> &'static str {
        match self {
            Generator::MimeType => "mimetype",
            Generator::ContainerXml => "META-INF/container.xml",
            Generator::IbooksDisplayOptions => "META-INF/com.apple.ibooks.display-options.xml",
            Generator::Opf => "content.opf",
            Generator::Nav => "nav.xhtml",
            Generator::Ncx => "nav.ncx",
        }
    }

    pub fn path_type(self) -> PathType {
        match self {
            Generator::Nav | Generator::Ncx => PathType::Manifest,
            _ => PathType::Package,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Project-relative path.
    pub source_path: String,
    pub abs_source_path: PathBuf,
    /// Every request that resolved to this file.
    pub requests: Vec<FileRequest>,
    pub format: SourceFormat,
}

#[derive(Debug, Clone)]
pub struct GeneratedFile {
    pub generator: Generator,
    /// Last generated content.
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FileKind {
    Source(SourceFile),
    Generated(GeneratedFile),
}

/// Where a file is in its build lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileState {
    #[default]
    Resolved,
    /// Up to date; not processed in this build.
    Skipped,
    Processed,
}

/// One build artifact.
#[derive(Debug, Clone)]
pub struct File {
    /// Path relative to the content folder (manifest files) or the package
    /// root (package files).
    pub destination_path: String,
    pub group: Option<Group>,
    /// Manifest properties (`nav`, `scripted`, `cover-image`, ...).
    pub properties: BTreeSet<String>,
    /// Path relative to the package root. Set on registration.
    pub pkg_destination_path: String,
    /// Absolute destination path. Set on registration.
    pub final_destination_path: PathBuf,
    pub path_type: PathType,
    pub title: Option<String>,
    pub linear: bool,
    /// Sentinel-prefixed ids this document declares (without the sentinel).
    pub global_ids: Vec<String>,
    /// Sentinel-prefixed ids this document links to (without the sentinel).
    pub global_links: Vec<String>,
    /// Serialized output held back until global ids are linked.
    pub pending_content: Option<String>,
    pub state: FileState,
    pub kind: FileKind,
}

impl File {
    /// A file backed by the project source at `source_path`.
    pub fn from_source(source_path: &str, abs_source_path: PathBuf) -> Self {
        let format = SourceFormat::for_path(source_path);
        let group = extension(source_path).and_then(|ext| Group::from_extension(&ext));
        Self::new(
            destination_path_for(source_path),
            group,
            FileKind::Source(SourceFile {
                source_path: source_path.to_string(),
                abs_source_path,
                requests: Vec::new(),
                format,
            }),
        )
    }

    pub fn generated(generator: Generator) -> Self {
        let group = matches!(generator, Generator::Nav).then_some(Group::Text);
        let mut file = Self::new(
            generator.destination_path().to_string(),
            group,
            FileKind::Generated(GeneratedFile {
                generator,
                content: None,
            }),
        );
        if generator == Generator::Nav {
            file.properties.insert("nav".to_string());
        }
        file
    }

    fn new(destination_path: String, group: Option<Group>, kind: FileKind) -> Self {
        Self {
            destination_path,
            group,
            properties: BTreeSet::new(),
            pkg_destination_path: String::new(),
            final_destination_path: PathBuf::new(),
            path_type: PathType::None,
            title: None,
            linear: true,
            global_ids: Vec::new(),
            global_links: Vec::new(),
            pending_content: None,
            state: FileState::Resolved,
            kind,
        }
    }

    pub fn source(&self) -> Option<&SourceFile> {
        match &self.kind {
            FileKind::Source(source) => Some(source),
            FileKind::Generated(_) => None,
        }
    }

    pub fn source_path(&self) -> Option<&str> {
        self.source().map(|s| s.source_path.as_str())
    }

    pub fn generator(&self) -> Option<Generator> {
        match &self.kind {
            FileKind::Generated(generated) => Some(generated.generator),
            FileKind::Source(_) => None,
        }
    }

    pub fn is_xhtml(&self) -> bool {
        extension(&self.destination_path).as_deref() == Some("xhtml")
            && self.generator().is_none()
    }

    pub fn has_global_markers(&self) -> bool {
        !self.global_ids.is_empty() || !self.global_links.is_empty()
    }
}

/// Everything a file needs while it is processed.
pub struct ProcessContext<'a> {
    pub book: &'a Book,
    pub target: &'a Target,
    pub config: &'a CompilerConfig,
    pub collaborators: &'a Collaborators,
    pub resolver: &'a mut FileResolver,
    pub problems: &'a mut Vec<XmlProblem>,
    /// Source-level database, consulted for the precompile cache.
    pub source_db: &'a FileDatabase,
    /// Directory holding precompiled templates.
    pub template_cache: &'a Path,
    /// Project-relative path of the specification file.
    pub spec_path: &'a str,
}

impl ProcessContext<'_> {
    pub(crate) fn hook_context(&self, point: HookPoint) -> HookContext<'_> {
        HookContext {
            point,
            book: self.book,
            target: self.target,
            release: self.config.release,
        }
    }

    pub(crate) fn run_hooks(&self, point: HookPoint, path: &str, content: String) -> Result<String> {
        run_hooks(&self.collaborators.hooks, path, content, &self.hook_context(point))
    }
}

/// Outcome of processing one file.
#[derive(Debug, Clone, Default)]
pub struct Processed {
    /// Whether the destination was (re)written.
    pub wrote: bool,
    /// Project-relative paths the output depends on.
    pub dependencies: Vec<String>,
}

/// Process file `id`: produce its destination content and write it.
pub fn process(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let file = ctx.resolver.file(id);
    let processed = match (file.generator(), file.source().map(|s| s.format)) {
        (Some(generator), _) => generated::process(id, generator, ctx)?,
        (None, Some(SourceFormat::Static)) | (None, None) => static_file::process(id, ctx)?,
        (None, Some(SourceFormat::Image)) => image::process(id, ctx)?,
        (None, Some(SourceFormat::Stylesheet | SourceFormat::CompiledStylesheet)) => stylesheet::process(id, ctx)?,
        (None, Some(SourceFormat::Xhtml | SourceFormat::Template | SourceFormat::Markdown)) => {
            xhtml::process(id, ctx)?
        }
    };
    ctx.resolver.file_mut(id).state = FileState::Processed;
    Ok(processed)
}

/// Re-derive what a skipped file contributes to the package (discovered
/// resources, manifest properties) from its existing destination.
pub fn restore(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<()> {
    let format = match ctx.resolver.file(id).source() {
        Some(source) => source.format,
        None => return Ok(()),
    };
    if format.is_xhtml() {
        xhtml::restore(id, ctx)?;
    } else if format.is_stylesheet() {
        stylesheet::restore(id, ctx)?;
    }
    ctx.resolver.file_mut(id).state = FileState::Skipped;
    Ok(())
}

/// Whether `dest` exists and is at least as new as `source`.
pub(crate) fn destination_is_newer(source: &Path, dest: &Path) -> bool {
    fn mtime(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
    match (mtime(source), mtime(dest)) {
        (Some(src), Some(dst)) => dst >= src,
        _ => false,
    }
}

/// Write through the pre-write hooks.
pub(crate) fn write_document(ctx: &ProcessContext<'_>, id: FileId, content: String) -> Result<bool> {
    let file = ctx.resolver.file(id);
    let content = ctx.run_hooks(HookPoint::PreWrite, &file.pkg_destination_path, content)?;
    Ok(write_if_changed(&file.final_destination_path, content.as_bytes())?)
}
