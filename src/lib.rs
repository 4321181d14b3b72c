//! # quire
//!
//! An incremental EPUB compiler for declarative book projects.
//!
//! A project is a directory holding one `*.book.yml` specification and the
//! text, image, style and font sources it references. Compiling a target
//! resolves every referenced file, processes only what changed since the
//! last build, links cross-document anchors and writes an EPUB 2 or 3
//! package.
//!
//! ## Features
//!
//! - Glob-style file requests with extension groups and ambiguity detection
//! - Templates (`.rxhtml`, `.bade`), Markdown and plain XHTML sources
//! - Persistent dependency databases for incremental rebuilds
//! - Global ids: `id="$intro"` / `href="$intro"` linked across documents
//! - OPF, navigation document, NCX and `META-INF` generation
//! - Incremental archive updates
//!
//! ## Quick Start
//!
//! ```no_run
//! use quire::{CompilerConfig, Project};
//!
//! let compiler = Project::open("my-book")?
//!     .compiler()
//!     .with_config(CompilerConfig::new().with_release(true));
//! let report = compiler.compile("ibooks")?;
//! println!("{} files written to {}", report.written, report.archive.display());
//! # Ok::<(), quire::Error>(())
//! ```
//!
//! ## Collaborators
//!
//! Template rendering, stylesheet compilation, image resizing and document
//! checks are behind the traits in [`collab`]. Replace them with
//! [`Compiler::with_collaborators`]:
//!
//! ```no_run
//! use quire::collab::{Collaborators, Hook, HookContext};
//! use quire::{Project, Result};
//!
//! struct NoLorem;
//!
//! impl Hook for NoLorem {
//!     fn call(&self, path: &str, content: String, _ctx: &HookContext<'_>) -> Result<String> {
//!         if content.contains("lorem ipsum") {
//!             return Err(quire::Error::Validation {
//!                 path: path.to_string(),
//!                 message: "placeholder text".into(),
//!             });
//!         }
//!         Ok(content)
//!     }
//! }
//!
//! let compiler = Project::open(".")?
//!     .compiler()
//!     .with_collaborators(Collaborators::default().with_hook(NoLorem));
//! compiler.compile("default")?;
//! # Ok::<(), quire::Error>(())
//! ```

pub mod book;
pub mod collab;
pub mod compiler;
pub mod config;
pub mod database;
pub mod error;
pub mod file;
pub mod find;
pub mod generate;
pub mod project;
pub mod resolver;
pub(crate) mod util;
pub mod xhtml;

pub use book::{Book, Contributor, EpubVersion, FileRequest, Group, Landmark, Target, TocItem};
pub use compiler::{CancelToken, CompileReport, Compiler};
pub use config::CompilerConfig;
pub use database::{FileDatabase, FileStat, Fingerprint};
pub use error::{Error, Result, XmlProblem};
pub use file::{File, FileId, PathType};
pub use find::{FileFinder, FileTree, SourceTree, VirtualTree};
pub use project::Project;
pub use resolver::FileResolver;
pub use xhtml::global_ids::UnresolvedGlobalId;
