//! External collaborators the compiler drives but does not implement:
//! template rendering, stylesheet compilation, image resizing and
//! checker/transformer hooks.
//!
//! Each seam is a trait; [`Collaborators::default`] wires in the built-in
//! implementations.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;
use upon::Engine;

use crate::book::{Book, Target};
use crate::error::{Error, Result};

/// Variables visible to a template while it renders.
#[derive(Debug, Clone, Serialize)]
pub struct Bindings<'a> {
    pub book: &'a Book,
    pub target: &'a Target,
    pub file: FileBinding,
    pub files: Vec<FileBinding>,
    pub constants: BTreeMap<String, serde_json::Value>,
}

/// How a registered file appears to templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileBinding {
    pub source_path: Option<String>,
    pub destination_path: String,
    pub title: Option<String>,
}

/// Output of a template render.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub content: String,
    /// Project-relative paths the output depends on (partials, data files).
    pub dependencies: Vec<String>,
}

/// Turns template source into XHTML.
///
/// Rendering is split in two so the compiler can cache the precompiled
/// form on disk while the source stays unchanged.
pub trait TemplateRenderer {
    /// Convert source text into the form handed to [`TemplateRenderer::render`].
    fn precompile(&self, path: &str, source: &str) -> Result<String>;

    fn render(&self, path: &str, precompiled: &str, bindings: &Bindings<'_>) -> Result<Rendered>;
}

/// Template renderer backed by the `upon` engine (`{{ book.title }}`).
pub struct UponRenderer {
    engine: Engine<'static>,
}

impl UponRenderer {
    pub fn new() -> Self {
        Self { engine: Engine::new() }
    }
}

impl Default for UponRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for UponRenderer {
    fn precompile(&self, path: &str, source: &str) -> Result<String> {
        // Compile once to surface syntax errors before the text is cached.
        self.engine
            .compile(source.to_string())
            .map_err(|e| template_error(path, e))?;
        Ok(source.to_string())
    }

    fn render(&self, path: &str, precompiled: &str, bindings: &Bindings<'_>) -> Result<Rendered> {
        let template = self
            .engine
            .compile(precompiled.to_string())
            .map_err(|e| template_error(path, e))?;
        let content = template
            .render(&self.engine, bindings)
            .to_string()
            .map_err(|e| template_error(path, e))?;
        Ok(Rendered {
            content,
            dependencies: Vec::new(),
        })
    }
}

fn template_error(path: &str, e: upon::Error) -> Error {
    Error::Template {
        path: path.to_string(),
        message: e.to_string(),
    }
}

/// Output of a stylesheet compile.
#[derive(Debug, Clone, Default)]
pub struct CompiledStylesheet {
    pub css: String,
    pub dependencies: Vec<String>,
}

/// Compiles a stylesheet language (e.g. Stylus) to CSS.
pub trait StylesheetCompiler {
    fn compile(&self, path: &str, source: &str) -> Result<CompiledStylesheet>;
}

/// Treats stylesheet sources as plain CSS.
#[derive(Debug, Default)]
pub struct PassthroughStylesheets;

impl StylesheetCompiler for PassthroughStylesheets {
    fn compile(&self, _path: &str, source: &str) -> Result<CompiledStylesheet> {
        Ok(CompiledStylesheet {
            css: source.to_string(),
            dependencies: Vec::new(),
        })
    }
}

/// Downscales raster images.
pub trait ImageResizer {
    /// Return an encoding of `bytes` with at most `max_pixels` pixels,
    /// preserving aspect ratio.
    fn resize(&self, path: &str, bytes: &[u8], max_pixels: u64) -> Result<Vec<u8>>;
}

/// Leaves images untouched.
#[derive(Debug, Default)]
pub struct KeepImages;

impl ImageResizer for KeepImages {
    fn resize(&self, path: &str, bytes: &[u8], max_pixels: u64) -> Result<Vec<u8>> {
        warn!(path, max_pixels, "no image resizer configured, keeping oversized image");
        Ok(bytes.to_vec())
    }
}

/// Fixed points in the XHTML pipeline where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Right after template rendering, before parsing.
    PostRender,
    /// After the document is normalized and serialized.
    PostSerialize,
    /// Immediately before bytes hit the destination tree.
    PreWrite,
}

/// What a hook can see besides the document.
pub struct HookContext<'a> {
    pub point: HookPoint,
    pub book: &'a Book,
    pub target: &'a Target,
    pub release: bool,
}

/// A checker or transformer over serialized documents.
///
/// Return the (possibly modified) content, or an error to fail the build.
pub trait Hook {
    fn call(&self, path: &str, content: String, ctx: &HookContext<'_>) -> Result<String>;
}

/// Run every hook in order.
pub fn run_hooks(hooks: &[Box<dyn Hook>], path: &str, content: String, ctx: &HookContext<'_>) -> Result<String> {
    hooks
        .iter()
        .try_fold(content, |content, hook| hook.call(path, content, ctx))
}

/// The collaborator set used by one compiler.
pub struct Collaborators {
    pub templates: Box<dyn TemplateRenderer>,
    pub stylesheets: Box<dyn StylesheetCompiler>,
    pub images: Box<dyn ImageResizer>,
    pub hooks: Vec<Box<dyn Hook>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            templates: Box::new(UponRenderer::new()),
            stylesheets: Box::new(PassthroughStylesheets),
            images: Box::new(KeepImages),
            hooks: Vec::new(),
        }
    }
}

impl Collaborators {
    pub fn with_templates(mut self, templates: impl TemplateRenderer + 'static) -> Self {
        self.templates = Box::new(templates);
        self
    }

    pub fn with_stylesheets(mut self, stylesheets: impl StylesheetCompiler + 'static) -> Self {
        self.stylesheets = Box::new(stylesheets);
        self
    }

    pub fn with_images(mut self, images: impl ImageResizer + 'static) -> Self {
        self.images = Box::new(images);
        self
    }

    pub fn with_hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }
}

/// Convert a Markdown source into an XHTML body fragment.
pub fn markdown_to_xhtml(source: &str) -> String {
    use pulldown_cmark::{Options, Parser, html};

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(source, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings<'a>(book: &'a Book, target: &'a Target) -> Bindings<'a> {
        Bindings {
            book,
            target,
            file: FileBinding {
                source_path: Some("ch01.rxhtml".into()),
                destination_path: "ch01.xhtml".into(),
                title: Some("One".into()),
            },
            files: Vec::new(),
            constants: book.constants_for(target),
        }
    }

    #[test]
    fn test_upon_renders_bindings() {
        let mut book = Book::new("Short Works");
        book.constants.insert("edition".into(), serde_json::json!("first"));
        let target = Target::new("ibooks");
        let renderer = UponRenderer::new();

        let pre = renderer
            .precompile("ch01.rxhtml", "<h1>{{ book.title }}</h1><p>{{ constants.edition }} / {{ target.name }} / {{ file.title }}</p>")
            .unwrap();
        let out = renderer.render("ch01.rxhtml", &pre, &bindings(&book, &target)).unwrap();
        assert_eq!(out.content, "<h1>Short Works</h1><p>first / ibooks / One</p>");
    }

    #[test]
    fn test_template_syntax_error() {
        let renderer = UponRenderer::new();
        let err = renderer.precompile("bad.rxhtml", "{{ unclosed").unwrap_err();
        assert!(matches!(err, Error::Template { ref path, .. } if path == "bad.rxhtml"));
    }

    #[test]
    fn test_markdown() {
        let html = markdown_to_xhtml("# Title\n\nSome *text*.");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>text</em>"));
    }

    struct Upper;

    impl Hook for Upper {
        fn call(&self, _path: &str, content: String, _ctx: &HookContext<'_>) -> Result<String> {
            Ok(content.to_uppercase())
        }
    }

    struct Reject;

    impl Hook for Reject {
        fn call(&self, path: &str, _content: String, _ctx: &HookContext<'_>) -> Result<String> {
            Err(Error::Validation {
                path: path.to_string(),
                message: "rejected".into(),
            })
        }
    }

    #[test]
    fn test_hooks_chain() {
        let book = Book::new("x");
        let target = Target::new("t");
        let ctx = HookContext {
            point: HookPoint::PostSerialize,
            book: &book,
            target: &target,
            release: false,
        };
        let hooks: Vec<Box<dyn Hook>> = vec![Box::new(Upper)];
        assert_eq!(run_hooks(&hooks, "a", "abc".into(), &ctx).unwrap(), "ABC");

        let hooks: Vec<Box<dyn Hook>> = vec![Box::new(Upper), Box::new(Reject)];
        assert!(run_hooks(&hooks, "a", "abc".into(), &ctx).is_err());
    }
}
