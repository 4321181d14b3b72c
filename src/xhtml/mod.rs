//! XHTML post-processing.
//!
//! Every rendered document goes through [`process_document`]:
//!
//! 1. structural repair (`html`/`head`/`title`/`body`, namespaces, doctype)
//! 2. `<a>`/`<area>` links resolved against the destination tree
//! 3. `<img>`/`<script>`/stylesheet `<link>` resources resolved and
//!    registered as manifest members
//! 4. target default stylesheets, scripts and viewport injected
//! 5. manifest properties derived (`scripted`, `remote-resources`,
//!    `mathml`, `svg`)
//! 6. serialization and post-serialize hooks
//! 7. global markers (`id="$x"`, `href="$x"`) collected for
//!    [`global_ids`] linking
//!
//! Reference failures are logged and leave the attribute as written.

pub mod dom;
pub mod global_ids;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use memchr::memmem;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use regex::Regex;
use tracing::warn;

use crate::book::{Group, Target};
use crate::collab::HookPoint;
use crate::error::{Error, Result};
use crate::file::{FileId, ProcessContext};
use crate::resolver::FileResolver;
use crate::util::{join_path, normalize_path, parent_dir, relative_path};
use dom::{Document, Element, Node};

pub const XHTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";
pub const EPUB_NAMESPACE: &str = "http://www.idpf.org/2007/ops";

/// Marks ids and hrefs whose resolution is deferred to the global pass.
pub const GLOBAL_PREFIX: char = '$';

/// Byte pattern of a global marker in serialized output.
const GLOBAL_SENTINEL: &[u8] = b"=\"$";

const XHTML11_DOCTYPE: &str =
    "html PUBLIC \"-//W3C//DTD XHTML 1.1//EN\" \"http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd\"";

static SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").expect("scheme pattern is valid"));

static REMOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://").expect("remote pattern is valid"));

/// Characters that make a reference an invalid URI.
const INVALID_URI: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Characters escaped when a package path is written back as a reference.
const PATH_SEGMENT: &AsciiSet = &INVALID_URI.add(b'%').add(b'#').add(b'?');

/// Whether serialized output still carries global markers.
pub fn contains_global_marker(bytes: &[u8]) -> bool {
    memmem::find(bytes, GLOBAL_SENTINEL).is_some()
}

/// A classified `href`/`src` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Empty,
    /// Has a scheme (`http:`, `mailto:`); never touched.
    External,
    /// Only a fragment (`#note-1`).
    Fragment,
    /// Deferred to the global pass.
    Global(String),
    /// A package-local path, percent-decoded, with its `?query#fragment`.
    Local { path: String, suffix: String },
    /// Not a valid URI, even after percent-encoding.
    Invalid,
}

impl Reference {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Reference::Empty;
        }
        if let Some(id) = raw.strip_prefix(GLOBAL_PREFIX) {
            return Reference::Global(id.to_string());
        }

        let encoded;
        let raw = if is_valid_uri(raw) {
            raw
        } else {
            encoded = utf8_percent_encode(raw, INVALID_URI).to_string();
            if !is_valid_uri(&encoded) {
                return Reference::Invalid;
            }
            encoded.as_str()
        };

        if SCHEME.is_match(raw) {
            return Reference::External;
        }
        let split = raw.find(['?', '#']).unwrap_or(raw.len());
        let (path, suffix) = raw.split_at(split);
        if path.is_empty() {
            return if suffix.is_empty() { Reference::Empty } else { Reference::Fragment };
        }
        Reference::Local {
            path: percent_decode_str(path).decode_utf8_lossy().into_owned(),
            suffix: suffix.to_string(),
        }
    }
}

fn is_valid_uri(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().all(|(i, &b)| match b {
        b'%' => bytes.len() > i + 2 && bytes[i + 1].is_ascii_hexdigit() && bytes[i + 2].is_ascii_hexdigit(),
        b if b.is_ascii_alphanumeric() => true,
        b'-' | b'.' | b'_' | b'~' | b':' | b'/' | b'?' | b'#' | b'[' | b']' | b'@' | b'!' | b'$' | b'&' | b'\''
        | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' => true,
        _ => false,
    })
}

/// Encode a package path for use in an attribute.
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_SEGMENT).to_string()
}

/// Output of [`process_document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentOutput {
    pub content: String,
    pub properties: BTreeSet<String>,
    pub global_ids: Vec<String>,
    pub global_links: Vec<String>,
}

impl DocumentOutput {
    pub fn has_global_markers(&self) -> bool {
        !self.global_ids.is_empty() || !self.global_links.is_empty()
    }
}

/// Run the document pipeline for file `id` over rendered `source`.
pub fn process_document(id: FileId, source: &str, ctx: &mut ProcessContext<'_>) -> Result<DocumentOutput> {
    let file = ctx.resolver.file(id);
    let destination = file.destination_path.clone();
    let pkg_path = file.pkg_destination_path.clone();
    let source_path = file.source_path().unwrap_or(pkg_path.as_str()).to_string();
    let title = file.title.clone().unwrap_or_else(|| ctx.book.title.clone());

    let mut doc = dom::parse(source, &source_path, ctx.problems);
    repair_structure(&mut doc, ctx.target, &title);
    resolve_links(&mut doc, ctx.resolver, &destination, &pkg_path);
    resolve_resources(&mut doc, ctx.resolver, &destination, parent_dir(&source_path), &pkg_path);
    inject_defaults(&mut doc, ctx.resolver, ctx.target, &destination, &pkg_path);
    let properties = derived_properties(&doc);

    let content = ctx.run_hooks(HookPoint::PostSerialize, &pkg_path, dom::serialize(&doc))?;

    let (global_ids, global_links) = if contains_global_marker(content.as_bytes()) {
        let mut problems = Vec::new();
        collect_global_markers(&dom::parse(&content, &source_path, &mut problems))
    } else {
        (Vec::new(), Vec::new())
    };

    Ok(DocumentOutput {
        content,
        properties,
        global_ids,
        global_links,
    })
}

/// Give the document a complete `html`/`head`/`title`/`body` skeleton with
/// the namespaces and doctype of the target's EPUB version.
pub fn repair_structure(doc: &mut Document, target: &Target, title: &str) {
    let root_is = |doc: &Document, name: &str| doc.root().is_some_and(|r| r.is(name));

    if !root_is(doc, "html") {
        let body = if root_is(doc, "body") {
            take_root(doc)
        } else {
            let mut body = Element::new("body");
            body.children = std::mem::take(&mut doc.nodes)
                .into_iter()
                .filter(|n| !matches!(n, Node::Text(t) if t.trim().is_empty()))
                .collect();
            body
        };
        let mut html = Element::new("html");
        html.children.push(Node::Element(body));
        insert_root(doc, html);
    }

    doc.doctype = Some(if target.is_epub3() { "html".to_string() } else { XHTML11_DOCTYPE.to_string() });

    let Some(html) = doc.root_mut() else {
        return;
    };
    if html.raw_attr("xmlns").is_none() {
        html.attrs.insert(0, ("xmlns".to_string(), XHTML_NAMESPACE.to_string()));
    }
    if target.is_epub3() && html.raw_attr("xmlns:epub").is_none() {
        html.set_attr("xmlns:epub", EPUB_NAMESPACE);
    }

    if html.find_child("body").is_none() {
        let (head, rest): (Vec<Node>, Vec<Node>) = std::mem::take(&mut html.children)
            .into_iter()
            .partition(|n| matches!(n, Node::Element(e) if e.is("head")));
        let mut body = Element::new("body");
        body.children = rest;
        html.children = head;
        html.children.push(Node::Element(body));
    }

    if html.find_child("head").is_none() {
        html.children.insert(0, Node::Element(Element::new("head")));
    }
    if let Some(head) = html.find_child_mut("head")
        && head.find_child("title").is_none()
    {
        head.children.insert(0, Node::Element(Element::new("title").with_text(title)));
    }
}

fn take_root(doc: &mut Document) -> Element {
    let idx = doc.nodes.iter().position(|n| matches!(n, Node::Element(_)));
    match idx.map(|i| doc.nodes.remove(i)) {
        Some(Node::Element(e)) => e,
        _ => Element::new("body"),
    }
}

fn insert_root(doc: &mut Document, root: Element) {
    let idx = doc
        .nodes
        .iter()
        .position(|n| matches!(n, Node::Element(_)))
        .unwrap_or(doc.nodes.len());
    doc.nodes.insert(idx, Node::Element(root));
}

/// Rewrite `<a href>` and `<area href>` to paths relative to the document.
fn resolve_links(doc: &mut Document, resolver: &FileResolver, destination: &str, pkg_path: &str) {
    let dir = parent_dir(destination);
    doc.walk_mut(&mut |e| {
        if !(e.is("a") || e.is("area")) {
            return;
        }
        let Some(href) = e.attr("href") else {
            return;
        };
        match Reference::parse(&href) {
            Reference::Local { path, suffix } => match resolver.find_destination(&path, &[Group::Text], dir) {
                Ok(found) => e.set_attr("href", &format!("{}{suffix}", encode_path(&relative_path(dir, &found)))),
                Err(err) => warn!(path = %pkg_path, href = %href, error = %err, "unresolved link"),
            },
            Reference::Empty => warn!(path = %pkg_path, "empty href"),
            Reference::Invalid => warn!(path = %pkg_path, href = %href, "invalid URI in href"),
            Reference::External | Reference::Fragment | Reference::Global(_) => {}
        }
    });
}

/// Attribute and group of a resource-bearing element.
fn resource_attr(e: &Element) -> Option<(&'static str, Group)> {
    if e.is("img") {
        Some(("src", Group::Image))
    } else if e.is("script") && e.raw_attr("src").is_some() {
        Some(("src", Group::Script))
    } else if e.is("link")
        && e
            .attr("rel")
            .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")))
    {
        Some(("href", Group::Style))
    } else {
        None
    }
}

/// Resolve `<img>`, `<script>` and stylesheet `<link>` references,
/// registering files found only in the source tree.
fn resolve_resources(
    doc: &mut Document,
    resolver: &mut FileResolver,
    destination: &str,
    source_dir: &str,
    pkg_path: &str,
) {
    let dir = parent_dir(destination);
    doc.walk_mut(&mut |e| {
        let Some((attr, group)) = resource_attr(e) else {
            return;
        };
        let Some(value) = e.attr(attr) else {
            return;
        };
        match Reference::parse(&value) {
            Reference::Local { path, suffix } => match resolver.resolve_resource(&path, group, dir, source_dir) {
                Ok(found) => e.set_attr(attr, &format!("{}{suffix}", encode_path(&relative_path(dir, &found)))),
                Err(err) => warn!(path = %pkg_path, reference = %value, error = %err, "unresolved resource"),
            },
            Reference::Empty => warn!(path = %pkg_path, element = %e.name, "empty {attr}"),
            Reference::Invalid => warn!(path = %pkg_path, reference = %value, "invalid URI in {attr}"),
            Reference::External | Reference::Fragment | Reference::Global(_) => {}
        }
    });
}

/// Link the target's default stylesheets and scripts and add its viewport.
fn inject_defaults(doc: &mut Document, resolver: &mut FileResolver, target: &Target, destination: &str, pkg_path: &str) {
    let dir = parent_dir(destination);
    let Some(head) = doc.root_mut().and_then(|html| html.find_child_mut("head")) else {
        return;
    };

    let mut linked = linked_resources(head, dir);
    let defaults = target
        .default_styles
        .iter()
        .map(|p| (p, Group::Style))
        .chain(target.default_scripts.iter().map(|p| (p, Group::Script)));

    for (pattern, group) in defaults {
        let found = match resolver.resolve_resource(pattern, group, "", "") {
            Ok(found) => found,
            Err(err) => {
                warn!(path = %pkg_path, pattern = %pattern, error = %err, "default resource not found");
                continue;
            }
        };
        if !linked.insert(found.clone()) {
            continue;
        }
        let href = encode_path(&relative_path(dir, &found));
        let element = match group {
            Group::Style => Element::new("link")
                .with_attr("rel", "stylesheet")
                .with_attr("type", "text/css")
                .with_attr("href", &href),
            _ => Element::new("script")
                .with_attr("type", "text/javascript")
                .with_attr("src", &href),
        };
        head.children.push(Node::Element(element));
    }

    if let Some(viewport) = &target.default_viewport
        && !head
            .child_elements()
            .any(|e| e.is("meta") && e.attr("name").as_deref() == Some("viewport"))
    {
        head.children.push(Node::Element(
            Element::new("meta")
                .with_attr("name", "viewport")
                .with_attr("content", viewport),
        ));
    }
}

/// Content-relative paths of resources the element tree already links.
fn linked_resources(root: &Element, dir: &str) -> BTreeSet<String> {
    let mut linked = BTreeSet::new();
    root.walk(&mut |e| {
        if let Some((attr, _)) = resource_attr(e)
            && let Some(value) = e.attr(attr)
            && let Reference::Local { path, .. } = Reference::parse(&value)
            && let Some(path) = normalize_path(&join_path(dir, &path))
        {
            linked.insert(path);
        }
    });
    linked
}

/// Manifest properties implied by the document content.
pub fn derived_properties(doc: &Document) -> BTreeSet<String> {
    let mut properties = BTreeSet::new();
    if doc.any(&|e| e.is("script")) {
        properties.insert("scripted".to_string());
    }
    if doc.any(&|e| e.is("math")) {
        properties.insert("mathml".to_string());
    }
    if doc.any(&|e| e.is("svg")) {
        properties.insert("svg".to_string());
    }
    if doc.any(&uses_remote_resource) {
        properties.insert("remote-resources".to_string());
    }
    properties
}

fn uses_remote_resource(e: &Element) -> bool {
    let remote = |value: Option<String>| value.is_some_and(|v| REMOTE.is_match(&v));
    if remote(e.attr("src")) {
        return true;
    }
    if e.is("link") && remote(e.attr("href")) {
        return true;
    }
    e.is("script")
        && e.children
            .iter()
            .any(|n| matches!(n, Node::Text(t) | Node::CData(t) if REMOTE.is_match(t)))
}

/// Declared global ids and referenced global ids, sentinel stripped.
pub fn collect_global_markers(doc: &Document) -> (Vec<String>, Vec<String>) {
    let mut ids = Vec::new();
    let mut links = Vec::new();
    doc.walk(&mut |e| {
        if let Some(id) = e.attr("id").and_then(|v| v.strip_prefix(GLOBAL_PREFIX).map(str::to_string)) {
            ids.push(id);
        }
        if let Some(href) = e.attr("href").and_then(|v| v.strip_prefix(GLOBAL_PREFIX).map(str::to_string)) {
            links.push(href);
        }
    });
    (ids, links)
}

/// Content-relative destinations of the resources a finished document
/// links to, plus its derived properties.
pub fn written_references(content: &str, destination: &str) -> (Vec<String>, BTreeSet<String>) {
    let mut problems = Vec::new();
    let doc = dom::parse(content, destination, &mut problems);
    let dir = parent_dir(destination);
    let mut found = Vec::new();
    doc.walk(&mut |e| {
        if let Some((attr, _)) = resource_attr(e)
            && let Some(value) = e.attr(attr)
            && let Reference::Local { path, .. } = Reference::parse(&value)
            && let Some(path) = normalize_path(&join_path(dir, &path))
        {
            found.push(path);
        }
    });
    (found, derived_properties(&doc))
}

/// Escalate collected problems in release builds.
pub fn check_problems(problems: &[crate::error::XmlProblem], release: bool) -> Result<()> {
    if release && !problems.is_empty() {
        return Err(Error::XmlProblems(problems.to_vec()));
    }
    for problem in problems {
        warn!("{problem}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EpubVersion;

    fn repaired(source: &str, target: &Target) -> String {
        let mut problems = Vec::new();
        let mut doc = dom::parse(source, "x.xhtml", &mut problems);
        repair_structure(&mut doc, target, "Title");
        dom::serialize(&doc)
    }

    #[test]
    fn test_fragment_is_wrapped() {
        let out = repaired("<p>one</p><p>two</p>", &Target::new("t"));
        assert!(out.contains("<!DOCTYPE html>"));
        assert!(out.contains(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\"><head><title>Title</title></head><body><p>one</p><p>two</p></body></html>"
        ));
    }

    #[test]
    fn test_body_root_gets_html() {
        let out = repaired("<body><p>x</p></body>", &Target::new("t"));
        assert!(out.contains("<head><title>Title</title></head><body><p>x</p></body>"));
    }

    #[test]
    fn test_epub2_doctype_without_epub_namespace() {
        let mut target = Target::new("t");
        target.epub_version = EpubVersion::Epub2;
        let out = repaired("<html><head><title>Own</title></head><body/></html>", &target);
        assert!(out.contains("XHTML 1.1"));
        assert!(!out.contains("xmlns:epub"));
        assert!(out.contains("<title>Own</title>"));
    }

    #[test]
    fn test_html_without_body() {
        let out = repaired("<html><head><title>T</title></head><p>x</p></html>", &Target::new("t"));
        assert!(out.contains("<head><title>T</title></head><body><p>x</p></body>"));
    }

    #[test]
    fn test_reference_parse() {
        assert_eq!(Reference::parse("http://example.com/a"), Reference::External);
        assert_eq!(Reference::parse("mailto:a@b.c"), Reference::External);
        assert_eq!(Reference::parse("#note"), Reference::Fragment);
        assert_eq!(Reference::parse("  "), Reference::Empty);
        assert_eq!(Reference::parse("$intro"), Reference::Global("intro".into()));
        assert_eq!(
            Reference::parse("ch02.xhtml#s1"),
            Reference::Local {
                path: "ch02.xhtml".into(),
                suffix: "#s1".into()
            }
        );
    }

    #[test]
    fn test_invalid_reference_is_percent_encoded_once() {
        assert_eq!(
            Reference::parse("my chapter#x"),
            Reference::Local {
                path: "my chapter".into(),
                suffix: "#x".into()
            }
        );
        assert_eq!(Reference::parse("100%"), Reference::Invalid);
    }

    #[test]
    fn test_derived_properties() {
        let mut problems = Vec::new();
        let doc = dom::parse(
            "<html><body><script>var x = 1;</script><math/><svg/><img src=\"https://x/y.png\"/></body></html>",
            "x",
            &mut problems,
        );
        let props = derived_properties(&doc);
        let props: Vec<&str> = props.iter().map(String::as_str).collect();
        assert_eq!(props, vec!["mathml", "remote-resources", "scripted", "svg"]);
    }

    #[test]
    fn test_external_link_is_not_remote_resource() {
        let mut problems = Vec::new();
        let doc = dom::parse("<body><a href=\"https://example.com\">x</a></body>", "x", &mut problems);
        assert!(derived_properties(&doc).is_empty());
    }

    #[test]
    fn test_global_markers() {
        let mut problems = Vec::new();
        let doc = dom::parse(
            "<body><p id=\"$a\">x</p><a href=\"$b\">y</a><a href=\"c.xhtml\">z</a></body>",
            "x",
            &mut problems,
        );
        assert_eq!(collect_global_markers(&doc), (vec!["a".to_string()], vec!["b".to_string()]));
        assert!(contains_global_marker(b"<p id=\"$a\">"));
        assert!(!contains_global_marker(b"<p>costs $5</p>"));
    }

    #[test]
    fn test_release_escalates_problems() {
        let problems = vec![crate::error::XmlProblem {
            file: "a.xhtml".into(),
            line: 1,
            column: 2,
            message: "bad".into(),
        }];
        assert!(check_problems(&problems, false).is_ok());
        assert!(matches!(check_problems(&problems, true), Err(Error::XmlProblems(p)) if p.len() == 1));
    }
}
