//! A small owned document tree over `quick-xml` events.
//!
//! Text and attribute values are kept in their escaped source form so
//! entities such as `&nbsp;` survive a parse/serialize cycle untouched.
//! Parsing never fails: structural problems are collected as
//! [`XmlProblem`]s and the tree is repaired as well as possible.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};

use crate::error::XmlProblem;
use crate::util::escape_xml;

/// Elements serialized as `<x/>` when empty.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Escaped character data.
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written (`p`, `epub:switch`, `m:math`).
    pub name: String,
    /// Attributes in source order, values escaped.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(escape_xml(text)));
        self
    }

    /// Name without namespace prefix.
    pub fn local_name(&self) -> &str {
        local_name(&self.name)
    }

    pub fn is(&self, local: &str) -> bool {
        self.local_name().eq_ignore_ascii_case(local)
    }

    /// Unescaped attribute value.
    pub fn attr(&self, name: &str) -> Option<String> {
        self.raw_attr(name).map(|raw| match unescape(raw) {
            Ok(value) => value.into_owned(),
            Err(_) => raw.to_string(),
        })
    }

    pub fn raw_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute from an unescaped value.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        let escaped = escape_xml(value);
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = escaped,
            None => self.attrs.push((name.to_string(), escaped)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn find_child(&self, local: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.is(local))
    }

    pub fn find_child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.child_elements_mut().find(|e| e.is(local))
    }

    /// Pre-order visit of this element and every descendant element.
    pub fn walk(&self, f: &mut impl FnMut(&Element)) {
        f(self);
        for child in self.child_elements() {
            child.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        f(self);
        for child in self.child_elements_mut() {
            child.walk_mut(f);
        }
    }

    /// Whether any descendant-or-self element satisfies `pred`.
    pub fn any(&self, pred: &impl Fn(&Element) -> bool) -> bool {
        pred(self) || self.child_elements().any(|c| c.any(pred))
    }
}

pub fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// A parsed document: optional doctype plus top-level nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub doctype: Option<String>,
    pub nodes: Vec<Node>,
}

impl Document {
    /// The first top-level element.
    pub fn root(&self) -> Option<&Element> {
        self.nodes.iter().find_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn root_mut(&mut self) -> Option<&mut Element> {
        self.nodes.iter_mut().find_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn walk(&self, f: &mut impl FnMut(&Element)) {
        for node in &self.nodes {
            if let Node::Element(e) = node {
                e.walk(f);
            }
        }
    }

    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        for node in &mut self.nodes {
            if let Node::Element(e) = node {
                e.walk_mut(f);
            }
        }
    }

    pub fn any(&self, pred: &impl Fn(&Element) -> bool) -> bool {
        self.nodes.iter().any(|n| matches!(n, Node::Element(e) if e.any(pred)))
    }
}

/// Parse `source`, recording problems against `file`.
///
/// A stray `&` or `<` that stops the reader is escaped and parsing starts
/// over, so the rest of the document survives. Any other fatal reader error
/// keeps the unparsed remainder as text.
pub fn parse(source: &str, file: &str, problems: &mut Vec<XmlProblem>) -> Document {
    let mut text = Cow::Borrowed(source);
    // (offset in the repaired text, bytes inserted there)
    let mut repairs: Vec<(usize, usize)> = Vec::new();
    let mut found: Vec<(usize, String)> = Vec::new();

    let doc = loop {
        let mut attempt = Vec::new();
        let allow_repair = repairs.len() < MAX_REPAIRS;
        match parse_events(&text, allow_repair, &mut attempt) {
            Ok(doc) => {
                found.extend(attempt.into_iter().map(|(pos, msg)| (original_offset(pos, &repairs), msg)));
                break doc;
            }
            Err(Repair { at, message }) => {
                found.push((original_offset(at, &repairs), message));
                let replacement = if text.as_bytes()[at] == b'&' { "&amp;" } else { "&lt;" };
                let mut owned = text.into_owned();
                owned.replace_range(at..at + 1, replacement);
                repairs.push((at, replacement.len() - 1));
                text = Cow::Owned(owned);
            }
        }
    };

    found.sort_by_key(|(pos, _)| *pos);
    for (pos, message) in found {
        let (line, column) = line_column(source, pos);
        problems.push(XmlProblem {
            file: file.to_string(),
            line,
            column,
            message,
        });
    }
    doc
}

const MAX_REPAIRS: usize = 1000;

/// A reader error caused by the markup character at `at`.
struct Repair {
    at: usize,
    message: String,
}

/// Map an offset in repaired text back to the source it came from.
fn original_offset(mut pos: usize, repairs: &[(usize, usize)]) -> usize {
    for &(at, added) in repairs.iter().rev() {
        if pos > at {
            pos = pos.saturating_sub(added).max(at);
        }
    }
    pos
}

fn parse_events(
    source: &str,
    allow_repair: bool,
    problems: &mut Vec<(usize, String)>,
) -> std::result::Result<Document, Repair> {
    let mut reader = Reader::from_str(source);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    config.trim_text(false);

    let mut doc = Document::default();
    let mut stack: Vec<Element> = Vec::new();
    let mut report = |pos: u64, message: String| problems.push((pos as usize, message));

    loop {
        let event_start = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                let error_at = (reader.error_position() as usize).clamp(event_start, source.len());
                if allow_repair && let Some(at) = repair_point(source, event_start, error_at) {
                    return Err(Repair { at, message: e.to_string() });
                }
                report(error_at as u64, e.to_string());
                push_text(&mut stack, &mut doc, &escape_xml(&source[event_start..]));
                break;
            }
        };

        match event {
            Event::Start(e) => {
                stack.push(start_element(&e, reader.buffer_position(), &mut report));
            }
            Event::Empty(e) => {
                let element = start_element(&e, reader.buffer_position(), &mut report);
                append(&mut stack, &mut doc, Node::Element(element));
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match stack.iter().rposition(|el| el.name == name) {
                    Some(idx) => {
                        while stack.len() > idx + 1
                            && let Some(unclosed) = stack.pop()
                        {
                            report(
                                reader.buffer_position(),
                                format!("element <{}> closed by </{}>", unclosed.name, name),
                            );
                            append(&mut stack, &mut doc, Node::Element(unclosed));
                        }
                        if let Some(element) = stack.pop() {
                            append(&mut stack, &mut doc, Node::Element(element));
                        }
                    }
                    None => report(reader.buffer_position(), format!("unexpected closing tag </{name}>")),
                }
            }
            Event::Text(e) => {
                push_text(&mut stack, &mut doc, &String::from_utf8_lossy(e.as_ref()));
            }
            Event::GeneralRef(e) => {
                push_text(&mut stack, &mut doc, &format!("&{};", String::from_utf8_lossy(e.as_ref())));
            }
            Event::CData(e) => {
                append(&mut stack, &mut doc, Node::CData(String::from_utf8_lossy(&e).into_owned()));
            }
            Event::Comment(e) => {
                append(&mut stack, &mut doc, Node::Comment(String::from_utf8_lossy(&e).into_owned()));
            }
            Event::PI(e) => {
                append(
                    &mut stack,
                    &mut doc,
                    Node::ProcessingInstruction(String::from_utf8_lossy(&e).into_owned()),
                );
            }
            Event::DocType(e) => {
                doc.doctype = Some(String::from_utf8_lossy(&e).trim().to_string());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        report(source.len() as u64, format!("unclosed element <{}>", open.name));
    }
    while let Some(element) = stack.pop() {
        append(&mut stack, &mut doc, Node::Element(element));
    }

    Ok(doc)
}

/// The `&` or `<` responsible for an error reported at `error_at` while
/// reading the event that starts at `event_start`.
fn repair_point(source: &str, event_start: usize, error_at: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if matches!(bytes.get(error_at), Some(b'&' | b'<')) {
        return Some(error_at);
    }
    bytes
        .get(event_start..error_at)?
        .iter()
        .position(|&b| b == b'&' || b == b'<')
        .map(|i| event_start + i)
}

fn start_element(e: &BytesStart<'_>, pos: u64, report: &mut impl FnMut(u64, String)) -> Element {
    let mut element = Element::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes().with_checks(false) {
        match attr {
            Ok(attr) => {
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = String::from_utf8_lossy(&attr.value).into_owned();
                if element.raw_attr(&key).is_none() {
                    element.attrs.push((key, value));
                }
            }
            Err(err) => report(pos, format!("malformed attribute on <{}>: {err}", element.name)),
        }
    }
    element
}

fn append(stack: &mut [Element], doc: &mut Document, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => doc.nodes.push(node),
    }
}

fn push_text(stack: &mut [Element], doc: &mut Document, text: &str) {
    let children = match stack.last_mut() {
        Some(parent) => &mut parent.children,
        // Whitespace between top-level nodes is insignificant.
        None if text.trim().is_empty() => return,
        None => &mut doc.nodes,
    };
    match children.last_mut() {
        Some(Node::Text(existing)) => existing.push_str(text),
        _ => children.push(Node::Text(text.to_string())),
    }
}

/// 1-based line and column for a byte offset.
pub fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = before.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    let column = String::from_utf8_lossy(&before[line_start..]).chars().count() + 1;
    (line, column)
}

/// Serialize with an XML declaration and the document's doctype.
pub fn serialize(doc: &Document) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    if let Some(doctype) = &doc.doctype {
        out.push_str("<!DOCTYPE ");
        out.push_str(doctype);
        out.push_str(">\n");
    }
    for node in &doc.nodes {
        write_node(&mut out, node);
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Element(e) => write_element(out, e),
        Node::Text(text) => out.push_str(text),
        Node::CData(text) => {
            out.push_str("<![CDATA[");
            out.push_str(text);
            out.push_str("]]>");
        }
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        Node::ProcessingInstruction(text) => {
            out.push_str("<?");
            out.push_str(text);
            out.push_str("?>");
        }
    }
}

fn write_element(out: &mut String, e: &Element) {
    out.push('<');
    out.push_str(&e.name);
    for (key, value) in &e.attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&value.replace('"', "&quot;"));
        out.push('"');
    }
    if e.children.is_empty() && VOID_ELEMENTS.contains(&e.local_name().to_ascii_lowercase().as_str()) {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &e.children {
        write_node(out, child);
    }
    out.push_str("</");
    out.push_str(&e.name);
    out.push('>');
}
