//! Book specification data consumed by the compiler.
//!
//! These types are produced by an external, already-validated specification
//! parser. The compiler only reads them; the YAML form is what
//! [`Project::open`](crate::Project::open) deserializes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of content a [`FileRequest`] (or a reference inside a document) is
/// looking for. Each group carries an extension allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Text,
    Image,
    Font,
    Style,
    Script,
}

impl Group {
    pub const ALL: [Group; 5] = [Group::Text, Group::Image, Group::Font, Group::Style, Group::Script];

    pub fn name(self) -> &'static str {
        match self {
            Group::Text => "text",
            Group::Image => "image",
            Group::Font => "font",
            Group::Style => "style",
            Group::Script => "script",
        }
    }

    /// Source extensions accepted for this group (lowercase, without dot).
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Group::Text => &["xhtml", "html", "htm", "bade", "rxhtml", "md"],
            Group::Image => &["jpg", "jpeg", "png", "gif", "svg", "webp"],
            Group::Font => &["ttf", "otf", "woff", "woff2"],
            Group::Style => &["css", "styl"],
            Group::Script => &["js"],
        }
    }

    /// Group implied by a file extension, if any.
    pub fn from_extension(ext: &str) -> Option<Group> {
        let ext = ext.to_ascii_lowercase();
        Group::ALL
            .into_iter()
            .find(|g| g.extensions().contains(&ext.as_str()))
    }

    /// Whether `path` has an extension allowed by any of `groups`.
    /// An empty group list accepts everything.
    pub fn accepts(groups: &[Group], path: &str) -> bool {
        if groups.is_empty() {
            return true;
        }
        match extension_of(path) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                groups.iter().any(|g| g.extensions().contains(&ext.as_str()))
            }
            None => false,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(&name[dot + 1..])
}

fn default_true() -> bool {
    true
}

/// A logical request for one or more source files.
///
/// Requests compare by value: two requests with the same pattern, group,
/// cardinality and properties resolve to the same files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRequest {
    #[serde(rename = "source")]
    pub source_pattern: String,
    #[serde(default = "FileRequest::default_group")]
    pub group: Group,
    #[serde(default = "default_true")]
    pub only_one: bool,
    #[serde(default)]
    pub properties: BTreeSet<String>,
}

impl FileRequest {
    pub fn new(source_pattern: impl Into<String>, group: Group) -> Self {
        Self {
            source_pattern: source_pattern.into(),
            group,
            only_one: true,
            properties: BTreeSet::new(),
        }
    }

    /// Request every file matching the pattern instead of exactly one.
    pub fn all(mut self) -> Self {
        self.only_one = false;
        self
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.properties.insert(property.into());
        self
    }

    fn default_group() -> Group {
        Group::Text
    }
}

/// A person credited on the book, with a MARC relator role (`aut`, `edt`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub file_as: Option<String>,
}

impl Contributor {
    pub fn author(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Some("aut".into()),
            file_as: None,
        }
    }
}

/// Semantic landmark tags a TOC item may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    Cover,
    TitlePage,
    Toc,
    StartPage,
    Copyright,
    Acknowledgements,
    Dedication,
    Index,
    Glossary,
    Bibliography,
    /// Apple Books specific start-of-reading marker.
    IbooksStartPage,
}

impl Landmark {
    /// EPUB3 `epub:type` value.
    pub fn epub_type(self) -> &'static str {
        match self {
            Landmark::Cover => "cover",
            Landmark::TitlePage => "titlepage",
            Landmark::Toc => "toc",
            Landmark::StartPage => "bodymatter",
            Landmark::Copyright => "copyright-page",
            Landmark::Acknowledgements => "acknowledgments",
            Landmark::Dedication => "dedication",
            Landmark::Index => "index",
            Landmark::Glossary => "glossary",
            Landmark::Bibliography => "bibliography",
            Landmark::IbooksStartPage => "ibooks:reader-start-page",
        }
    }

    /// EPUB2 `<guide>` reference type.
    pub fn guide_type(self) -> &'static str {
        match self {
            Landmark::Cover => "cover",
            Landmark::TitlePage => "title-page",
            Landmark::Toc => "toc",
            Landmark::StartPage | Landmark::IbooksStartPage => "text",
            Landmark::Copyright => "copyright-page",
            Landmark::Acknowledgements => "acknowledgements",
            Landmark::Dedication => "dedication",
            Landmark::Index => "index",
            Landmark::Glossary => "glossary",
            Landmark::Bibliography => "bibliography",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Landmark::Cover => "Cover",
            Landmark::TitlePage => "Title Page",
            Landmark::Toc => "Table of Contents",
            Landmark::StartPage | Landmark::IbooksStartPage => "Start of Content",
            Landmark::Copyright => "Copyright",
            Landmark::Acknowledgements => "Acknowledgements",
            Landmark::Dedication => "Dedication",
            Landmark::Index => "Index",
            Landmark::Glossary => "Glossary",
            Landmark::Bibliography => "Bibliography",
        }
    }

    pub fn is_ibooks_only(self) -> bool {
        matches!(self, Landmark::IbooksStartPage)
    }
}

/// A table of contents node.
///
/// Items without a title are part of the reading order but are not listed
/// in the navigation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocItem {
    #[serde(default)]
    pub file: Option<FileRequest>,
    #[serde(default)]
    pub fragment: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
    #[serde(default = "default_true")]
    pub linear: bool,
    #[serde(default)]
    pub children: Vec<TocItem>,
}

impl TocItem {
    pub fn new(title: impl Into<String>, file: FileRequest) -> Self {
        Self {
            file: Some(file),
            fragment: None,
            title: Some(title.into()),
            landmarks: Vec::new(),
            linear: true,
            children: Vec::new(),
        }
    }

    pub fn with_landmark(mut self, landmark: Landmark) -> Self {
        self.landmarks.push(landmark);
        self
    }

    pub fn with_child(mut self, child: TocItem) -> Self {
        self.children.push(child);
        self
    }

    pub fn non_linear(mut self) -> Self {
        self.linear = false;
        self
    }

    /// Depth-first, pre-order traversal including `self`.
    pub fn walk<'a>(&'a self, out: &mut Vec<&'a TocItem>) {
        out.push(self);
        for child in &self.children {
            child.walk(out);
        }
    }
}

/// EPUB major version produced for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EpubVersion {
    Epub2,
    #[default]
    Epub3,
}

impl TryFrom<u8> for EpubVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(EpubVersion::Epub2),
            3 => Ok(EpubVersion::Epub3),
            other => Err(format!("unsupported EPUB version {other}")),
        }
    }
}

impl From<EpubVersion> for u8 {
    fn from(value: EpubVersion) -> Self {
        match value {
            EpubVersion::Epub2 => 2,
            EpubVersion::Epub3 => 3,
        }
    }
}

/// A build target: one EPUB flavour of the book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub epub_version: EpubVersion,
    #[serde(default)]
    pub ibooks: bool,
    #[serde(default)]
    pub custom_fonts: bool,
    #[serde(default)]
    pub fixed_layout: bool,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub cover_image: Option<FileRequest>,
    /// Stylesheet patterns linked into every document.
    #[serde(default)]
    pub default_styles: Vec<String>,
    /// Script patterns linked into every document.
    #[serde(default)]
    pub default_scripts: Vec<String>,
    #[serde(default)]
    pub default_viewport: Option<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, serde_json::Value>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_epub3(&self) -> bool {
        self.epub_version == EpubVersion::Epub3
    }
}

/// The whole book specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub authors: Vec<Contributor>,
    #[serde(default)]
    pub contributors: Vec<Contributor>,
    #[serde(default = "Book::default_language")]
    pub language: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub cover_image: Option<FileRequest>,
    #[serde(default)]
    pub toc: Vec<TocItem>,
    /// Extra manifest members not reachable from the TOC (fonts, media).
    #[serde(default)]
    pub other_files: Vec<FileRequest>,
    #[serde(default)]
    pub constants: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Book {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            language: Self::default_language(),
            ..Default::default()
        }
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Every TOC item in reading order.
    pub fn toc_items(&self) -> Vec<&TocItem> {
        let mut out = Vec::new();
        for item in &self.toc {
            item.walk(&mut out);
        }
        out
    }

    /// Constants visible to templates: book constants overlaid by the target's.
    pub fn constants_for(&self, target: &Target) -> BTreeMap<String, serde_json::Value> {
        let mut constants = self.constants.clone();
        constants.extend(target.constants.clone());
        constants
    }

    /// Filename-safe form of the title.
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.title.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('-') && !slug.is_empty() {
                slug.push('-');
            }
        }
        let slug = slug.trim_end_matches('-').to_string();
        if slug.is_empty() { "book".to_string() } else { slug }
    }

    fn default_language() -> String {
        "en".to_string()
    }
}
