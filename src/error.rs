//! Error types for quire operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::book::Group;

/// A structural problem found while parsing a source document.
///
/// Problems are collected rather than raised; a release build escalates
/// them to [`Error::XmlProblems`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlProblem {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for XmlProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)
    }
}

/// Errors that can occur while compiling a book.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("file not found: `{pattern}`{}", context_suffix(.context))]
    FileNotFound {
        pattern: String,
        context: Option<String>,
    },

    #[error(
        "multiple files found for `{pattern}` ({}){}: {}",
        group_names(.groups),
        context_suffix(.context),
        .candidates.join(", ")
    )]
    MultipleFilesFound {
        pattern: String,
        groups: Vec<Group>,
        context: Option<String>,
        candidates: Vec<String>,
    },

    #[error("cannot add dependency to `{0}`: file is not tracked")]
    NotTracked(String),

    #[error("template error in {path}: {message}")]
    Template { path: String, message: String },

    #[error("stylesheet error in {path}: {message}")]
    Stylesheet { path: String, message: String },

    #[error("validation failed for {path}: {message}")]
    Validation { path: String, message: String },

    #[error("global id `{id}` is declared in both {first} and {second}")]
    DuplicateGlobalId {
        id: String,
        first: String,
        second: String,
    },

    #[error("{} XML problem(s), first: {}", .0.len(), first_problem(.0))]
    XmlProblems(Vec<XmlProblem>),

    #[error("invalid specification in {}: {message}", .path.display())]
    Specification { path: PathBuf, message: String },

    #[error("unknown target `{0}`")]
    UnknownTarget(String),

    #[error("compile cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" in `{ctx}`"),
        None => String::new(),
    }
}

fn group_names(groups: &[Group]) -> String {
    groups
        .iter()
        .map(|g| g.name())
        .collect::<Vec<_>>()
        .join("/")
}

fn first_problem(problems: &[XmlProblem]) -> String {
    problems
        .first()
        .map(|p| p.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_files_message() {
        let err = Error::MultipleFilesFound {
            pattern: "ch01".into(),
            groups: vec![Group::Text],
            context: None,
            candidates: vec!["other/ch01.md".into(), "text/ch01.xhtml".into()],
        };
        assert_eq!(
            err.to_string(),
            "multiple files found for `ch01` (text): other/ch01.md, text/ch01.xhtml"
        );
    }

    #[test]
    fn test_not_found_with_context() {
        let err = Error::FileNotFound {
            pattern: "cover".into(),
            context: Some("images".into()),
        };
        assert_eq!(err.to_string(), "file not found: `cover` in `images`");
    }
}
