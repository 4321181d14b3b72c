//! Stylesheets: optional compilation, then `url(...)` resolution.
//!
//! References are found with `cssparser`'s tokenizer. The declaring
//! property decides what kind of resource a URL points at: `src` inside
//! `@font-face` is a font, `background`, `list-style`, `content` and
//! friends are images, and `@import` pulls in another stylesheet.

use std::fs;

use cssparser::{ParseError, Parser, ParserInput, Token};
use tracing::warn;

use super::{FileId, ProcessContext, Processed, SourceFormat};
use crate::book::Group;
use crate::error::{Error, Result};
use crate::util::{parent_dir, read_text, relative_path, write_if_changed};

/// One `url(...)` or `@import "..."` reference in a stylesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlReference {
    /// Byte span of the text to replace on rewrite.
    pub start: usize,
    pub end: usize,
    pub url: String,
    pub group: Group,
    /// Whether the span is a whole unquoted `url(...)` token.
    pub unquoted: bool,
}

/// Find every resource reference in `css`.
pub fn scan_urls(css: &str) -> Vec<UrlReference> {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut refs = Vec::new();
    scan_block(&mut parser, &mut refs, &Context::default());
    refs
}

#[derive(Debug, Clone, Default)]
struct Context {
    font_face: bool,
    property: Option<String>,
    import: bool,
}

fn scan_block<'i>(parser: &mut Parser<'i, '_>, refs: &mut Vec<UrlReference>, outer: &Context) {
    let mut ctx = outer.clone();
    let mut pending_ident: Option<String> = None;
    let mut at_rule: Option<String> = None;

    loop {
        let start = parser.position().byte_index();
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };

        match token {
            Token::WhiteSpace(_) | Token::Comment(_) => {}
            Token::Ident(name) => pending_ident = Some(name.to_ascii_lowercase()),
            Token::Colon => {
                if let Some(name) = pending_ident.take() {
                    ctx.property = Some(name);
                }
            }
            Token::Semicolon => {
                ctx.property = outer.property.clone();
                ctx.import = false;
                at_rule = None;
                pending_ident = None;
            }
            Token::AtKeyword(name) => {
                let name = name.to_ascii_lowercase();
                ctx.import = name == "import";
                at_rule = Some(name);
                pending_ident = None;
            }
            Token::UnquotedUrl(url) => {
                let end = parser.position().byte_index();
                push_reference(refs, &ctx, start, end, &url, true);
            }
            Token::QuotedString(url) if ctx.import => {
                let end = parser.position().byte_index();
                push_reference(refs, &ctx, start, end, &url, false);
            }
            Token::Function(name) if name.eq_ignore_ascii_case("url") => {
                let inner = ctx.clone();
                let _ = parser.parse_nested_block(|p| {
                    p.skip_whitespace();
                    let start = p.position().byte_index();
                    if let Token::QuotedString(url) = p.next()?.clone() {
                        let end = p.position().byte_index();
                        push_reference(refs, &inner, start, end, &url, false);
                    }
                    Ok::<(), ParseError<'i, ()>>(())
                });
                pending_ident = None;
            }
            Token::CurlyBracketBlock => {
                let inner = Context {
                    font_face: at_rule.as_deref() == Some("font-face"),
                    property: None,
                    import: false,
                };
                let _ = parser.parse_nested_block(|p| {
                    scan_block(p, refs, &inner);
                    Ok::<(), ParseError<'i, ()>>(())
                });
                ctx = outer.clone();
                at_rule = None;
                pending_ident = None;
            }
            Token::Function(_) | Token::ParenthesisBlock | Token::SquareBracketBlock => {
                let inner = ctx.clone();
                let _ = parser.parse_nested_block(|p| {
                    scan_block(p, refs, &inner);
                    Ok::<(), ParseError<'i, ()>>(())
                });
                pending_ident = None;
            }
            _ => pending_ident = None,
        }
    }
}

fn push_reference(refs: &mut Vec<UrlReference>, ctx: &Context, start: usize, end: usize, url: &str, unquoted: bool) {
    let url = url.trim();
    if url.is_empty() || url.starts_with('#') || url.starts_with("data:") || url.contains("://") {
        return;
    }
    let group = if ctx.import {
        Some(Group::Style)
    } else {
        property_group(ctx).or_else(|| {
            crate::util::extension(url.split(['?', '#']).next().unwrap_or(url))
                .and_then(|ext| Group::from_extension(&ext))
        })
    };
    if let Some(group) = group {
        refs.push(UrlReference {
            start,
            end,
            url: url.to_string(),
            group,
            unquoted,
        });
    }
}

fn property_group(ctx: &Context) -> Option<Group> {
    let property = ctx.property.as_deref()?;
    if ctx.font_face && property == "src" {
        return Some(Group::Font);
    }
    match property {
        "background" | "background-image" | "list-style" | "list-style-image" | "border-image"
        | "border-image-source" | "content" | "cursor" | "mask" | "mask-image" | "shape-outside" => {
            Some(Group::Image)
        }
        _ => None,
    }
}

/// Replace each reference span with its new URL.
pub fn rewrite_urls(css: &str, replacements: &[(&UrlReference, String)]) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    let mut sorted: Vec<&(&UrlReference, String)> = replacements.iter().collect();
    sorted.sort_by_key(|(r, _)| r.start);
    for (reference, url) in sorted {
        if reference.start < last {
            continue;
        }
        out.push_str(&css[last..reference.start]);
        if reference.unquoted {
            out.push_str(&format!("url({})", quote_css(url)));
        } else {
            out.push_str(&quote_css(url));
        }
        last = reference.end;
    }
    out.push_str(&css[last..]);
    out
}

fn quote_css(url: &str) -> String {
    format!("\"{}\"", url.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Resolve every reference in `css` relative to stylesheet `id`,
/// registering discovered resources. Returns the rewritten text.
fn resolve_references(id: FileId, css: &str, ctx: &mut ProcessContext<'_>) -> String {
    let file = ctx.resolver.file(id);
    let destination_dir = parent_dir(&file.destination_path).to_string();
    let source_dir = file.source_path().map(parent_dir).unwrap_or_default().to_string();
    let path = file.pkg_destination_path.clone();

    let refs = scan_urls(css);
    let mut replacements = Vec::new();
    for reference in &refs {
        let pattern = reference.url.split(['?', '#']).next().unwrap_or_default();
        match ctx
            .resolver
            .resolve_resource(pattern, reference.group, &destination_dir, &source_dir)
        {
            Ok(found) => {
                let suffix = &reference.url[pattern.len()..];
                let url = format!("{}{suffix}", relative_path(&destination_dir, &found));
                if url != reference.url {
                    replacements.push((reference, url));
                }
            }
            Err(e) => warn!(path = %path, url = %reference.url, error = %e, "unresolved stylesheet reference"),
        }
    }

    if replacements.is_empty() {
        css.to_string()
    } else {
        rewrite_urls(css, &replacements)
    }
}

pub(super) fn process(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let file = ctx.resolver.file(id);
    let Some(source) = file.source() else {
        return Ok(Processed::default());
    };
    let source_path = source.source_path.clone();
    let text = read_text(&source.abs_source_path)?;

    let (css, dependencies) = if source.format == SourceFormat::CompiledStylesheet {
        let compiled = ctx
            .collaborators
            .stylesheets
            .compile(&source_path, &text)
            .map_err(|e| match e {
                Error::Stylesheet { .. } => e,
                other => Error::Stylesheet {
                    path: source_path.clone(),
                    message: other.to_string(),
                },
            })?;
        (compiled.css, compiled.dependencies)
    } else {
        (text, Vec::new())
    };

    let css = resolve_references(id, &css, ctx);
    let wrote = write_if_changed(&ctx.resolver.file(id).final_destination_path, css.as_bytes())?;
    Ok(Processed { wrote, dependencies })
}

/// Register resources referenced by an up-to-date stylesheet.
pub(super) fn restore(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<()> {
    let file = ctx.resolver.file(id);
    let path = &file.final_destination_path;
    let css = match fs::read_to_string(path) {
        Ok(css) => css,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read previous output");
            return Ok(());
        }
    };
    let destination_dir = parent_dir(&file.destination_path).to_string();
    for reference in scan_urls(&css) {
        let url = reference.url.split(['?', '#']).next().unwrap_or_default();
        let Some(target) = crate::util::normalize_path(&crate::util::join_path(&destination_dir, url)) else {
            continue;
        };
        ctx.resolver.register_destination(&target);
    }
    Ok(())
}
