//! EPUB 3 navigation document.

use super::{NavEntry, landmarks, nav_entries};
use crate::book::{Book, Target};
use crate::resolver::FileResolver;
use crate::util::escape_xml;

const IBOOKS_VOCABULARY: &str = "ibooks: http://vocabulary.itunes.apple.com/rdf/ibooks/vocabulary-extensions-1.0";

/// Generate `nav.xhtml` with the table of contents and landmarks.
pub fn generate_nav(resolver: &FileResolver, book: &Book, target: &Target) -> String {
    let entries = nav_entries(&book.toc, resolver, "");
    let landmarks = landmarks(book, target, resolver, "");

    let mut nav = String::new();
    nav.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE html>\n");
    nav.push_str("<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\"");
    if target.ibooks {
        nav.push_str(&format!(" epub:prefix=\"{IBOOKS_VOCABULARY}\""));
    }
    nav.push_str(&format!(" xml:lang=\"{}\">\n", escape_xml(&book.language)));
    nav.push_str(&format!(
        "  <head>\n    <title>{}</title>\n  </head>\n  <body>\n",
        escape_xml(&book.title)
    ));

    nav.push_str("    <nav epub:type=\"toc\" id=\"toc\">\n");
    nav.push_str(&format!("      <h1>{}</h1>\n", escape_xml(&book.title)));
    write_list(&mut nav, &entries, 3);
    nav.push_str("    </nav>\n");

    if !landmarks.is_empty() {
        nav.push_str("    <nav epub:type=\"landmarks\" id=\"landmarks\" hidden=\"hidden\">\n      <ol>\n");
        for (landmark, href) in &landmarks {
            nav.push_str(&format!(
                "        <li><a epub:type=\"{}\" href=\"{}\">{}</a></li>\n",
                landmark.epub_type(),
                escape_xml(href),
                landmark.title()
            ));
        }
        nav.push_str("      </ol>\n    </nav>\n");
    }

    nav.push_str("  </body>\n</html>\n");
    nav
}

/// Write an `<ol>` of entries. An empty list still gets an (invalid-free)
/// placeholder item, since `<ol>` may not be empty.
fn write_list(nav: &mut String, entries: &[NavEntry], indent: usize) {
    let pad = "  ".repeat(indent);
    nav.push_str(&format!("{pad}<ol>\n"));
    if entries.is_empty() {
        nav.push_str(&format!("{pad}  <li><span>-</span></li>\n"));
    }
    for entry in entries {
        nav.push_str(&format!(
            "{pad}  <li><a href=\"{}\">{}</a>",
            escape_xml(&entry.href),
            escape_xml(&entry.title)
        ));
        if entry.children.is_empty() {
            nav.push_str("</li>\n");
        } else {
            nav.push('\n');
            write_list(nav, &entry.children, indent + 2);
            nav.push_str(&format!("{pad}  </li>\n"));
        }
    }
    nav.push_str(&format!("{pad}</ol>\n"));
}
