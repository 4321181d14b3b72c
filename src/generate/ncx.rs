//! EPUB 2 NCX table of contents.

use super::{NavEntry, book_identifier, depth, nav_entries};
use crate::book::{Book, Target};
use crate::resolver::FileResolver;
use crate::util::escape_xml;

/// Generate `nav.ncx` from the book's table of contents.
pub fn generate_ncx(resolver: &FileResolver, book: &Book, target: &Target) -> String {
    let entries = nav_entries(&book.toc, resolver, "");
    let mut ncx = String::new();

    ncx.push_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE ncx PUBLIC "-//NISO//DTD ncx 2005-1//EN" "http://www.daisy.org/z3986/2005/ncx-2005-1.dtd">
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
"#,
    );
    ncx.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{}\"/>\n",
        escape_xml(&book_identifier(book, target))
    ));
    ncx.push_str(&format!("    <meta name=\"dtb:depth\" content=\"{}\"/>\n", depth(&entries).max(1)));
    ncx.push_str(
        r#"    <meta name="dtb:totalPageCount" content="0"/>
    <meta name="dtb:maxPageNumber" content="0"/>
  </head>
"#,
    );
    ncx.push_str(&format!(
        "  <docTitle>\n    <text>{}</text>\n  </docTitle>\n",
        escape_xml(&book.title)
    ));
    for author in &book.authors {
        ncx.push_str(&format!(
            "  <docAuthor>\n    <text>{}</text>\n  </docAuthor>\n",
            escape_xml(&author.name)
        ));
    }

    ncx.push_str("  <navMap>\n");
    let mut play_order = 1;
    write_nav_points(&mut ncx, &entries, &mut play_order, 2);
    ncx.push_str("  </navMap>\n</ncx>\n");
    ncx
}

/// Recursively write navPoint elements.
fn write_nav_points(ncx: &mut String, entries: &[NavEntry], play_order: &mut usize, indent: usize) {
    let indent_str = "  ".repeat(indent);

    for entry in entries {
        ncx.push_str(&format!(
            "{indent_str}<navPoint id=\"navPoint-{play_order}\" playOrder=\"{play_order}\">\n"
        ));
        ncx.push_str(&format!(
            "{indent_str}  <navLabel><text>{}</text></navLabel>\n",
            escape_xml(&entry.title)
        ));
        ncx.push_str(&format!("{indent_str}  <content src=\"{}\"/>\n", escape_xml(&entry.href)));

        *play_order += 1;

        if !entry.children.is_empty() {
            write_nav_points(ncx, &entry.children, play_order, indent + 1);
        }

        ncx.push_str(&format!("{indent_str}</navPoint>\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{FileRequest, Group, TocItem};
    use crate::file::PathType;
    use crate::find::SourceTree;
    use std::fs;

    #[test]
    fn test_nav_points_nest_with_play_order() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("ch01.xhtml"), "x").unwrap();
        fs::write(dir.path().join("ch02.xhtml"), "x").unwrap();

        let mut book = Book::new("A < B");
        let mut section = TocItem::new("Section", FileRequest::new("ch01", Group::Text));
        section.fragment = Some("s".into());
        book.toc = vec![
            TocItem::new("One", FileRequest::new("ch01", Group::Text)).with_child(section),
            TocItem::new("Two", FileRequest::new("ch02", Group::Text)),
        ];
        let mut resolver = FileResolver::new(SourceTree::scan(dir.path()), dir.path().join("out"), "OEBPS");
        for item in book.toc_items() {
            resolver
                .add_file_from_request(item.file.as_ref().unwrap(), PathType::Spine)
                .unwrap();
        }

        let ncx = generate_ncx(&resolver, &book, &Target::new("t"));
        assert!(ncx.contains("<text>A &lt; B</text>"));
        assert!(ncx.contains("<meta name=\"dtb:depth\" content=\"2\"/>"));
        assert!(ncx.contains("<navPoint id=\"navPoint-2\" playOrder=\"2\">"));
        assert!(ncx.contains("      <content src=\"ch01.xhtml#s\"/>"));
        assert!(ncx.contains("<content src=\"ch02.xhtml\"/>"));
        assert_eq!(resolver.spine().len(), 2);
    }
}
