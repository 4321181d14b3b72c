//! `content.opf`: metadata, manifest, spine and (EPUB 2) guide.

use super::{book_identifier, landmarks, manifest_ids, modified_date};
use crate::book::{Book, Contributor, Target};
use crate::file::Generator;
use crate::resolver::FileResolver;
use crate::util::{escape_xml, media_type};
use crate::xhtml::encode_path;

const IBOOKS_PREFIX: &str = "ibooks: http://vocabulary.itunes.apple.com/rdf/ibooks/vocabulary-extensions-1.0/";

/// Manifest item properties defined by EPUB 3.
const ITEM_PROPERTIES: &[&str] = &["cover-image", "mathml", "nav", "remote-resources", "scripted", "svg", "switch"];

/// Generate `content.opf` for the current resolver state.
pub fn generate_opf(resolver: &FileResolver, book: &Book, target: &Target) -> String {
    let epub3 = target.is_epub3();
    let ids = manifest_ids(resolver);
    let identifier = book_identifier(book, target);

    let mut opf = String::new();
    opf.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    if epub3 {
        opf.push_str(&format!(
            "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"bookid\" xml:lang=\"{}\"",
            escape_xml(&book.language)
        ));
        if target.ibooks {
            opf.push_str(&format!(" prefix=\"{IBOOKS_PREFIX}\""));
        }
        opf.push_str(">\n");
        opf.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    } else {
        opf.push_str("<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"2.0\" unique-identifier=\"bookid\">\n");
        opf.push_str(
            "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n",
        );
    }

    // Title
    if epub3 {
        opf.push_str(&format!("    <dc:title id=\"title\">{}</dc:title>\n", escape_xml(&book.title)));
        opf.push_str("    <meta refines=\"#title\" property=\"title-type\">main</meta>\n");
        if let Some(subtitle) = &book.subtitle {
            opf.push_str(&format!("    <dc:title id=\"subtitle\">{}</dc:title>\n", escape_xml(subtitle)));
            opf.push_str("    <meta refines=\"#subtitle\" property=\"title-type\">subtitle</meta>\n");
        }
    } else {
        opf.push_str(&format!("    <dc:title>{}</dc:title>\n", escape_xml(&book.title)));
    }

    // Creators and contributors
    let mut next_id = 1;
    for (element, people) in [("creator", &book.authors), ("contributor", &book.contributors)] {
        for person in people {
            write_person(&mut opf, element, person, next_id, epub3);
            next_id += 1;
        }
    }

    opf.push_str(&format!("    <dc:language>{}</dc:language>\n", escape_xml(&book.language)));
    if !epub3 && target.isbn.is_some() {
        opf.push_str(&format!(
            "    <dc:identifier id=\"bookid\" opf:scheme=\"ISBN\">{}</dc:identifier>\n",
            escape_xml(&identifier)
        ));
    } else {
        opf.push_str(&format!("    <dc:identifier id=\"bookid\">{}</dc:identifier>\n", escape_xml(&identifier)));
    }

    if let Some(publisher) = &book.publisher {
        opf.push_str(&format!("    <dc:publisher>{}</dc:publisher>\n", escape_xml(publisher)));
    }
    if let Some(description) = &book.description {
        opf.push_str(&format!("    <dc:description>{}</dc:description>\n", escape_xml(description)));
    }
    if let Some(issued) = &book.issued {
        opf.push_str(&format!("    <dc:date>{}</dc:date>\n", escape_xml(issued)));
    }

    let modified = modified_date(resolver, book);
    if epub3 {
        opf.push_str(&format!("    <meta property=\"dcterms:modified\">{modified}</meta>\n"));
        if target.ibooks {
            opf.push_str(&format!(
                "    <meta property=\"ibooks:specified-fonts\">{}</meta>\n",
                target.custom_fonts
            ));
        }
        if target.fixed_layout {
            opf.push_str("    <meta property=\"rendition:layout\">pre-paginated</meta>\n");
        }
    } else {
        opf.push_str(&format!(
            "    <dc:date opf:event=\"modification\">{}</dc:date>\n",
            &modified[..10.min(modified.len())]
        ));
    }

    let cover = resolver
        .manifest()
        .iter()
        .copied()
        .find(|&id| resolver.file(id).properties.contains("cover-image"));
    if !epub3 && let Some(cover) = cover.and_then(|id| ids.get(&id)) {
        opf.push_str(&format!("    <meta name=\"cover\" content=\"{}\"/>\n", escape_xml(cover)));
    }
    opf.push_str("  </metadata>\n");

    // Manifest. The OPF sits at the content root, so destinations are
    // already relative to it.
    opf.push_str("  <manifest>\n");
    for &id in resolver.manifest() {
        let file = resolver.file(id);
        opf.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"",
            escape_xml(&ids[&id]),
            escape_xml(&encode_path(&file.destination_path)),
            media_type(&file.destination_path)
        ));
        if epub3 {
            let properties: Vec<&str> = file
                .properties
                .iter()
                .map(String::as_str)
                .filter(|p| ITEM_PROPERTIES.contains(p))
                .collect();
            if !properties.is_empty() {
                opf.push_str(&format!(" properties=\"{}\"", properties.join(" ")));
            }
        }
        opf.push_str("/>\n");
    }
    opf.push_str("  </manifest>\n");

    // Spine
    let ncx = resolver
        .manifest()
        .iter()
        .find(|&&id| resolver.file(id).generator() == Some(Generator::Ncx));
    match ncx.and_then(|id| ids.get(id)) {
        Some(ncx_id) => opf.push_str(&format!("  <spine toc=\"{}\">\n", escape_xml(ncx_id))),
        None => opf.push_str("  <spine>\n"),
    }
    for &id in resolver.spine() {
        let linear = if resolver.file(id).linear { "" } else { " linear=\"no\"" };
        opf.push_str(&format!("    <itemref idref=\"{}\"{linear}/>\n", escape_xml(&ids[&id])));
    }
    opf.push_str("  </spine>\n");

    // Guide
    if !epub3 {
        let references = landmarks(book, target, resolver, "");
        if !references.is_empty() {
            opf.push_str("  <guide>\n");
            for (landmark, href) in references {
                opf.push_str(&format!(
                    "    <reference type=\"{}\" title=\"{}\" href=\"{}\"/>\n",
                    landmark.guide_type(),
                    landmark.title(),
                    escape_xml(&href)
                ));
            }
            opf.push_str("  </guide>\n");
        }
    }

    opf.push_str("</package>\n");
    opf
}

fn write_person(opf: &mut String, element: &str, person: &Contributor, n: usize, epub3: bool) {
    if epub3 {
        let id = format!("{element}{n}");
        opf.push_str(&format!("    <dc:{element} id=\"{id}\">{}</dc:{element}>\n", escape_xml(&person.name)));
        if let Some(role) = &person.role {
            opf.push_str(&format!(
                "    <meta refines=\"#{id}\" property=\"role\" scheme=\"marc:relators\">{}</meta>\n",
                escape_xml(role)
            ));
        }
        if let Some(file_as) = &person.file_as {
            opf.push_str(&format!(
                "    <meta refines=\"#{id}\" property=\"file-as\">{}</meta>\n",
                escape_xml(file_as)
            ));
        }
    } else {
        opf.push_str(&format!("    <dc:{element}"));
        if let Some(role) = &person.role {
            opf.push_str(&format!(" opf:role=\"{}\"", escape_xml(role)));
        }
        if let Some(file_as) = &person.file_as {
            opf.push_str(&format!(" opf:file-as=\"{}\"", escape_xml(file_as)));
        }
        opf.push_str(&format!(">{}</dc:{element}>\n", escape_xml(&person.name)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{EpubVersion, FileRequest, Group, Landmark, TocItem};
    use crate::file::{File, PathType};
    use crate::find::SourceTree;
    use std::fs;

    fn setup(version: EpubVersion) -> (tempfile::TempDir, FileResolver, Book, Target) {
        let dir = tempfile::TempDir::new().unwrap();
        for path in ["text/cover.xhtml", "text/ch01.xhtml", "text/notes.xhtml", "images/cover.png"] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, "x").unwrap();
        }

        let mut book = Book::new("Tom & Jerry");
        book.authors.push(Contributor::author("Jane Doe"));
        book.modified = Some("2024-05-01T00:00:00Z".into());
        book.toc = vec![
            TocItem::new("Cover", FileRequest::new("cover", Group::Text)).with_landmark(Landmark::Cover),
            TocItem::new("Chapter", FileRequest::new("ch01", Group::Text))
                .with_landmark(Landmark::StartPage)
                .with_landmark(Landmark::IbooksStartPage),
            TocItem::new("Notes", FileRequest::new("notes", Group::Text)).non_linear(),
        ];
        let mut target = Target::new("t");
        target.epub_version = version;

        let mut resolver = FileResolver::new(SourceTree::scan(dir.path()), dir.path().join("out"), "OEBPS");
        for item in &book.toc {
            let ids = resolver
                .add_file_from_request(item.file.as_ref().unwrap(), PathType::Spine)
                .unwrap();
            resolver.file_mut(ids[0]).linear = item.linear;
        }
        let cover = resolver.add_source_file("images/cover.png", PathType::Manifest);
        resolver.file_mut(cover).properties.insert("cover-image".into());
        let nav = if version == EpubVersion::Epub3 { Generator::Nav } else { Generator::Ncx };
        resolver.add_file(File::generated(nav), PathType::Manifest);
        let mut opf = File::generated(Generator::Opf);
        opf.destination_path = "OEBPS/content.opf".into();
        resolver.add_file(opf, PathType::Package);
        (dir, resolver, book, target)
    }

    #[test]
    fn test_epub3_opf() {
        let (_dir, resolver, book, target) = setup(EpubVersion::Epub3);
        let opf = generate_opf(&resolver, &book, &target);
        assert!(opf.contains("version=\"3.0\""));
        assert!(opf.contains("<dc:title id=\"title\">Tom &amp; Jerry</dc:title>"));
        assert!(opf.contains("<meta refines=\"#creator1\" property=\"role\" scheme=\"marc:relators\">aut</meta>"));
        assert!(opf.contains("<meta property=\"dcterms:modified\">2024-05-01T00:00:00Z</meta>"));
        assert!(opf.contains(
            "<item id=\"images_cover.png\" href=\"images/cover.png\" media-type=\"image/png\" properties=\"cover-image\"/>"
        ));
        assert!(opf.contains("href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>"));
        assert!(opf.contains("<spine>\n"));
        assert!(opf.contains("<itemref idref=\"text_notes.xhtml\" linear=\"no\"/>"));
        assert!(!opf.contains("<guide>"));
        assert!(!opf.contains("ibooks"));
    }

    #[test]
    fn test_epub2_opf() {
        let (_dir, resolver, book, target) = setup(EpubVersion::Epub2);
        let opf = generate_opf(&resolver, &book, &target);
        assert!(opf.contains("version=\"2.0\""));
        assert!(opf.contains("<dc:creator opf:role=\"aut\">Jane Doe</dc:creator>"));
        assert!(opf.contains("<meta name=\"cover\" content=\"images_cover.png\"/>"));
        assert!(opf.contains("<spine toc=\"nav.ncx\">"));
        assert!(opf.contains("<reference type=\"cover\" title=\"Cover\" href=\"text/cover.xhtml\"/>"));
        assert_eq!(opf.matches("<reference type=\"text\"").count(), 1);
        assert!(!opf.contains("properties="));
    }

    #[test]
    fn test_ibooks_metadata() {
        let (_dir, resolver, book, mut target) = setup(EpubVersion::Epub3);
        target.ibooks = true;
        target.custom_fonts = true;
        let opf = generate_opf(&resolver, &book, &target);
        assert!(opf.contains("prefix=\"ibooks: "));
        assert!(opf.contains("<meta property=\"ibooks:specified-fonts\">true</meta>"));
    }

    #[test]
    fn test_unchanged_state_is_byte_identical() {
        let (_dir, resolver, mut book, target) = setup(EpubVersion::Epub3);
        book.modified = None;
        assert_eq!(generate_opf(&resolver, &book, &target), generate_opf(&resolver, &book, &target));
    }
}
