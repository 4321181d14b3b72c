//! `META-INF` documents.

use crate::book::Target;
use crate::file::Generator;
use crate::resolver::FileResolver;
use crate::util::escape_xml;

/// `container.xml` pointing at the registered OPF.
pub fn container_xml(resolver: &FileResolver) -> String {
    let opf_path = resolver
        .package()
        .iter()
        .map(|&id| resolver.file(id))
        .find(|file| file.generator() == Some(Generator::Opf))
        .map(|file| file.pkg_destination_path.clone())
        .unwrap_or_else(|| format!("{}/content.opf", resolver.content_folder()));

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="{}" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#,
        escape_xml(&opf_path)
    )
}

/// Apple Books display options, declaring embedded fonts and fixed layout.
pub fn ibooks_display_options(target: &Target) -> String {
    let mut options = String::new();
    if target.custom_fonts {
        options.push_str("    <option name=\"specified-fonts\">true</option>\n");
    }
    if target.fixed_layout {
        options.push_str("    <option name=\"fixed-layout\">true</option>\n");
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<display_options>\n  <platform name=\"*\">\n{options}  </platform>\n</display_options>\n"
    )
}

/// Whether a target needs the display-options file at all.
pub fn needs_display_options(target: &Target) -> bool {
    target.ibooks && (target.custom_fonts || target.fixed_layout)
}
