//! XHTML documents: static, templated and Markdown sources.

use std::fs;

use sha1_smol::Sha1;
use tracing::{debug, warn};

use super::{FileId, ProcessContext, Processed, SourceFormat, write_document};
use crate::collab::{Bindings, FileBinding, HookPoint, markdown_to_xhtml};
use crate::error::Result;
use crate::util::{read_text, write_if_changed};
use crate::xhtml;

pub(super) fn process(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let file = ctx.resolver.file(id);
    let Some(source) = file.source() else {
        return Ok(Processed::default());
    };
    let source_path = source.source_path.clone();
    let format = source.format;
    let pkg_path = file.pkg_destination_path.clone();
    let text = read_text(&source.abs_source_path)?;

    let mut dependencies = Vec::new();
    let rendered = match format {
        SourceFormat::Template | SourceFormat::Markdown => {
            let precompiled = precompile(ctx, &source_path, format, &text)?;
            let bindings = bindings(id, ctx);
            let rendered = ctx
                .collaborators
                .templates
                .render(&source_path, &precompiled, &bindings)?;
            dependencies.extend(rendered.dependencies);
            dependencies.push(ctx.spec_path.to_string());
            rendered.content
        }
        _ => text,
    };

    let rendered = ctx.run_hooks(HookPoint::PostRender, &pkg_path, rendered)?;
    let output = xhtml::process_document(id, &rendered, ctx)?;

    let has_markers = output.has_global_markers();
    let file = ctx.resolver.file_mut(id);
    file.properties.extend(output.properties);
    file.global_ids = output.global_ids;
    file.global_links = output.global_links;

    let wrote = if has_markers {
        // Written by the global id pass once every document is known.
        file.pending_content = Some(output.content);
        false
    } else {
        write_document(ctx, id, output.content)?
    };

    Ok(Processed { wrote, dependencies })
}

/// Precompiled template text, reused from the cache while the source is
/// unchanged.
fn precompile(ctx: &ProcessContext<'_>, source_path: &str, format: SourceFormat, text: &str) -> Result<String> {
    let key = Sha1::from(source_path).hexdigest();
    let cache_path = ctx.template_cache.join(format!("{key}.tpl"));

    if !ctx.source_db.changed(source_path, false)
        && let Ok(cached) = fs::read_to_string(&cache_path)
    {
        debug!(path = %source_path, "using precompiled template");
        return Ok(cached);
    }

    let text = match format {
        SourceFormat::Markdown => markdown_to_xhtml(text),
        _ => text.to_string(),
    };
    let precompiled = ctx.collaborators.templates.precompile(source_path, &text)?;
    write_if_changed(&cache_path, precompiled.as_bytes())?;
    Ok(precompiled)
}

fn bindings<'a>(id: FileId, ctx: &'a ProcessContext<'_>) -> Bindings<'a> {
    let binding = |file: &super::File| FileBinding {
        source_path: file.source_path().map(str::to_string),
        destination_path: file.destination_path.clone(),
        title: file.title.clone(),
    };
    Bindings {
        book: ctx.book,
        target: ctx.target,
        file: binding(ctx.resolver.file(id)),
        files: ctx.resolver.files().map(|(_, f)| binding(f)).collect(),
        constants: ctx.book.constants_for(ctx.target),
    }
}

/// Recover properties and linked resources of an up-to-date document from
/// its previous output.
pub(super) fn restore(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<()> {
    let file = ctx.resolver.file(id);
    let destination = file.destination_path.clone();
    let content = match fs::read_to_string(&file.final_destination_path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %file.pkg_destination_path, error = %e, "cannot read previous output");
            return Ok(());
        }
    };

    let (resources, properties) = xhtml::written_references(&content, &destination);
    for resource in resources {
        if ctx.resolver.register_destination(&resource).is_none() {
            debug!(path = %destination, resource = %resource, "linked resource has no source");
        }
    }
    ctx.resolver.file_mut(id).properties.extend(properties);
    Ok(())
}
