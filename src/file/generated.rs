//! Package documents generated from the resolver state.

use super::{FileId, FileKind, Generator, ProcessContext, Processed};
use crate::error::Result;
use crate::generate;
use crate::util::write_if_changed;

pub(super) fn process(id: FileId, generator: Generator, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let content = generate::generate(generator, ctx.resolver, ctx.book, ctx.target)?;
    let wrote = write_if_changed(&ctx.resolver.file(id).final_destination_path, content.as_bytes())?;
    if let FileKind::Generated(generated) = &mut ctx.resolver.file_mut(id).kind {
        generated.content = Some(content);
    }
    Ok(Processed {
        wrote,
        dependencies: Vec::new(),
    })
}
