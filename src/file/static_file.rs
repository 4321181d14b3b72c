//! Byte-for-byte copies.

use std::fs;

use tracing::trace;

use super::{FileId, ProcessContext, Processed, destination_is_newer};
use crate::error::Result;
use crate::util::write_if_changed;

pub(super) fn process(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let file = ctx.resolver.file(id);
    let Some(source) = file.source() else {
        return Ok(Processed::default());
    };

    if destination_is_newer(&source.abs_source_path, &file.final_destination_path) {
        trace!(path = %source.source_path, "destination is newer, not copying");
        return Ok(Processed::default());
    }

    let bytes = fs::read(&source.abs_source_path)?;
    let wrote = write_if_changed(&file.final_destination_path, &bytes)?;
    Ok(Processed {
        wrote,
        dependencies: Vec::new(),
    })
}
