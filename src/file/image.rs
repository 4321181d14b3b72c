//! Raster images, downscaled through the image collaborator when they
//! exceed the configured pixel budget.

use std::fs;

use tracing::{debug, trace};

use super::{FileId, ProcessContext, Processed, destination_is_newer};
use crate::error::Result;
use crate::util::{extract_image_dimensions, write_if_changed};

pub(super) fn process(id: FileId, ctx: &mut ProcessContext<'_>) -> Result<Processed> {
    let file = ctx.resolver.file(id);
    let Some(source) = file.source() else {
        return Ok(Processed::default());
    };

    if destination_is_newer(&source.abs_source_path, &file.final_destination_path) {
        trace!(path = %source.source_path, "destination is newer, not converting");
        return Ok(Processed::default());
    }

    let bytes = fs::read(&source.abs_source_path)?;
    let max_pixels = ctx.config.max_image_pixels;
    let output = match extract_image_dimensions(&bytes) {
        Some((width, height)) if u64::from(width) * u64::from(height) > max_pixels => {
            debug!(path = %source.source_path, width, height, max_pixels, "downscaling image");
            ctx.collaborators
                .images
                .resize(&source.source_path, &bytes, max_pixels)?
        }
        _ => bytes,
    };

    let wrote = write_if_changed(&file.final_destination_path, &output)?;
    Ok(Processed {
        wrote,
        dependencies: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{Book, Target};
    use crate::collab::{Collaborators, ImageResizer};
    use crate::config::CompilerConfig;
    use crate::database::FileDatabase;
    use crate::file::PathType;
    use crate::find::SourceTree;
    use crate::resolver::FileResolver;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Minimal PNG header with the given dimensions.
    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R'];
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data
    }

    struct Shrink(Rc<Cell<u64>>);

    impl ImageResizer for Shrink {
        fn resize(&self, _path: &str, _bytes: &[u8], max_pixels: u64) -> Result<Vec<u8>> {
            self.0.set(max_pixels);
            Ok(b"small".to_vec())
        }
    }

    fn run(width: u32, height: u32) -> (Vec<u8>, u64) {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        fs::write(dir.path().join("images/a.png"), png(width, height)).unwrap();

        let calls = Rc::new(Cell::new(0));
        let collaborators = Collaborators::default().with_images(Shrink(calls.clone()));
        let mut resolver = FileResolver::new(SourceTree::scan(dir.path()), dir.path().join("out"), "OEBPS");
        let id = resolver.add_source_file("images/a.png", PathType::Manifest);
        let book = Book::new("x");
        let target = Target::new("t");
        let config = CompilerConfig::default();
        let db = FileDatabase::new(dir.path(), dir.path().join("db.yml"));
        let mut problems = Vec::new();
        let mut ctx = ProcessContext {
            book: &book,
            target: &target,
            config: &config,
            collaborators: &collaborators,
            resolver: &mut resolver,
            problems: &mut problems,
            source_db: &db,
            template_cache: dir.path(),
            spec_path: "x.book.yml",
        };
        process(id, &mut ctx).unwrap();
        let out = fs::read(dir.path().join("out/OEBPS/images/a.png")).unwrap();
        (out, calls.get())
    }

    #[test]
    fn test_small_image_copied() {
        let (out, calls) = run(100, 100);
        assert_eq!(out, png(100, 100));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_large_image_resized() {
        let (out, calls) = run(2000, 2000);
        assert_eq!(out, b"small");
        assert_eq!(calls, 3_000_000);
    }
}
