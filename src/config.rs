//! Compiler configuration.

use std::path::PathBuf;

/// Pixel count above which raster images are handed to the resizer.
pub const DEFAULT_MAX_IMAGE_PIXELS: u64 = 3_000_000;

/// Options for one [`Compiler`](crate::Compiler).
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Release builds escalate XML problems and duplicate global ids to
    /// fatal errors.
    pub release: bool,
    /// Folder inside the package holding the OPF and every manifest file.
    pub content_folder: String,
    /// Hidden working directory, relative to the project root.
    pub working_dir: PathBuf,
    /// Archive path override. Relative paths resolve against the project root.
    pub output: Option<PathBuf>,
    pub max_image_pixels: u64,
    /// Deflate level (0-9) for compressed archive entries.
    pub compression_level: Option<u32>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            release: false,
            content_folder: "OEBPS".to_string(),
            working_dir: PathBuf::from(".quire"),
            output: None,
            max_image_pixels: DEFAULT_MAX_IMAGE_PIXELS,
            compression_level: None,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    pub fn with_content_folder(mut self, folder: impl Into<String>) -> Self {
        self.content_folder = folder.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_max_image_pixels(mut self, pixels: u64) -> Self {
        self.max_image_pixels = pixels;
        self
    }

    /// Set the deflate level, clamped to 0-9.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level.min(9));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert!(!config.release);
        assert_eq!(config.content_folder, "OEBPS");
        assert_eq!(config.max_image_pixels, 3_000_000);
    }

    #[test]
    fn test_compression_level_clamped() {
        let config = CompilerConfig::new().with_compression_level(42);
        assert_eq!(config.compression_level, Some(9));
    }
}
