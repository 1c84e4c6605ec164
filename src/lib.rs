//! PDF Shrinker Library
//!
//! Reduces PDF size by downsampling and re-encoding embedded images as JPEG.
//! The built-in engine walks the page tree with lopdf, decodes each image
//! XObject, rescales it toward a target DPI and substitutes the JPEG back
//! under the same object id. Ghostscript is used instead when available.

pub mod decode;
pub mod engine;
pub mod error;
pub mod output;
pub mod quality;
pub mod recompress;
pub mod report;
pub mod rewrite;
pub mod scale;

pub use engine::{Engine, RunSummary, SelectedEngine};
pub use error::CompressError;
pub use quality::{Quality, QualityPreset};
pub use rewrite::{RewriteReport, Rewriter};

use std::path::{Path, PathBuf};

/// Options for a compression run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    /// JPEG quality and target DPI (after any DPI override)
    pub preset: QualityPreset,
    /// Flate-compress streams that are stored uncompressed
    pub compress_streams: bool,
    /// Save with object streams and a cross-reference stream
    pub object_streams: bool,
}

impl CompressOptions {
    pub fn new(quality: Quality, dpi: Option<u32>) -> Self {
        let preset = quality.preset();
        Self {
            preset: dpi.map_or(preset, |dpi| preset.with_dpi(dpi)),
            ..Self::default()
        }
    }
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            preset: QualityPreset::default(),
            compress_streams: true,
            object_streams: true,
        }
    }
}

/// `{stem}_compressed{ext}` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{}_compressed.{}", stem, ext.to_string_lossy()),
        None => format!("{}_compressed", stem),
    };
    input.with_file_name(name)
}

/// Recompress the images of a PDF file with the built-in engine.
pub fn compress_pdf_file(
    input_path: &Path,
    output_path: &Path,
    options: &CompressOptions,
) -> Result<RewriteReport, CompressError> {
    if !input_path.is_file() {
        return Err(CompressError::InputNotFound(input_path.to_path_buf()));
    }

    let mut rewriter = Rewriter::open(input_path, *options)?;
    let report = rewriter.rewrite_images();
    rewriter.save(output_path)?;

    Ok(report)
}

/// Recompress the images of an in-memory PDF with the built-in engine.
pub fn compress_pdf_bytes(
    input_bytes: &[u8],
    options: &CompressOptions,
) -> Result<(Vec<u8>, RewriteReport), CompressError> {
    let mut rewriter = Rewriter::from_bytes(input_bytes, *options)?;
    let report = rewriter.rewrite_images();

    let mut output_bytes = Vec::new();
    rewriter.save_to(&mut output_bytes)?;

    Ok((output_bytes, report))
}
