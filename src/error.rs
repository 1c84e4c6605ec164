use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors that abort a compression run.
///
/// Per-image problems never show up here; they are counted in the
/// [`RewriteReport`](crate::rewrite::RewriteReport) instead.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("input file does not exist: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("failed to load PDF: {0}")]
    Load(String),

    #[error("encrypted PDFs are not supported")]
    Encrypted,

    #[error("failed to save PDF: {0}")]
    Save(String),

    #[error("{tool} not found on PATH, install it or choose another engine")]
    ToolMissing { tool: &'static str },

    #[error("compression failed, no output file was produced at {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
