//! Named quality tiers and the recompression settings they stand for.

use clap::ValueEnum;
use std::fmt;

/// Quality tier selected on the command line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum Quality {
    /// Larger output, print-grade images
    High,
    /// Balanced size and clarity
    #[default]
    Medium,
    /// Smallest output, screen-grade images
    Low,
}

impl Quality {
    pub const ALL: [Quality; 3] = [Quality::High, Quality::Medium, Quality::Low];

    pub fn preset(self) -> QualityPreset {
        match self {
            Quality::High => QualityPreset {
                name: "high",
                ghostscript_preset: "printer",
                jpeg_quality: 75,
                target_dpi: 300,
            },
            Quality::Medium => QualityPreset {
                name: "medium",
                ghostscript_preset: "ebook",
                jpeg_quality: 55,
                target_dpi: 150,
            },
            Quality::Low => QualityPreset {
                name: "low",
                ghostscript_preset: "screen",
                jpeg_quality: 35,
                target_dpi: 72,
            },
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.preset().name)
    }
}

/// Settings derived from a [`Quality`] tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QualityPreset {
    pub name: &'static str,
    /// Value passed to Ghostscript as `-dPDFSETTINGS=/<preset>`
    pub ghostscript_preset: &'static str,
    /// JPEG quality factor, 1-100
    pub jpeg_quality: u8,
    pub target_dpi: u32,
}

impl QualityPreset {
    /// Replace the target DPI, keeping everything else.
    pub fn with_dpi(self, dpi: u32) -> Self {
        Self {
            target_dpi: dpi,
            ..self
        }
    }
}

impl Default for QualityPreset {
    fn default() -> Self {
        Quality::default().preset()
    }
}
