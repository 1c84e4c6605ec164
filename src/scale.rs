//! Downscale factor estimation.
//!
//! The effective DPI is a rough estimate that assumes the image spans an
//! 8 inch page dimension. Placement geometry from content streams is not
//! consulted.

/// Page dimension, in inches, the longest image side is assumed to cover.
pub const ASSUMED_PAGE_INCHES: f64 = 8.0;

/// Estimate the effective DPI of an image from its pixel dimensions.
pub fn effective_dpi(width: u32, height: u32) -> f64 {
    f64::from(width.max(height)) / ASSUMED_PAGE_INCHES
}

/// Factor in `(0, 1]` to multiply the image dimensions by.
///
/// Returns 1.0 when the image is already at or below `target_dpi`.
pub fn scale_factor(width: u32, height: u32, target_dpi: u32) -> f64 {
    let current = effective_dpi(width, height);
    let target = f64::from(target_dpi.max(1));
    if current <= target {
        1.0
    } else {
        target / current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_dpi_uses_longest_side() {
        assert_eq!(effective_dpi(800, 600), 100.0);
        assert_eq!(effective_dpi(600, 2400), 300.0);
    }

    #[test]
    fn test_no_downscale_below_target() {
        assert_eq!(scale_factor(800, 600, 150), 1.0);
        assert_eq!(scale_factor(800, 600, 100), 1.0);
    }

    #[test]
    fn test_downscale_above_target() {
        let scale = scale_factor(800, 600, 72);
        assert!((scale - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_scale_is_bounded() {
        for (w, h) in [(1, 1), (7, 3), (800, 600), (10_000, 20), (65_535, 65_535)] {
            for dpi in [0, 1, 72, 150, 300, 10_000] {
                let scale = scale_factor(w, h, dpi);
                assert!(scale > 0.0 && scale <= 1.0, "{w}x{h}@{dpi} -> {scale}");
            }
        }
    }
}
