//! Resize decoded images and encode them as JPEG.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use jpeg_encoder::{ColorType, Encoder, EncodingError, SamplingFactor};
use lopdf::{Dictionary, Object, Stream};
use thiserror::Error;

use crate::decode::DecodedImage;

#[derive(Error, Debug)]
pub enum RecompressError {
    #[error("image of {width}x{height} exceeds the JPEG size limit")]
    TooLarge { width: u32, height: u32 },

    #[error("failed to encode JPEG: {0}")]
    Encode(#[from] EncodingError),
}

/// What color conversion happened before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Already 8-bit RGB, passed through
    Unchanged,
    /// Converted to RGB without touching transparency
    Converted,
    /// Composited onto a white background
    Flattened,
}

/// A JPEG stream ready to replace an image XObject.
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub normalization: Normalization,
}

impl CompressedImage {
    /// Build the image XObject stream for this JPEG.
    pub fn into_stream(self) -> Stream {
        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"XObject".to_vec()));
        dict.set("Subtype", Object::Name(b"Image".to_vec()));
        dict.set("Width", Object::Integer(self.width as i64));
        dict.set("Height", Object::Integer(self.height as i64));
        dict.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
        dict.set("BitsPerComponent", Object::Integer(8));
        dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
        dict.set("Length", Object::Integer(self.data.len() as i64));

        Stream::new(dict, self.data)
    }
}

/// Target size for a scale factor; never smaller than one pixel.
pub fn scaled_dimensions(width: u32, height: u32, scale: f64) -> (u32, u32) {
    if scale >= 1.0 {
        return (width, height);
    }
    let scaled = |n: u32| ((f64::from(n) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Resize (when `scale < 1.0`) and re-encode an image as JPEG.
pub fn recompress(
    image: DecodedImage,
    scale: f64,
    jpeg_quality: u8,
) -> Result<CompressedImage, RecompressError> {
    let mut img = image.into_dynamic();

    let (target_width, target_height) = scaled_dimensions(img.width(), img.height(), scale);
    if (target_width, target_height) != (img.width(), img.height()) {
        log::debug!(
            "resampling {}x{} -> {}x{}",
            img.width(),
            img.height(),
            target_width,
            target_height
        );
        img = img.resize_exact(target_width, target_height, FilterType::Lanczos3);
    }

    let (rgb, normalization) = normalize(img);
    let (width, height) = rgb.dimensions();
    let (w16, h16) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(RecompressError::TooLarge { width, height }),
    };

    let mut data = Vec::new();
    let mut encoder = Encoder::new(&mut data, jpeg_quality.clamp(1, 100));
    encoder.set_sampling_factor(SamplingFactor::R_4_2_0);
    encoder.set_optimized_huffman_tables(true);
    encoder.encode(rgb.as_raw(), w16, h16, ColorType::Rgb)?;

    Ok(CompressedImage {
        data,
        width,
        height,
        normalization,
    })
}

/// Bring any pixel layout to opaque 8-bit RGB.
fn normalize(img: DynamicImage) -> (RgbImage, Normalization) {
    match img {
        DynamicImage::ImageRgb8(rgb) => (rgb, Normalization::Unchanged),
        img if img.color().has_alpha() => (flatten_on_white(&img), Normalization::Flattened),
        img => (img.to_rgb8(), Normalization::Converted),
    }
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for pixel in rgba.pixels() {
        let alpha = u16::from(pixel[3]);
        for &channel in &pixel.0[..3] {
            let blended = (u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255;
            rgb.push(blended as u8);
        }
    }
    RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height))
}
