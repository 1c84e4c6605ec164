//! Image XObject decoding.
//!
//! An [`ImageObject`] captures everything needed from a PDF image stream.
//! [`decode`] turns it into a [`DecodedImage`] or reports why it cannot,
//! in which case the caller leaves the original stream alone.

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use thiserror::Error;

/// Reasons an image stream cannot be decoded.
///
/// These are per-image misses: the image is skipped and the run goes on.
#[derive(Error, Debug)]
pub enum Undecodable {
    #[error("stencil masks are not recompressed")]
    StencilMask,

    #[error("unsupported filter {0}")]
    UnsupportedFilter(String),

    #[error("{filter} failed: {message}")]
    FilterFailed {
        filter: &'static str,
        message: String,
    },

    #[error("unsupported predictor {0}")]
    UnsupportedPredictor(i64),

    #[error("expected at least {expected} bytes of sample data, got {actual}")]
    ShortData { expected: usize, actual: usize },

    #[error("image of {width}x{height} is too large to decode")]
    TooLarge { width: u32, height: u32 },

    #[error("unsupported color space {0}")]
    UnsupportedColorSpace(String),

    #[error("unsupported bits per component: {0}")]
    UnsupportedDepth(u8),

    #[error("failed to decode JPEG data: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Parameters of the Flate predictor (`/DecodeParms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorParams {
    pub predictor: i64,
    pub colors: usize,
    pub bits_per_component: usize,
    pub columns: usize,
}

impl Default for PredictorParams {
    fn default() -> Self {
        Self {
            predictor: 1,
            colors: 1,
            bits_per_component: 8,
            columns: 1,
        }
    }
}

/// One stage of a stream's filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Flate(PredictorParams),
    Lzw {
        predictor: PredictorParams,
        early_change: bool,
    },
    AsciiHex,
    Ascii85,
    RunLength,
    Dct,
    Other(String),
}

impl Filter {
    fn from_name(name: &[u8], params: Option<&Dictionary>) -> Self {
        match name {
            b"FlateDecode" | b"Fl" => Filter::Flate(parse_predictor_params(params)),
            b"LZWDecode" | b"LZW" => Filter::Lzw {
                predictor: parse_predictor_params(params),
                early_change: parse_early_change(params),
            },
            b"ASCIIHexDecode" | b"AHx" => Filter::AsciiHex,
            b"ASCII85Decode" | b"A85" => Filter::Ascii85,
            b"RunLengthDecode" | b"RL" => Filter::RunLength,
            b"DCTDecode" | b"DCT" => Filter::Dct,
            other => Filter::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    fn name(&self) -> &str {
        match self {
            Filter::Flate(_) => "FlateDecode",
            Filter::Lzw { .. } => "LZWDecode",
            Filter::AsciiHex => "ASCIIHexDecode",
            Filter::Ascii85 => "ASCII85Decode",
            Filter::RunLength => "RunLengthDecode",
            Filter::Dct => "DCTDecode",
            Filter::Other(name) => name,
        }
    }
}

/// Color space of an image, resolved to what the decoder understands.
///
/// ICC-based and calibrated spaces collapse onto their device equivalents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpace {
    DeviceGray,
    DeviceRgb,
    DeviceCmyk,
    Indexed {
        base: Box<ColorSpace>,
        hival: u8,
        lookup: Vec<u8>,
    },
    Other(String),
}

impl ColorSpace {
    /// Number of color components per sample, `None` when unsupported.
    pub fn components(&self) -> Option<usize> {
        match self {
            ColorSpace::DeviceGray | ColorSpace::Indexed { .. } => Some(1),
            ColorSpace::DeviceRgb => Some(3),
            ColorSpace::DeviceCmyk => Some(4),
            ColorSpace::Other(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            ColorSpace::DeviceGray => "DeviceGray".into(),
            ColorSpace::DeviceRgb => "DeviceRGB".into(),
            ColorSpace::DeviceCmyk => "DeviceCMYK".into(),
            ColorSpace::Indexed { base, .. } => format!("Indexed({})", base.describe()),
            ColorSpace::Other(name) => name.clone(),
        }
    }

    fn from_object(obj: &Object, doc: &Document) -> Self {
        match resolve(doc, obj) {
            Object::Name(name) => Self::from_name(name),
            Object::Array(arr) => {
                let family = match arr.first().map(|o| resolve(doc, o)) {
                    Some(Object::Name(n)) => n.as_slice(),
                    _ => return ColorSpace::Other("Unknown".into()),
                };
                match family {
                    b"ICCBased" => arr
                        .get(1)
                        .map(|o| Self::from_icc_profile(resolve(doc, o), doc))
                        .unwrap_or_else(|| ColorSpace::Other("ICCBased".into())),
                    b"Indexed" | b"I" => Self::from_indexed(arr, doc),
                    b"CalGray" => ColorSpace::DeviceGray,
                    b"CalRGB" => ColorSpace::DeviceRgb,
                    other => Self::from_name(other),
                }
            }
            _ => ColorSpace::Other("Unknown".into()),
        }
    }

    fn from_name(name: &[u8]) -> Self {
        match name {
            b"DeviceGray" | b"G" | b"CalGray" => ColorSpace::DeviceGray,
            b"DeviceRGB" | b"RGB" | b"CalRGB" => ColorSpace::DeviceRgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::DeviceCmyk,
            other => ColorSpace::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    fn from_icc_profile(profile: &Object, doc: &Document) -> Self {
        let Object::Stream(stream) = profile else {
            return ColorSpace::Other("ICCBased".into());
        };
        match stream.dict.get(b"N").ok().and_then(|n| as_i64(doc, n)) {
            Some(1) => ColorSpace::DeviceGray,
            Some(3) => ColorSpace::DeviceRgb,
            Some(4) => ColorSpace::DeviceCmyk,
            _ => stream
                .dict
                .get(b"Alternate")
                .map(|alt| Self::from_object(alt, doc))
                .unwrap_or_else(|_| ColorSpace::Other("ICCBased".into())),
        }
    }

    fn from_indexed(arr: &[Object], doc: &Document) -> Self {
        let (Some(base), Some(hival), Some(lookup)) = (arr.get(1), arr.get(2), arr.get(3)) else {
            return ColorSpace::Other("Indexed".into());
        };
        let base = Self::from_object(base, doc);
        let hival = as_i64(doc, hival).unwrap_or(0).clamp(0, 255) as u8;
        let lookup = match resolve(doc, lookup) {
            Object::String(bytes, _) => bytes.clone(),
            Object::Stream(stream) => match decode_stream_data(stream, doc) {
                Ok(bytes) => bytes,
                Err(_) => return ColorSpace::Other("Indexed".into()),
            },
            _ => return ColorSpace::Other("Indexed".into()),
        };
        ColorSpace::Indexed {
            base: Box::new(base),
            hival,
            lookup,
        }
    }
}

/// Raw image stream plus the metadata needed to decode it.
#[derive(Debug, Clone)]
pub struct ImageObject {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u8,
    pub color_space: ColorSpace,
    pub filters: Vec<Filter>,
    pub decode: Option<Vec<f32>>,
    pub image_mask: bool,
    pub data: Vec<u8>,
}

impl ImageObject {
    /// Read image metadata from an XObject stream.
    ///
    /// Missing or malformed dimensions read as zero.
    pub fn from_stream(stream: &Stream, doc: &Document) -> Self {
        let dict = &stream.dict;
        let dimension = |key: &[u8]| {
            dict.get(key)
                .ok()
                .and_then(|o| as_i64(doc, o))
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0)
        };

        let image_mask = matches!(
            dict.get(b"ImageMask").map(|o| resolve(doc, o)),
            Ok(Object::Boolean(true))
        );

        let bits_per_component = if image_mask {
            1
        } else {
            dict.get(b"BitsPerComponent")
                .ok()
                .and_then(|o| as_i64(doc, o))
                .and_then(|n| u8::try_from(n).ok())
                .unwrap_or(8)
        };

        let color_space = dict
            .get(b"ColorSpace")
            .map(|cs| ColorSpace::from_object(cs, doc))
            .unwrap_or(ColorSpace::DeviceRgb);

        let decode = match dict.get(b"Decode").map(|o| resolve(doc, o)) {
            Ok(Object::Array(arr)) => arr.iter().map(|o| as_f32(doc, o)).collect(),
            _ => None,
        };

        ImageObject {
            width: dimension(b"Width"),
            height: dimension(b"Height"),
            bits_per_component,
            color_space,
            filters: parse_filters(dict, doc),
            decode,
            image_mask,
            data: stream.content.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn pixel_count(&self) -> Result<usize, Undecodable> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .ok_or(Undecodable::TooLarge {
                width: self.width,
                height: self.height,
            })
    }

    /// Apply every filter of the chain and return the raw samples.
    fn decoded_samples(&self) -> Result<Vec<u8>, Undecodable> {
        apply_filters(&self.data, &self.filters)
    }
}

/// How an image's samples are stored, one variant per decode strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    /// The chain ends in DCTDecode
    Jpeg,
    /// 8-bit DeviceRGB samples
    Rgb8,
    /// 8-bit DeviceGray samples
    Gray8,
    /// Anything else the PDF image model allows
    Generic,
}

impl ImageEncoding {
    pub fn classify(image: &ImageObject) -> Self {
        if matches!(image.filters.last(), Some(Filter::Dct)) {
            return ImageEncoding::Jpeg;
        }
        if image.bits_per_component != 8 || image.decode.is_some() {
            return ImageEncoding::Generic;
        }
        match image.color_space {
            ColorSpace::DeviceRgb => ImageEncoding::Rgb8,
            ColorSpace::DeviceGray => ImageEncoding::Gray8,
            _ => ImageEncoding::Generic,
        }
    }
}

/// Pixel layout of a [`DecodedImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelMode {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

/// Decoded pixels, alive only while an image is being recompressed.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    image: DynamicImage,
}

impl DecodedImage {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    pub fn mode(&self) -> PixelMode {
        match self.channels() {
            1 => PixelMode::Gray,
            2 => PixelMode::GrayAlpha,
            3 => PixelMode::Rgb,
            _ => PixelMode::Rgba,
        }
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_dynamic(self) -> DynamicImage {
        self.image
    }
}

/// Decode an image object into pixels.
pub fn decode(image: &ImageObject) -> Result<DecodedImage, Undecodable> {
    if image.image_mask {
        return Err(Undecodable::StencilMask);
    }

    match ImageEncoding::classify(image) {
        ImageEncoding::Jpeg => {
            let leading = &image.filters[..image.filters.len() - 1];
            let jpeg = apply_filters(&image.data, leading)?;
            let img = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?;
            Ok(DecodedImage::new(img))
        }
        ImageEncoding::Rgb8 => {
            let data = image.decoded_samples()?;
            let expected = image.pixel_count()?.saturating_mul(3);
            ensure_len(&data, expected)?;
            let img = RgbImage::from_raw(image.width, image.height, data[..expected].to_vec())
                .ok_or(Undecodable::ShortData {
                    expected,
                    actual: data.len(),
                })?;
            Ok(DecodedImage::new(DynamicImage::ImageRgb8(img)))
        }
        ImageEncoding::Gray8 => {
            let data = image.decoded_samples()?;
            let expected = image.pixel_count()?;
            ensure_len(&data, expected)?;
            let img = GrayImage::from_raw(image.width, image.height, data[..expected].to_vec())
                .ok_or(Undecodable::ShortData {
                    expected,
                    actual: data.len(),
                })?;
            Ok(DecodedImage::new(DynamicImage::ImageLuma8(img)))
        }
        ImageEncoding::Generic => {
            let data = image.decoded_samples()?;
            decode_generic(image, &data)
        }
    }
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), Undecodable> {
    if data.len() < expected {
        Err(Undecodable::ShortData {
            expected,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Decode through the general PDF image model: any supported depth,
/// palettes, and CMYK.
fn decode_generic(image: &ImageObject, data: &[u8]) -> Result<DecodedImage, Undecodable> {
    let bpc = image.bits_per_component;
    if !matches!(bpc, 1 | 2 | 4 | 8 | 16) {
        return Err(Undecodable::UnsupportedDepth(bpc));
    }
    let (width, height) = (image.width, image.height);

    match &image.color_space {
        ColorSpace::Indexed {
            base,
            hival,
            lookup,
        } => {
            if bpc == 16 {
                return Err(Undecodable::UnsupportedDepth(bpc));
            }
            let base_components = match base.as_ref() {
                ColorSpace::DeviceGray => 1,
                ColorSpace::DeviceRgb => 3,
                ColorSpace::DeviceCmyk => 4,
                other => return Err(Undecodable::UnsupportedColorSpace(other.describe())),
            };
            let indices = unpack_samples(data, width, height, 1, bpc, false)?;
            let entries = (*hival as usize + 1) * base_components;
            ensure_len(lookup, entries)?;

            let mut pixels = Vec::with_capacity(indices.len() * base_components);
            for &index in &indices {
                let start = (index.min(*hival) as usize) * base_components;
                pixels.extend_from_slice(&lookup[start..start + base_components]);
            }
            samples_to_image(width, height, base_components, pixels)
        }
        ColorSpace::Other(name) => Err(Undecodable::UnsupportedColorSpace(name.clone())),
        color_space => {
            let components = color_space
                .components()
                .ok_or_else(|| Undecodable::UnsupportedColorSpace(color_space.describe()))?;
            let mut samples = unpack_samples(data, width, height, components, bpc, true)?;
            if let Some(decode) = &image.decode {
                apply_decode_array(&mut samples, components, decode);
            }
            samples_to_image(width, height, components, samples)
        }
    }
}

fn samples_to_image(
    width: u32,
    height: u32,
    components: usize,
    samples: Vec<u8>,
) -> Result<DecodedImage, Undecodable> {
    let actual = samples.len();
    let short = || Undecodable::ShortData {
        expected: (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(components.min(3)),
        actual,
    };
    let img = match components {
        1 => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, samples).ok_or_else(short)?,
        ),
        3 => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, samples).ok_or_else(short)?,
        ),
        4 => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, cmyk_to_rgb(&samples)).ok_or_else(short)?,
        ),
        n => return Err(Undecodable::UnsupportedColorSpace(format!("{n} components"))),
    };
    Ok(DecodedImage::new(img))
}

/// Split byte-aligned rows into one byte per sample.
///
/// With `normalize` set, samples are stretched to the 0-255 range;
/// otherwise the raw values are kept (palette indices).
fn unpack_samples(
    data: &[u8],
    width: u32,
    height: u32,
    components: usize,
    bpc: u8,
    normalize: bool,
) -> Result<Vec<u8>, Undecodable> {
    let too_large = || Undecodable::TooLarge { width, height };
    let samples_per_row = (width as usize)
        .checked_mul(components)
        .ok_or_else(too_large)?;
    let row_bytes = samples_per_row
        .checked_mul(bpc as usize)
        .ok_or_else(too_large)?
        .div_ceil(8);
    let expected = row_bytes
        .checked_mul(height as usize)
        .ok_or_else(too_large)?;
    ensure_len(data, expected)?;

    let mut out = Vec::with_capacity(samples_per_row * height as usize);
    for row in data.chunks_exact(row_bytes).take(height as usize) {
        match bpc {
            8 => out.extend_from_slice(&row[..samples_per_row]),
            16 => out.extend(row.chunks_exact(2).take(samples_per_row).map(|pair| pair[0])),
            _ => {
                let mask = (1u16 << bpc) - 1;
                for i in 0..samples_per_row {
                    let bit = i * bpc as usize;
                    let shift = 8 - bpc as usize - (bit % 8);
                    let value = (u16::from(row[bit / 8]) >> shift) & mask;
                    let value = if normalize { value * 255 / mask } else { value };
                    out.push(value as u8);
                }
            }
        }
    }
    Ok(out)
}

fn apply_decode_array(samples: &mut [u8], components: usize, decode: &[f32]) {
    if decode.len() < components * 2 {
        return;
    }
    for pixel in samples.chunks_exact_mut(components) {
        for (c, sample) in pixel.iter_mut().enumerate() {
            let (dmin, dmax) = (decode[2 * c], decode[2 * c + 1]);
            let value = dmin + f32::from(*sample) / 255.0 * (dmax - dmin);
            *sample = (value * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn cmyk_to_rgb(samples: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(samples.len() / 4 * 3);
    for chunk in samples.chunks_exact(4) {
        let c = chunk[0] as f32 / 255.0;
        let m = chunk[1] as f32 / 255.0;
        let y = chunk[2] as f32 / 255.0;
        let k = chunk[3] as f32 / 255.0;

        rgb.push(((1.0 - c) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - m) * (1.0 - k) * 255.0) as u8);
        rgb.push(((1.0 - y) * (1.0 - k) * 255.0) as u8);
    }
    rgb
}

/// Decode any stream whose filters are all non-image filters.
fn decode_stream_data(stream: &Stream, doc: &Document) -> Result<Vec<u8>, Undecodable> {
    apply_filters(&stream.content, &parse_filters(&stream.dict, doc))
}

fn parse_filters(dict: &Dictionary, doc: &Document) -> Vec<Filter> {
    let names: Vec<&[u8]> = match dict.get(b"Filter").map(|f| resolve(doc, f)) {
        Ok(Object::Name(n)) => vec![n.as_slice()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match resolve(doc, f) {
                Object::Name(n) => Some(n.as_slice()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let params: Vec<Option<&Dictionary>> = match dict.get(b"DecodeParms").map(|p| resolve(doc, p))
    {
        Ok(Object::Dictionary(d)) => vec![Some(d)],
        Ok(Object::Array(arr)) => arr
            .iter()
            .map(|p| match resolve(doc, p) {
                Object::Dictionary(d) => Some(d),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    names
        .iter()
        .enumerate()
        .map(|(i, name)| Filter::from_name(name, params.get(i).copied().flatten()))
        .collect()
}

fn parse_predictor_params(params: Option<&Dictionary>) -> PredictorParams {
    let defaults = PredictorParams::default();
    let Some(params) = params else {
        return defaults;
    };
    let get = |key: &[u8]| match params.get(key) {
        Ok(Object::Integer(n)) => Some(*n),
        _ => None,
    };
    PredictorParams {
        predictor: get(b"Predictor").unwrap_or(defaults.predictor),
        colors: get(b"Colors").map_or(defaults.colors, |n| n.max(1) as usize),
        bits_per_component: get(b"BitsPerComponent")
            .map_or(defaults.bits_per_component, |n| n.max(1) as usize),
        columns: get(b"Columns").map_or(defaults.columns, |n| n.max(1) as usize),
    }
}

fn parse_early_change(params: Option<&Dictionary>) -> bool {
    match params.map(|p| p.get(b"EarlyChange")) {
        Some(Ok(Object::Integer(n))) => *n != 0,
        _ => true,
    }
}

/// Run data through a chain of non-image filters.
fn apply_filters(data: &[u8], filters: &[Filter]) -> Result<Vec<u8>, Undecodable> {
    let mut current = data.to_vec();
    for filter in filters {
        current = match filter {
            Filter::Flate(predictor) => {
                let inflated = decompress_with_lopdf(current, "FlateDecode", None)?;
                unpredict(inflated, predictor, "FlateDecode")?
            }
            Filter::Lzw {
                predictor,
                early_change,
            } => {
                let params = dictionary! { "EarlyChange" => i64::from(*early_change) };
                let expanded = decompress_with_lopdf(current, "LZWDecode", Some(params))?;
                unpredict(expanded, predictor, "LZWDecode")?
            }
            Filter::Ascii85 => {
                let body = current.strip_prefix(b"<~").unwrap_or(&current[..]).to_vec();
                decompress_with_lopdf(body, "ASCII85Decode", None)?
            }
            Filter::AsciiHex => decode_ascii_hex(&current)?,
            Filter::RunLength => decode_run_length(&current)?,
            Filter::Dct | Filter::Other(_) => {
                return Err(Undecodable::UnsupportedFilter(filter.name().to_string()))
            }
        };
    }
    Ok(current)
}

/// Decode one filter stage with lopdf.
///
/// Predictors are never passed through; [`unpredict`] handles them with
/// bounds checks on `/Columns`.
fn decompress_with_lopdf(
    data: Vec<u8>,
    filter: &'static str,
    params: Option<Dictionary>,
) -> Result<Vec<u8>, Undecodable> {
    let mut dict = dictionary! { "Filter" => filter };
    if let Some(params) = params {
        dict.set("DecodeParms", params);
    }
    Stream::new(dict, data)
        .decompressed_content()
        .map_err(|e| Undecodable::FilterFailed {
            filter,
            message: e.to_string(),
        })
}

/// Undo a TIFF or PNG predictor applied before compressing.
fn unpredict(
    data: Vec<u8>,
    params: &PredictorParams,
    filter: &'static str,
) -> Result<Vec<u8>, Undecodable> {
    if params.predictor == 1 {
        return Ok(data);
    }

    let failed = |message: String| Undecodable::FilterFailed { filter, message };
    let row_len = params
        .colors
        .checked_mul(params.bits_per_component)
        .and_then(|bits_per_pixel| params.columns.checked_mul(bits_per_pixel))
        .map(|bits| bits.div_ceil(8))
        .ok_or_else(|| failed("predictor row size overflows".into()))?;
    if row_len == 0 || row_len > data.len() {
        return Err(failed(format!(
            "predictor row of {row_len} bytes does not fit {} bytes of data",
            data.len()
        )));
    }
    let bpp = (params.colors * params.bits_per_component).div_ceil(8).max(1);

    match params.predictor {
        2 => {
            if params.bits_per_component != 8 {
                return Err(Undecodable::UnsupportedPredictor(2));
            }
            let mut data = data;
            for row in data.chunks_mut(row_len) {
                for i in bpp..row.len() {
                    row[i] = row[i].wrapping_add(row[i - bpp]);
                }
            }
            Ok(data)
        }
        10..=15 => {
            let mut out = Vec::with_capacity(data.len());
            let mut prev = vec![0u8; row_len];
            for chunk in data.chunks(row_len + 1) {
                let (&tag, encoded) = match chunk.split_first() {
                    Some(split) => split,
                    None => break,
                };
                let mut row = encoded.to_vec();
                row.resize(row_len, 0);
                for i in 0..row_len {
                    let left = if i >= bpp { row[i - bpp] } else { 0 };
                    let up = prev[i];
                    let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
                    row[i] = match tag {
                        0 => row[i],
                        1 => row[i].wrapping_add(left),
                        2 => row[i].wrapping_add(up),
                        3 => row[i].wrapping_add(((u16::from(left) + u16::from(up)) / 2) as u8),
                        4 => row[i].wrapping_add(paeth(left, up, up_left)),
                        other => return Err(failed(format!("bad PNG row filter {other}"))),
                    };
                }
                out.extend_from_slice(&row);
                prev = row;
            }
            Ok(out)
        }
        other => Err(Undecodable::UnsupportedPredictor(other)),
    }
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = i16::from(a) + i16::from(b) - i16::from(c);
    let pa = (p - i16::from(a)).abs();
    let pb = (p - i16::from(b)).abs();
    let pc = (p - i16::from(c)).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn decode_ascii_hex(data: &[u8]) -> Result<Vec<u8>, Undecodable> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut pending: Option<u8> = None;
    for &byte in data {
        if byte == b'>' {
            break;
        }
        if byte.is_ascii_whitespace() {
            continue;
        }
        let nibble = (byte as char)
            .to_digit(16)
            .ok_or_else(|| Undecodable::FilterFailed {
                filter: "ASCIIHexDecode",
                message: format!("invalid character {:?}", byte as char),
            })? as u8;
        match pending.take() {
            Some(high) => out.push(high << 4 | nibble),
            None => pending = Some(nibble),
        }
    }
    if let Some(high) = pending {
        out.push(high << 4);
    }
    Ok(out)
}

fn decode_run_length(data: &[u8]) -> Result<Vec<u8>, Undecodable> {
    let truncated = || Undecodable::FilterFailed {
        filter: "RunLengthDecode",
        message: "unexpected end of data".into(),
    };
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut i = 0;
    while let Some(&length) = data.get(i) {
        i += 1;
        match length {
            128 => break,
            0..=127 => {
                let count = usize::from(length) + 1;
                let literal = data.get(i..i + count).ok_or_else(truncated)?;
                out.extend_from_slice(literal);
                i += count;
            }
            _ => {
                let byte = *data.get(i).ok_or_else(truncated)?;
                out.resize(out.len() + 257 - usize::from(length), byte);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match doc.dereference(obj) {
        Ok((_, resolved)) => resolved,
        Err(_) => obj,
    }
}

fn as_i64(doc: &Document, obj: &Object) -> Option<i64> {
    match resolve(doc, obj) {
        Object::Integer(n) => Some(*n),
        Object::Real(n) => Some(*n as i64),
        _ => None,
    }
}

fn as_f32(doc: &Document, obj: &Object) -> Option<f32> {
    match resolve(doc, obj) {
        Object::Integer(n) => Some(*n as f32),
        Object::Real(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use lopdf::StringFormat;
    use std::io::Write;

    fn raw_image(
        width: u32,
        height: u32,
        color_space: ColorSpace,
        bpc: u8,
        data: Vec<u8>,
    ) -> ImageObject {
        ImageObject {
            width,
            height,
            bits_per_component: bpc,
            color_space,
            filters: Vec::new(),
            decode: None,
            image_mask: false,
            data,
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_classify() {
        let mut image = raw_image(2, 2, ColorSpace::DeviceRgb, 8, Vec::new());
        assert_eq!(ImageEncoding::classify(&image), ImageEncoding::Rgb8);

        image.color_space = ColorSpace::DeviceGray;
        assert_eq!(ImageEncoding::classify(&image), ImageEncoding::Gray8);

        image.bits_per_component = 1;
        assert_eq!(ImageEncoding::classify(&image), ImageEncoding::Generic);

        image.filters = vec![Filter::Dct];
        assert_eq!(ImageEncoding::classify(&image), ImageEncoding::Jpeg);
    }

    #[test]
    fn test_decode_rgb8() {
        let data: Vec<u8> = (0..4 * 3 * 3).map(|i| i as u8).collect();
        let decoded = decode(&raw_image(4, 3, ColorSpace::DeviceRgb, 8, data)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
        assert_eq!(decoded.mode(), PixelMode::Rgb);
        assert_eq!(decoded.as_dynamic().to_rgb8().get_pixel(1, 0).0, [3, 4, 5]);
    }

    #[test]
    fn test_decode_rgb8_short_data() {
        let image = raw_image(4, 3, ColorSpace::DeviceRgb, 8, vec![0; 4 * 3 * 3 - 1]);
        match decode(&image) {
            Err(Undecodable::ShortData { expected, actual }) => {
                assert_eq!(expected, 36);
                assert_eq!(actual, 35);
            }
            other => panic!("expected ShortData, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_gray8_flate() {
        let pixels: Vec<u8> = (0..16).map(|i| i * 16).collect();
        let mut image = raw_image(4, 4, ColorSpace::DeviceGray, 8, deflate(&pixels));
        image.filters = vec![Filter::Flate(PredictorParams::default())];
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.mode(), PixelMode::Gray);
        assert_eq!(decoded.channels(), 1);
        assert_eq!(decoded.as_dynamic().to_luma8().into_raw(), pixels);
    }

    #[test]
    fn test_decode_png_predictor() {
        // Two rows of 3 gray pixels, row filters Sub and Up.
        let encoded = [1, 10, 5, 5, 2, 1, 1, 1];
        let params = PredictorParams {
            predictor: 15,
            colors: 1,
            bits_per_component: 8,
            columns: 3,
        };
        let mut image = raw_image(3, 2, ColorSpace::DeviceGray, 8, deflate(&encoded));
        image.filters = vec![Filter::Flate(params)];
        let decoded = decode(&image).unwrap();
        assert_eq!(
            decoded.as_dynamic().to_luma8().into_raw(),
            vec![10, 15, 20, 11, 16, 21]
        );
    }

    #[test]
    fn test_decode_one_bit_gray() {
        // Width 10 means each row is padded to 2 bytes.
        let data = vec![0b1010_1010, 0b1100_0000, 0b0000_0000, 0b0100_0000];
        let decoded = decode(&raw_image(10, 2, ColorSpace::DeviceGray, 1, data)).unwrap();
        let gray = decoded.as_dynamic().to_luma8();
        assert_eq!(gray.get_pixel(0, 0).0, [255]);
        assert_eq!(gray.get_pixel(1, 0).0, [0]);
        assert_eq!(gray.get_pixel(8, 0).0, [255]);
        assert_eq!(gray.get_pixel(9, 0).0, [255]);
        assert_eq!(gray.get_pixel(9, 1).0, [255]);
        assert_eq!(gray.get_pixel(8, 1).0, [0]);
    }

    #[test]
    fn test_decode_array_inverts_gray() {
        let mut image = raw_image(2, 1, ColorSpace::DeviceGray, 8, vec![0, 255]);
        image.decode = Some(vec![1.0, 0.0]);
        assert_eq!(ImageEncoding::classify(&image), ImageEncoding::Generic);
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.as_dynamic().to_luma8().into_raw(), vec![255, 0]);
    }

    #[test]
    fn test_decode_indexed_rgb() {
        let palette = ColorSpace::Indexed {
            base: Box::new(ColorSpace::DeviceRgb),
            hival: 1,
            lookup: vec![255, 0, 0, 0, 0, 255],
        };
        let decoded = decode(&raw_image(3, 1, palette, 8, vec![0, 1, 0])).unwrap();
        assert_eq!(decoded.mode(), PixelMode::Rgb);
        let rgb = decoded.as_dynamic().to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_decode_cmyk() {
        let image = raw_image(1, 1, ColorSpace::DeviceCmyk, 8, vec![0, 255, 255, 0]);
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.as_dynamic().to_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_unsupported_color_space() {
        let image = raw_image(1, 1, ColorSpace::Other("Lab".into()), 8, vec![0; 3]);
        assert!(matches!(
            decode(&image),
            Err(Undecodable::UnsupportedColorSpace(name)) if name == "Lab"
        ));
    }

    #[test]
    fn test_unsupported_filter() {
        let mut image = raw_image(1, 1, ColorSpace::DeviceGray, 8, vec![0]);
        image.filters = vec![Filter::Other("JBIG2Decode".into())];
        assert!(matches!(decode(&image), Err(Undecodable::UnsupportedFilter(_))));
    }

    #[test]
    fn test_stencil_mask_is_skipped() {
        let mut image = raw_image(8, 1, ColorSpace::DeviceGray, 1, vec![0xff]);
        image.image_mask = true;
        assert!(matches!(decode(&image), Err(Undecodable::StencilMask)));
    }

    /// LZW stream of 9-bit literal codes between a clear and an EOD code.
    fn lzw_literals(data: &[u8]) -> Vec<u8> {
        let codes = std::iter::once(256u32)
            .chain(data.iter().map(|&b| u32::from(b)))
            .chain(std::iter::once(257));
        let mut out = Vec::new();
        let (mut acc, mut bits) = (0u32, 0u32);
        for code in codes {
            acc = (acc << 9) | code;
            bits += 9;
            while bits >= 8 {
                bits -= 8;
                out.push((acc >> bits) as u8);
            }
            acc &= (1 << bits) - 1;
        }
        if bits > 0 {
            out.push((acc << (8 - bits)) as u8);
        }
        out
    }

    #[test]
    fn test_ascii_filters() {
        assert_eq!(decode_ascii_hex(b"48 65 6c6C 6f>").unwrap(), b"Hello");
        assert_eq!(decode_ascii_hex(b"7>").unwrap(), vec![0x70]);
        assert!(decode_ascii_hex(b"zz>").is_err());

        let a85 = [Filter::Ascii85];
        assert_eq!(apply_filters(b"87cURDZ~>", &a85).unwrap(), b"Hello");
        assert_eq!(apply_filters(b"<~87cURDZ~>", &a85).unwrap(), b"Hello");
        assert_eq!(apply_filters(b"z~>", &a85).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_run_length() {
        // Literal run of 3, then 4 repeats of 0x07, then EOD.
        let encoded = [2, 1, 2, 3, 253, 7, 128, 99];
        assert_eq!(decode_run_length(&encoded).unwrap(), vec![1, 2, 3, 7, 7, 7, 7]);
        assert!(decode_run_length(&[5, 1, 2]).is_err());
        assert!(decode_run_length(&[200]).is_err());
    }

    #[test]
    fn test_decode_run_length_image() {
        let mut image = raw_image(4, 2, ColorSpace::DeviceGray, 8, vec![253, 9, 252, 200]);
        image.filters = vec![Filter::RunLength];
        let decoded = decode(&image).unwrap();
        assert_eq!(
            decoded.as_dynamic().to_luma8().into_raw(),
            vec![9, 9, 9, 9, 200, 200, 200, 200]
        );
    }

    #[test]
    fn test_decode_lzw_image() {
        let pixels: Vec<u8> = (0..4 * 4 * 3).map(|i| (i * 5) as u8).collect();
        let stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 4,
                "Height" => 4,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "LZWDecode",
            },
            lzw_literals(&pixels),
        );
        let doc = Document::with_version("1.5");
        let image = ImageObject::from_stream(&stream, &doc);
        assert!(matches!(
            image.filters.as_slice(),
            [Filter::Lzw {
                early_change: true,
                ..
            }]
        ));
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.as_dynamic().to_rgb8().into_raw(), pixels);
    }

    #[test]
    fn test_oversized_predictor_columns_are_rejected() {
        for columns in [1usize << 61, (1usize << 60) + 1] {
            let params = PredictorParams {
                predictor: 15,
                colors: 1,
                bits_per_component: 8,
                columns,
            };
            let mut image = raw_image(1, 1, ColorSpace::DeviceGray, 8, deflate(&[0, 7]));
            image.filters = vec![Filter::Flate(params)];
            assert!(
                matches!(decode(&image), Err(Undecodable::FilterFailed { .. })),
                "columns {columns}"
            );
        }
    }

    #[test]
    fn test_tiff_predictor() {
        let params = PredictorParams {
            predictor: 2,
            colors: 1,
            bits_per_component: 8,
            columns: 3,
        };
        let mut image = raw_image(3, 1, ColorSpace::DeviceGray, 8, deflate(&[10, 5, 5]));
        image.filters = vec![Filter::Flate(params)];
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.as_dynamic().to_luma8().into_raw(), vec![10, 15, 20]);
    }

    #[test]
    fn test_unpack_two_and_four_bit_samples() {
        let two_bit = unpack_samples(&[0b00_01_10_11], 4, 1, 1, 2, true).unwrap();
        assert_eq!(two_bit, vec![0, 85, 170, 255]);

        // Width 3 pads each 4-bit row to 2 bytes.
        let four_bit = unpack_samples(&[0x0F, 0xA0, 0x50, 0x00], 3, 2, 1, 4, true).unwrap();
        assert_eq!(four_bit, vec![0, 255, 170, 85, 0, 0]);

        let indices = unpack_samples(&[0x0F, 0xA0], 3, 1, 1, 4, false).unwrap();
        assert_eq!(indices, vec![0, 15, 10]);
    }

    #[test]
    fn test_unpack_sixteen_bit_keeps_high_byte() {
        let samples = unpack_samples(&[0x12, 0x34, 0xAB, 0xCD], 2, 1, 1, 16, true).unwrap();
        assert_eq!(samples, vec![0x12, 0xAB]);

        let image = raw_image(1, 1, ColorSpace::DeviceRgb, 16, vec![0xFF, 0, 0x80, 0x01, 0, 0xFF]);
        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.as_dynamic().to_rgb8().get_pixel(0, 0).0, [0xFF, 0x80, 0]);
    }

    #[test]
    fn test_from_stream_reads_indexed_lookup_stream() {
        let mut doc = Document::with_version("1.5");
        let lookup = doc.add_object(Stream::new(
            dictionary! { "Filter" => "FlateDecode" },
            deflate(&[255, 0, 0, 0, 128, 0]),
        ));
        let stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 1,
                "BitsPerComponent" => 8,
                "ColorSpace" => vec![
                    Object::Name(b"Indexed".to_vec()),
                    Object::Name(b"DeviceRGB".to_vec()),
                    Object::Integer(1),
                    Object::Reference(lookup),
                ],
            },
            vec![1, 0],
        );

        let image = ImageObject::from_stream(&stream, &doc);
        assert!(matches!(
            &image.color_space,
            ColorSpace::Indexed { hival: 1, lookup, .. } if lookup.len() == 6
        ));
        let rgb = decode(&image).unwrap().as_dynamic().to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 128, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_from_stream_reads_indexed_color_space() {
        let mut doc = Document::with_version("1.5");
        let dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 2,
            "Height" => 1,
            "BitsPerComponent" => 8,
            "ColorSpace" => vec![
                Object::Name(b"Indexed".to_vec()),
                Object::Name(b"DeviceGray".to_vec()),
                Object::Integer(1),
                Object::String(vec![0, 200], StringFormat::Hexadecimal),
            ],
            "Filter" => "FlateDecode",
        };
        let id = doc.add_object(Stream::new(dict, deflate(&[1, 0])));
        let Ok(Object::Stream(stream)) = doc.get_object(id) else {
            panic!("missing stream");
        };

        let image = ImageObject::from_stream(stream, &doc);
        assert_eq!((image.width, image.height), (2, 1));
        assert!(matches!(image.color_space, ColorSpace::Indexed { hival: 1, .. }));
        assert_eq!(image.filters, vec![Filter::Flate(PredictorParams::default())]);

        let decoded = decode(&image).unwrap();
        assert_eq!(decoded.mode(), PixelMode::Gray);
        assert_eq!(decoded.as_dynamic().to_luma8().into_raw(), vec![200, 0]);
    }

    #[test]
    fn test_from_stream_missing_dimensions() {
        let doc = Document::with_version("1.5");
        let stream = Stream::new(dictionary! { "Subtype" => "Image", "Width" => 0 }, Vec::new());
        assert!(ImageObject::from_stream(&stream, &doc).is_empty());
    }
}
