//! In-process document rewriting.
//!
//! Walks every page's `/XObject` resources (and those of nested Form
//! XObjects), recompresses each image stream once, and stores the result
//! under the original object id so all referencing pages pick it up.

use lopdf::{Dictionary, Document, Object, ObjectId, SaveOptions};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::decode::{self, ImageObject, Undecodable};
use crate::error::CompressError;
use crate::output;
use crate::recompress::{self, RecompressError};
use crate::scale;
use crate::CompressOptions;

/// Resource inheritance through `/Parent` is followed at most this deep.
const MAX_PAGE_TREE_DEPTH: usize = 64;

/// Counts from one rewrite pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub pages: usize,
    /// Distinct image XObjects reachable from pages
    pub images_found: usize,
    pub compressed: usize,
    /// Compressed images that were also resized
    pub downscaled: usize,
    pub skipped_empty: usize,
    pub skipped_undecodable: usize,
    pub skipped_failed: usize,
    /// Encoded size of the compressed images before and after
    pub bytes_before: usize,
    pub bytes_after: usize,
}

impl RewriteReport {
    pub fn skipped(&self) -> usize {
        self.skipped_empty + self.skipped_undecodable + self.skipped_failed
    }
}

/// An image XObject reached from a page's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub page: u32,
    pub name: String,
    pub id: ObjectId,
}

/// What happened to a single image.
#[derive(Debug)]
enum ImageOutcome {
    Compressed {
        before: usize,
        after: usize,
        downscaled: bool,
    },
    Empty,
    NotAStream,
    Undecodable(Undecodable),
    Failed(RecompressError),
}

/// Owns a document for the duration of one rewrite.
pub struct Rewriter {
    doc: Document,
    options: CompressOptions,
}

impl Rewriter {
    pub fn open(path: &Path, options: CompressOptions) -> Result<Self, CompressError> {
        let doc = Document::load(path)
            .map_err(|e| CompressError::Load(format!("{}: {}", path.display(), e)))?;
        Self::new(doc, options)
    }

    pub fn from_bytes(bytes: &[u8], options: CompressOptions) -> Result<Self, CompressError> {
        let doc = Document::load_mem(bytes).map_err(|e| CompressError::Load(e.to_string()))?;
        Self::new(doc, options)
    }

    pub fn new(doc: Document, options: CompressOptions) -> Result<Self, CompressError> {
        if doc.trailer.get(b"Encrypt").is_ok() {
            return Err(CompressError::Encrypted);
        }
        Ok(Self { doc, options })
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Recompress every image reachable from the page tree.
    ///
    /// Per-image failures are counted, never returned.
    pub fn rewrite_images(&mut self) -> RewriteReport {
        let mut report = RewriteReport {
            pages: self.doc.get_pages().len(),
            ..Default::default()
        };

        let refs = find_images(&self.doc);
        let mut seen = HashSet::new();
        let ids: Vec<ObjectId> = refs
            .iter()
            .filter(|r| seen.insert(r.id))
            .map(|r| r.id)
            .collect();
        report.images_found = ids.len();
        log::info!(
            "found {} image XObjects across {} pages",
            ids.len(),
            report.pages
        );

        for id in ids {
            match self.rewrite_image(id) {
                ImageOutcome::Compressed {
                    before,
                    after,
                    downscaled,
                } => {
                    report.compressed += 1;
                    report.bytes_before += before;
                    report.bytes_after += after;
                    if downscaled {
                        report.downscaled += 1;
                    }
                }
                ImageOutcome::Empty => {
                    log::debug!("image {:?}: zero width or height, skipped", id);
                    report.skipped_empty += 1;
                }
                ImageOutcome::NotAStream => {
                    log::info!("image {:?}: not a stream object, skipped", id);
                    report.skipped_undecodable += 1;
                }
                ImageOutcome::Undecodable(reason) => {
                    log::info!("image {:?}: skipped, {}", id, reason);
                    report.skipped_undecodable += 1;
                }
                ImageOutcome::Failed(e) => {
                    log::warn!("image {:?}: {}", id, e);
                    report.skipped_failed += 1;
                }
            }
        }

        report
    }

    /// Decode, scale, recompress and substitute one image.
    fn rewrite_image(&mut self, id: ObjectId) -> ImageOutcome {
        let preset = self.options.preset;

        let (image, kept) = match self.doc.get_object(id) {
            Ok(Object::Stream(stream)) => (
                ImageObject::from_stream(stream, &self.doc),
                kept_entries(&stream.dict),
            ),
            _ => return ImageOutcome::NotAStream,
        };
        if image.is_empty() {
            return ImageOutcome::Empty;
        }
        let before = image.data.len();

        let decoded = match decode::decode(&image) {
            Ok(decoded) => decoded,
            Err(reason) => return ImageOutcome::Undecodable(reason),
        };
        drop(image);

        let factor = scale::scale_factor(decoded.width(), decoded.height(), preset.target_dpi);
        let source_dims = (decoded.width(), decoded.height());
        log::debug!(
            "image {:?}: {}x{} px, ~{:.0} dpi, scale {:.3}",
            id,
            source_dims.0,
            source_dims.1,
            scale::effective_dpi(source_dims.0, source_dims.1),
            factor
        );

        let compressed = match recompress::recompress(decoded, factor, preset.jpeg_quality) {
            Ok(compressed) => compressed,
            Err(e) => return ImageOutcome::Failed(e),
        };
        let downscaled = (compressed.width, compressed.height) != source_dims;
        let after = compressed.data.len();

        let mut stream = compressed.into_stream();
        for (key, value) in kept {
            stream.dict.set(key, value);
        }
        self.doc.objects.insert(id, Object::Stream(stream));

        ImageOutcome::Compressed {
            before,
            after,
            downscaled,
        }
    }

    /// Serialize the document into `writer`.
    pub fn save_to<W: Write>(&mut self, writer: &mut W) -> Result<(), CompressError> {
        if self.options.compress_streams {
            self.doc.compress();
        }

        if self.options.object_streams {
            let below_1_5 = self.doc.version.parse::<f32>().map_or(true, |v| v < 1.5);
            if below_1_5 {
                self.doc.version = "1.5".to_string();
            }
            let save_options = SaveOptions::builder()
                .use_object_streams(true)
                .use_xref_streams(true)
                .build();
            self.doc
                .save_with_options(writer, save_options)
                .map_err(|e| CompressError::Save(e.to_string()))
        } else {
            self.doc
                .save_to(writer)
                .map_err(|e| CompressError::Save(e.to_string()))
        }
    }

    /// Serialize the document to `path`, replacing it only on success.
    pub fn save(mut self, path: &Path) -> Result<(), CompressError> {
        let staged = output::staging_path(path)?;
        {
            let mut writer = BufWriter::new(File::create(&staged)?);
            self.save_to(&mut writer)?;
            writer.flush()?;
        }
        output::persist(staged, path)?;
        Ok(())
    }
}

/// Dictionary entries of the original image that stay valid after
/// re-encoding.
fn kept_entries(dict: &Dictionary) -> Vec<(Vec<u8>, Object)> {
    let mut kept = Vec::new();
    if let Ok(smask @ Object::Reference(_)) = dict.get(b"SMask") {
        kept.push((b"SMask".to_vec(), smask.clone()));
    }
    if let Ok(mask @ Object::Reference(_)) = dict.get(b"Mask") {
        kept.push((b"Mask".to_vec(), mask.clone()));
    }
    for key in [b"Interpolate".as_slice(), b"Intent".as_slice()] {
        if let Ok(value) = dict.get(key) {
            kept.push((key.to_vec(), value.clone()));
        }
    }
    kept
}

/// List every image XObject reference in page order.
///
/// Images inside Form XObjects are attributed to the first page that
/// reaches the form.
pub fn find_images(doc: &Document) -> Vec<ImageRef> {
    let mut found = Vec::new();
    let mut visited_forms = HashSet::new();

    for (page_num, page_id) in doc.get_pages() {
        let Ok(Object::Dictionary(page)) = doc.get_object(page_id) else {
            continue;
        };
        if let Some(resources) = page_resources(doc, page) {
            collect_images(doc, resources, page_num, &mut visited_forms, &mut found);
        }
    }

    found
}

/// Resources of a page, inherited from an ancestor when absent.
fn page_resources<'a>(doc: &'a Document, page: &'a Dictionary) -> Option<&'a Dictionary> {
    let mut node = page;
    for _ in 0..MAX_PAGE_TREE_DEPTH {
        if let Ok(resources) = node.get(b"Resources") {
            return match resolve(doc, resources) {
                Object::Dictionary(dict) => Some(dict),
                _ => None,
            };
        }
        node = match node.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => match doc.get_object(*parent_id) {
                Ok(Object::Dictionary(parent)) => parent,
                _ => return None,
            },
            _ => return None,
        };
    }
    None
}

fn collect_images(
    doc: &Document,
    resources: &Dictionary,
    page: u32,
    visited_forms: &mut HashSet<ObjectId>,
    found: &mut Vec<ImageRef>,
) {
    let xobjects = match resources.get(b"XObject").map(|x| resolve(doc, x)) {
        Ok(Object::Dictionary(dict)) => dict,
        _ => return,
    };

    for (name, value) in xobjects.iter() {
        let Object::Reference(id) = value else {
            continue;
        };
        let Ok(Object::Stream(stream)) = doc.get_object(*id) else {
            continue;
        };

        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(subtype)) if subtype == b"Image" => found.push(ImageRef {
                page,
                name: String::from_utf8_lossy(name).into_owned(),
                id: *id,
            }),
            Ok(Object::Name(subtype)) if subtype == b"Form" => {
                if !visited_forms.insert(*id) {
                    continue;
                }
                if let Ok(Object::Dictionary(form_resources)) =
                    stream.dict.get(b"Resources").map(|r| resolve(doc, r))
                {
                    collect_images(doc, form_resources, page, visited_forms, found);
                }
            }
            _ => {}
        }
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}
