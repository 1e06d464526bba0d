//! Rasterization of note files into PNG pages.
//!
//! The importer hands over a [`Source`]; this module returns a
//! [`ConvertedNote`] whose pages are PNG buffers no wider than the configured
//! limit.
//!
//! | Format | Pages | Page numbers |
//! |--------|-------|--------------|
//! | image | the image itself | 1 |
//! | pdf | the largest embedded raster of each page (scanned notes) | PDF page numbers; pages without a raster leave gaps |
//! | notebook | PNG/JPEG page images inside a zip bundle, in name order | 1..n |
//!
//! A file that cannot be converted yields `None`; the importer skips it.

use std::io::{Cursor, Read};

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, ImageOutputFormat, RgbImage};
use lopdf::{Document, Object, ObjectId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ConvertedNote, Page, Source, SourceFormat};

/// Maximum decompressed bytes to read from a single zip entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum pages taken from a single notebook bundle.
const MAX_NOTEBOOK_PAGES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    pub max_width: u32,
    pub dpi: u32,
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("PDF conversion failed: {0}")]
    Pdf(String),
    #[error("notebook conversion failed: {0}")]
    Notebook(String),
}

impl From<lopdf::Error> for ConvertError {
    fn from(e: lopdf::Error) -> Self {
        ConvertError::Pdf(e.to_string())
    }
}

/// One decoded page before scaling.
struct Raster {
    number: u32,
    image: DynamicImage,
    /// Width limit on top of [`ConvertOptions::max_width`].
    bound: u32,
}

#[async_trait]
pub trait NoteConverter: Send + Sync {
    /// Rasterize `source`. `None` means "skip this job".
    async fn convert(&self, source: &Source, options: ConvertOptions) -> Option<ConvertedNote>;
}

/// Converter backed by the `image`, `lopdf`, and `zip` crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterConverter;

#[async_trait]
impl NoteConverter for RasterConverter {
    async fn convert(&self, source: &Source, options: ConvertOptions) -> Option<ConvertedNote> {
        let bytes = match tokio::fs::read(&source.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %source.path.display(), error = %e, "cannot read source");
                return None;
            }
        };

        let owned = source.clone();
        let result =
            tokio::task::spawn_blocking(move || convert_bytes(&owned, &bytes, options)).await;

        match result {
            Ok(Ok(pages)) if !pages.is_empty() => {
                debug!(path = %source.path.display(), pages = pages.len(), "converted");
                Some(ConvertedNote {
                    source: source.clone(),
                    pages,
                })
            }
            Ok(Ok(_)) => {
                warn!(path = %source.path.display(), "no pages could be extracted");
                None
            }
            Ok(Err(e)) => {
                warn!(path = %source.path.display(), error = %e, "conversion failed");
                None
            }
            Err(e) => {
                warn!(path = %source.path.display(), error = %e, "conversion task failed");
                None
            }
        }
    }
}

pub fn convert_bytes(
    source: &Source,
    bytes: &[u8],
    options: ConvertOptions,
) -> Result<Vec<Page>, ConvertError> {
    let rasters = match source.format {
        SourceFormat::Image => vec![Raster {
            number: 1,
            image: image::load_from_memory(bytes)?,
            bound: u32::MAX,
        }],
        SourceFormat::Pdf => pdf_images(bytes, options)?,
        SourceFormat::Notebook => notebook_images(bytes)?,
    };

    rasters
        .into_iter()
        .map(|raster| {
            let (png, width, height) =
                encode_png_scaled(raster.image, raster.bound.min(options.max_width))?;
            Ok(Page {
                number: raster.number,
                file_name: page_file_name(&source.basename, raster.number),
                width,
                height,
                png,
            })
        })
        .collect()
}

pub fn page_file_name(stem: &str, number: u32) -> String {
    format!("{}-p{}.png", stem, number)
}

/// Downscale to `max_width` (keeping the aspect ratio) and encode as PNG.
pub fn encode_png_scaled(
    img: DynamicImage,
    max_width: u32,
) -> Result<(Vec<u8>, u32, u32), ConvertError> {
    let img = if img.width() > max_width {
        img.resize(max_width, u32::MAX, FilterType::Lanczos3)
    } else {
        img
    };
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)?;
    Ok((out, img.width(), img.height()))
}

/// Re-encode a PNG page no wider than `max_width`; narrower pages are returned as-is.
pub fn png_scaled_to_width(png: &[u8], max_width: u32) -> Result<Vec<u8>, ConvertError> {
    let img = image::load_from_memory_with_format(png, ImageFormat::Png)?;
    if img.width() <= max_width {
        return Ok(png.to_vec());
    }
    encode_png_scaled(img, max_width).map(|(bytes, _, _)| bytes)
}

// ============ PDF ============

fn pdf_images(bytes: &[u8], options: ConvertOptions) -> Result<Vec<Raster>, ConvertError> {
    let doc = Document::load_mem(bytes)?;
    let mut out = Vec::new();

    for (number, page_id) in doc.get_pages() {
        // lopdf reports a page without XObject resources as an error.
        let images = match doc.get_page_images(page_id) {
            Ok(images) => images,
            Err(e) => {
                debug!(page = number, error = %e, "PDF page has no image resources");
                Vec::new()
            }
        };
        let Some(largest) = images.iter().max_by_key(|img| img.width * img.height) else {
            debug!(page = number, "PDF page has no raster image");
            continue;
        };

        let decoded = decode_pdf_image(
            &doc,
            largest.id,
            largest.width,
            largest.height,
            largest.filters.as_deref().unwrap_or(&[]),
            largest.color_space.as_deref(),
            largest.bits_per_component,
            largest.content,
        );
        match decoded {
            Ok(image) => out.push(Raster {
                number,
                image,
                bound: page_width_at_dpi(&doc, page_id, options.dpi).unwrap_or(u32::MAX),
            }),
            Err(e) => warn!(page = number, error = %e, "skipping undecodable PDF page image"),
        }
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn decode_pdf_image(
    doc: &Document,
    id: ObjectId,
    width: i64,
    height: i64,
    filters: &[String],
    color_space: Option<&str>,
    bits_per_component: Option<i64>,
    content: &[u8],
) -> Result<DynamicImage, ConvertError> {
    if filters.iter().any(|f| f == "DCTDecode") {
        return Ok(image::load_from_memory_with_format(
            content,
            ImageFormat::Jpeg,
        )?);
    }
    if filters.iter().any(|f| f != "FlateDecode") {
        return Err(ConvertError::Pdf(format!(
            "unsupported image filters {:?}",
            filters
        )));
    }
    if bits_per_component.unwrap_or(8) != 8 {
        return Err(ConvertError::Pdf("only 8-bit page images are supported".into()));
    }

    let raw = if filters.is_empty() {
        content.to_vec()
    } else {
        doc.get_object(id)?.as_stream()?.decompressed_content()?
    };
    let (w, h) = (width.max(0) as u32, height.max(0) as u32);

    let img = match color_space {
        Some("DeviceGray") => GrayImage::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        Some("DeviceRGB") | None => RgbImage::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        Some(other) => {
            return Err(ConvertError::Pdf(format!(
                "unsupported color space {}",
                other
            )))
        }
    };
    img.ok_or_else(|| ConvertError::Pdf("image data shorter than its dimensions".into()))
}

/// Width in pixels of the page's MediaBox rendered at `dpi`.
fn page_width_at_dpi(doc: &Document, page_id: ObjectId, dpi: u32) -> Option<u32> {
    let page = doc.get_dictionary(page_id).ok()?;
    let media_box = page.get(b"MediaBox").ok()?.as_array().ok()?;
    if media_box.len() != 4 {
        return None;
    }
    let x0 = pdf_number(&media_box[0])?;
    let x1 = pdf_number(&media_box[2])?;
    let points = (x1 - x0).abs();
    Some(((points / 72.0) * dpi as f32).round().max(1.0) as u32)
}

fn pdf_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

// ============ Notebook bundles ============

fn notebook_images(bytes: &[u8]) -> Result<Vec<Raster>, ConvertError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ConvertError::Notebook(e.to_string()))?;

    let mut names: Vec<String> = archive
        .file_names()
        .filter(|name| is_page_image(name))
        .map(|name| name.to_string())
        .collect();
    names.sort();
    names.truncate(MAX_NOTEBOOK_PAGES);

    let mut out = Vec::with_capacity(names.len());
    for name in &names {
        let data = read_zip_entry_bounded(&mut archive, name, MAX_ENTRY_BYTES)?;
        match image::load_from_memory(&data) {
            Ok(image) => out.push(Raster {
                number: out.len() as u32 + 1,
                image,
                bound: u32::MAX,
            }),
            Err(e) => warn!(entry = %name, error = %e, "skipping undecodable notebook page"),
        }
    }
    Ok(out)
}

fn is_page_image(name: &str) -> bool {
    if name.ends_with('/') {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg")
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ConvertError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ConvertError::Notebook(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ConvertError::Notebook(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ConvertError::Notebook(format!(
            "zip entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}
