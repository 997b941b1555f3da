//! Page rasterization for OCR.
//!
//! Renders every page of a PDF at the configured DPI with PDFium, then
//! normalizes it for legibility: grayscale, contrast, sharpness and
//! brightness, in that order. Enhancement factors follow the usual
//! "enhance" semantics: `1.0` leaves the page untouched, larger values
//! push each pixel further from a degenerate version of the page.

use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma, imageops};
use pdfium_render::prelude::*;
use tracing::{debug, info};

use crate::config::RasterConfig;
use crate::error::ProcessingError;

/// Points per inch in PDF user space
const POINTS_PER_INCH: f32 = 72.0;

/// Kernel of the classic SMOOTH filter used as the sharpness baseline
/// (normalized by its sum inside `filter3x3`)
const SMOOTH_KERNEL: [f32; 9] = [1.0, 1.0, 1.0, 1.0, 5.0, 1.0, 1.0, 1.0, 1.0];

/// One rendered and enhanced page of a document
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based page index within the document
    pub index: usize,
    pub image: GrayImage,
}

impl PageImage {
    /// Encode the page as PNG for providers that take image files
    pub fn to_png(&self) -> Result<Vec<u8>, ProcessingError> {
        let mut buffer = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| ProcessingError::Render {
                page: self.index + 1,
                message: format!("PNG encoding failed: {}", e),
            })?;
        Ok(buffer.into_inner())
    }
}

/// Turns document bytes into ordered page images
#[async_trait]
pub trait Rasterize: Send + Sync {
    async fn rasterize(&self, document: &[u8]) -> Result<Vec<PageImage>, ProcessingError>;
}

/// PDFium-backed rasterizer
pub struct PdfRasterizer {
    config: RasterConfig,
}

impl PdfRasterizer {
    pub fn new(config: RasterConfig) -> Self {
        info!(
            dpi = config.dpi,
            contrast = config.contrast,
            sharpness = config.sharpness,
            brightness = config.brightness,
            "Rasterizer initialized"
        );
        Self { config }
    }

    /// Cheap structural check before handing bytes to PDFium
    pub fn check_header(document: &[u8]) -> Result<(), ProcessingError> {
        if document.is_empty() {
            return Err(ProcessingError::MalformedDocument {
                reason: "file is empty".to_string(),
            });
        }
        if !document.starts_with(b"%PDF") {
            return Err(ProcessingError::MalformedDocument {
                reason: "missing %PDF header".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Rasterize for PdfRasterizer {
    async fn rasterize(&self, document: &[u8]) -> Result<Vec<PageImage>, ProcessingError> {
        Self::check_header(document)?;

        let config = self.config.clone();
        let bytes = document.to_vec();
        tokio::task::spawn_blocking(move || render_pages(&config, &bytes))
            .await
            .map_err(|e| ProcessingError::Task {
                message: e.to_string(),
            })?
    }
}

/// Create a new Pdfium instance (dynamically linked).
///
/// Searches for libpdfium in:
/// 1. The configured directory, if any
/// 2. Current directory (./libpdfium.so)
/// 3. vendor/pdfium/lib/
/// 4. System library paths
pub fn create_pdfium(configured: Option<&Path>) -> Result<Pdfium, ProcessingError> {
    let configured_bindings = configured
        .map(|dir| Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)));

    let bindings = match configured_bindings {
        Some(Ok(bindings)) => Ok(bindings),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                    "./vendor/pdfium/lib/",
                ))
            })
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| ProcessingError::PdfiumUnavailable {
        message: format!("{:?}", e),
    })?;

    Ok(Pdfium::new(bindings))
}

fn render_pages(config: &RasterConfig, bytes: &[u8]) -> Result<Vec<PageImage>, ProcessingError> {
    let pdfium = create_pdfium(config.pdfium_path.as_deref())?;

    let document = pdfium.load_pdf_from_byte_slice(bytes, None).map_err(|e| {
        ProcessingError::MalformedDocument {
            reason: format!("{:?}", e),
        }
    })?;

    let pages = document.pages();
    if pages.len() == 0 {
        return Err(ProcessingError::MalformedDocument {
            reason: "document has no pages".to_string(),
        });
    }

    let pixels_per_point = config.dpi as f32 / POINTS_PER_INCH;
    let mut rendered = Vec::with_capacity(pages.len() as usize);

    for (index, page) in pages.iter().enumerate() {
        let width = (page.width().value * pixels_per_point).ceil() as i32;
        let height = (page.height().value * pixels_per_point).ceil() as i32;

        debug!(page = index + 1, width, height, dpi = config.dpi, "Rendering page");

        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_target_height(height);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ProcessingError::Render {
                page: index + 1,
                message: format!("{:?}", e),
            })?;

        rendered.push(PageImage {
            index,
            image: prepare_page(bitmap.as_image(), config),
        });
    }

    info!(pages = rendered.len(), "Rasterized document");
    Ok(rendered)
}

/// Grayscale conversion followed by the enhancement chain
pub fn prepare_page(page: DynamicImage, config: &RasterConfig) -> GrayImage {
    let gray = page.to_luma8();
    let gray = enhance_contrast(&gray, config.contrast);
    let gray = enhance_sharpness(&gray, config.sharpness);
    enhance_brightness(&gray, config.brightness)
}

/// Interpolate between `degenerate` and the page by `factor`
fn blend(image: &GrayImage, degenerate: impl Fn(u32, u32) -> f32, factor: f32) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let original = image.get_pixel(x, y)[0] as f32;
        let base = degenerate(x, y);
        let value = base + factor * (original - base);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Contrast against the mean gray level of the page
pub fn enhance_contrast(image: &GrayImage, factor: f32) -> GrayImage {
    let pixel_count = (image.width() as u64 * image.height() as u64).max(1);
    let sum: u64 = image.pixels().map(|p| p[0] as u64).sum();
    let mean = (sum as f32 / pixel_count as f32 + 0.5).floor();
    blend(image, |_, _| mean, factor)
}

/// Sharpness against a smoothed copy of the page
pub fn enhance_sharpness(image: &GrayImage, factor: f32) -> GrayImage {
    if image.width() < 3 || image.height() < 3 {
        return image.clone();
    }
    let smoothed: GrayImage = imageops::filter3x3(image, &SMOOTH_KERNEL);
    let (last_x, last_y) = (image.width() - 1, image.height() - 1);
    // The filter leaves the outer ring at zero; that ring keeps its original value
    blend(
        image,
        |x, y| {
            let source = if x == 0 || y == 0 || x == last_x || y == last_y {
                image
            } else {
                &smoothed
            };
            source.get_pixel(x, y)[0] as f32
        },
        factor,
    )
}

/// Brightness against a black page
pub fn enhance_brightness(image: &GrayImage, factor: f32) -> GrayImage {
    blend(image, |_, _| 0.0, factor)
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 255 / (width - 1)) as u8]))
    }

    #[test]
    fn test_empty_document_is_malformed() {
        let err = PdfRasterizer::check_header(b"").unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedDocument { .. }));
    }

    #[test]
    fn test_non_pdf_bytes_are_malformed() {
        let err = PdfRasterizer::check_header(b"\x89PNG\r\n\x1a\n").unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedDocument { .. }));
        assert!(PdfRasterizer::check_header(b"%PDF-1.7\n").is_ok());
    }

    #[tokio::test]
    async fn test_rasterize_rejects_corrupt_bytes_before_pdfium() {
        let rasterizer = PdfRasterizer::new(RasterConfig::default());
        let err = rasterizer.rasterize(&[]).await.unwrap_err();
        assert!(matches!(err, ProcessingError::MalformedDocument { .. }));
    }

    #[test]
    fn test_unit_factors_leave_page_untouched() {
        let page = gradient(16, 16);
        assert_eq!(enhance_contrast(&page, 1.0), page);
        assert_eq!(enhance_brightness(&page, 1.0), page);
        assert_eq!(enhance_sharpness(&page, 1.0), page);
    }

    #[test]
    fn test_contrast_spreads_values_around_mean() {
        let page = gradient(16, 4);
        let enhanced = enhance_contrast(&page, 2.0);
        // darkest pixel gets darker, brightest saturates
        assert_eq!(enhanced.get_pixel(0, 0)[0], 0);
        assert_eq!(enhanced.get_pixel(15, 0)[0], 255);
        let mid = page.get_pixel(8, 0)[0] as i32;
        let mid_enhanced = enhanced.get_pixel(8, 0)[0] as i32;
        assert!((mid_enhanced - 128).abs() >= (mid - 128).abs());
    }

    #[test]
    fn test_brightness_scales_values() {
        let page = GrayImage::from_pixel(4, 4, Luma([100]));
        let brighter = enhance_brightness(&page, 1.1);
        assert_eq!(brighter.get_pixel(0, 0)[0], 110);
        let darker = enhance_brightness(&page, 0.5);
        assert_eq!(darker.get_pixel(3, 3)[0], 50);
    }

    #[test]
    fn test_sharpness_is_noop_on_flat_page() {
        let page = GrayImage::from_pixel(8, 8, Luma([90]));
        let sharpened = enhance_sharpness(&page, 1.5);
        // smoothing a flat page may lose a unit to float truncation
        assert!(sharpened.pixels().all(|p| (p[0] as i32 - 90).abs() <= 1));
    }

    #[test]
    fn test_sharpness_leaves_page_border_alone() {
        let page = gradient(8, 8);
        let sharpened = enhance_sharpness(&page, 1.5);
        for i in 0..8 {
            for (x, y) in [(i, 0), (i, 7), (0, i), (7, i)] {
                assert_eq!(sharpened.get_pixel(x, y), page.get_pixel(x, y), "at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_prepare_page_converts_to_grayscale() {
        let rgb = RgbImage::from_pixel(10, 10, Rgb([200, 10, 10]));
        let config = RasterConfig {
            contrast: 1.0,
            sharpness: 1.0,
            brightness: 1.0,
            ..RasterConfig::default()
        };
        let gray = prepare_page(DynamicImage::ImageRgb8(rgb), &config);
        assert_eq!(gray.dimensions(), (10, 10));
        let expected = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([200, 10, 10])))
            .to_luma8()
            .get_pixel(0, 0)[0];
        assert_eq!(gray.get_pixel(5, 5)[0], expected);
    }

    #[test]
    fn test_page_encodes_as_png() {
        let page = PageImage {
            index: 0,
            image: gradient(8, 8),
        };
        let png = page.to_png().unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));
    }
}
