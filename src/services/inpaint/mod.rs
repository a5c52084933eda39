// Text removal. Two tiers share one mask builder: a fast in-process
// boundary fill, and a quality tier served by a managed side process with a
// circuit breaker in front of it. Quality failures degrade to the fast path
// so a dead side process slows pages down instead of failing them.

pub mod server;

pub use server::InpaintServer;

use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageFormat, Rgba, RgbaImage};
use tracing::{debug, instrument, warn};

use crate::analysis::mask::{fill_rect, FG};
use crate::core::config::InpaintConfig;
use crate::core::errors::{InpaintError, InpaintResult};
use crate::core::types::{BBox, RemovalMethod};
use crate::middleware::CircuitBreaker;

/// Pixels of padding added around every text box before filling.
const MASK_PADDING: i32 = 5;

pub struct Inpainter {
    server: Arc<InpaintServer>,
    breaker: CircuitBreaker,
}

impl Inpainter {
    pub fn from_config(config: &InpaintConfig) -> InpaintResult<Self> {
        Ok(Self {
            server: Arc::new(InpaintServer::new(config)?),
            breaker: CircuitBreaker::new(),
        })
    }

    /// Remove text from the given boxes. An empty box list returns the page
    /// untouched.
    #[instrument(skip(self, image, boxes), fields(boxes = boxes.len(), ?method))]
    pub async fn clean_text(
        &self,
        image: &DynamicImage,
        boxes: &[BBox],
        method: RemovalMethod,
    ) -> InpaintResult<DynamicImage> {
        if boxes.is_empty() {
            return Ok(image.clone());
        }

        let mask = build_mask(image.width(), image.height(), boxes, MASK_PADDING);

        if method == RemovalMethod::Quality {
            match self.quality_fill(image, &mask).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(error = %e, "quality inpainting failed, using fast fill");
                }
            }
        }

        fast_fill_async(image.clone(), mask).await
    }

    async fn quality_fill(
        &self,
        image: &DynamicImage,
        mask: &GrayImage,
    ) -> InpaintResult<DynamicImage> {
        if !self.breaker.allow_request() {
            return Err(InpaintError::ServerStartFailed(
                "circuit breaker is open".to_string(),
            ));
        }

        let result = async {
            self.server.ensure_running().await?;

            let mut image_png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut image_png), ImageFormat::Png)?;
            let mut mask_png = Vec::new();
            DynamicImage::ImageLuma8(mask.clone())
                .write_to(&mut Cursor::new(&mut mask_png), ImageFormat::Png)?;

            let out = self.server.inpaint(&image_png, &mask_png).await?;
            let decoded = image::load_from_memory(&out)?;
            debug!("quality inpainting succeeded");
            Ok(decoded)
        }
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// Kill the quality-tier side process if one was started. Called on
    /// service shutdown; safe when the server never ran.
    pub async fn shutdown(&self) {
        self.server.stop().await;
    }
}

/// Binary removal mask: FG where text must be erased.
pub fn build_mask(width: u32, height: u32, boxes: &[BBox], padding: i32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for bbox in boxes {
        fill_rect(&mut mask, bbox, padding);
    }
    mask
}

/// Fast tier on the blocking pool.
async fn fast_fill_async(image: DynamicImage, mask: GrayImage) -> InpaintResult<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        let filled = fast_fill(&image.to_rgba8(), &mask);
        Ok(DynamicImage::ImageRgba8(filled))
    })
    .await
    .map_err(|e| {
        InpaintError::Io(std::io::Error::other(format!("blocking task failed: {e}")))
    })?
}

/// Boundary fill: masked pixels are filled from the outside in, each taking
/// the average of its already-known 8-neighborhood. One pass peels one ring
/// of the mask, so the iteration count is bounded by the largest box's half
/// width.
pub fn fast_fill(image: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    let (w, h) = image.dimensions();
    let mut out = image.clone();
    let mut unknown: Vec<bool> = mask.pixels().map(|p| p[0] == FG).collect();
    let idx = |x: u32, y: u32| (y * w + x) as usize;

    let mut remaining: usize = unknown.iter().filter(|u| **u).count();
    let max_passes = (w.max(h) as usize) + 1;

    for _ in 0..max_passes {
        if remaining == 0 {
            break;
        }
        let mut filled_this_pass = Vec::new();
        for y in 0..h {
            for x in 0..w {
                if !unknown[idx(x, y)] {
                    continue;
                }
                let mut sum = [0u32; 4];
                let mut count = 0u32;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = x as i32 + dx;
                        let ny = y as i32 + dy;
                        if nx < 0 || ny < 0 || nx >= w as i32 || ny >= h as i32 {
                            continue;
                        }
                        let (nx, ny) = (nx as u32, ny as u32);
                        if unknown[idx(nx, ny)] {
                            continue;
                        }
                        let p = out.get_pixel(nx, ny);
                        for c in 0..4 {
                            sum[c] += p[c] as u32;
                        }
                        count += 1;
                    }
                }
                if count > 0 {
                    let avg = Rgba([
                        (sum[0] / count) as u8,
                        (sum[1] / count) as u8,
                        (sum[2] / count) as u8,
                        (sum[3] / count) as u8,
                    ]);
                    out.put_pixel(x, y, avg);
                    filled_this_pass.push(idx(x, y));
                }
            }
        }
        if filled_this_pass.is_empty() {
            // Fully-masked image; nothing to sample from.
            break;
        }
        remaining -= filled_this_pass.len();
        // Marked known only after the pass so a whole ring samples the same
        // boundary.
        for i in filled_this_pass {
            unknown[i] = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_covers_padded_boxes() {
        let mask = build_mask(100, 100, &[BBox::new(40, 40, 20, 20)], 5);
        assert_eq!(mask.get_pixel(50, 50)[0], FG);
        assert_eq!(mask.get_pixel(36, 50)[0], FG);
        assert_eq!(mask.get_pixel(30, 50)[0], 0);
    }

    #[test]
    fn fast_fill_replaces_dark_text_with_surroundings() {
        // White page with a black blob in the middle.
        let mut img = RgbaImage::from_pixel(60, 60, Rgba([255, 255, 255, 255]));
        for y in 25..35 {
            for x in 25..35 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let mask = build_mask(60, 60, &[BBox::new(25, 25, 10, 10)], 2);
        let out = fast_fill(&img, &mask);
        // Every masked pixel must now be light.
        for y in 25..35 {
            for x in 25..35 {
                assert!(out.get_pixel(x, y)[0] > 200, "pixel ({x},{y}) still dark");
            }
        }
        // Pixels far from the mask are untouched.
        assert_eq!(out.get_pixel(5, 5), img.get_pixel(5, 5));
    }

    #[test]
    fn fast_fill_with_empty_mask_is_identity() {
        let img = RgbaImage::from_pixel(20, 20, Rgba([120, 60, 30, 255]));
        let mask = GrayImage::new(20, 20);
        assert_eq!(fast_fill(&img, &mask), img);
    }

    #[tokio::test]
    async fn clean_text_with_no_boxes_returns_the_page_unchanged() {
        let inpainter = Inpainter::from_config(&crate::core::config::InpaintConfig {
            server_command: "true".to_string(),
            server_port: 0,
            startup_wait_secs: 1,
            request_timeout_secs: 1,
        })
        .unwrap();
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            10,
            10,
            Rgba([1, 2, 3, 255]),
        ));
        let out = inpainter
            .clean_text(&img, &[], RemovalMethod::Quality)
            .await
            .unwrap();
        assert_eq!(out.to_rgba8(), img.to_rgba8());
    }

    #[tokio::test]
    async fn shutdown_without_a_running_server_is_a_no_op() {
        let inpainter = Inpainter::from_config(&crate::core::config::InpaintConfig {
            server_command: "true".to_string(),
            server_port: 0,
            startup_wait_secs: 1,
            request_timeout_secs: 1,
        })
        .unwrap();
        inpainter.shutdown().await;
    }

    #[tokio::test]
    async fn quality_failure_falls_back_to_fast_fill() {
        // Port 1 with a bogus command: ensure_running fails, the breaker
        // records it, and the fast path still cleans the page.
        let inpainter = Inpainter::from_config(&crate::core::config::InpaintConfig {
            server_command: "/nonexistent/inpaint-server".to_string(),
            server_port: 1,
            startup_wait_secs: 1,
            request_timeout_secs: 1,
        })
        .unwrap();
        let mut img = RgbaImage::from_pixel(40, 40, Rgba([255, 255, 255, 255]));
        img.put_pixel(20, 20, Rgba([0, 0, 0, 255]));
        let out = inpainter
            .clean_text(
                &DynamicImage::ImageRgba8(img),
                &[BBox::new(18, 18, 5, 5)],
                RemovalMethod::Quality,
            )
            .await
            .unwrap();
        assert!(out.to_rgba8().get_pixel(20, 20)[0] > 200);
    }
}
