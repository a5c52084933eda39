// Speech-bubble detection: near-white, roughly-convex closed shapes.

use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use tracing::debug;

use crate::analysis::mask::{binarize, contour_bbox, or_masks, polygon_area, solidity};
use crate::analysis::AnalyzerTuning;
use crate::core::types::Bubble;

/// Find speech-bubble candidates in a grayscale page.
///
/// Two near-white thresholds are OR-ed so anti-aliased bubble edges survive
/// binarization, the mask is closed then opened to merge broken outlines and
/// drop speckle, and the external contours are filtered by area, aspect
/// ratio, convex-hull solidity and minimum size. Result is sorted
/// top-to-bottom then left-to-right with sequential ids.
pub fn detect_bubbles(gray: &GrayImage, tuning: &AnalyzerTuning) -> Vec<Bubble> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let image_area = w as f64 * h as f64;

    let strict = binarize(gray, tuning.bubble_threshold_strict);
    let loose = binarize(gray, tuning.bubble_threshold_loose);
    let mask = or_masks(&strict, &loose);

    // 5x5 close twice then open once; the double close collapses to one
    // pass with a doubled radius under the chessboard norm.
    let closed = morphology::close(&mask, Norm::LInf, 4);
    let opened = morphology::open(&closed, Norm::LInf, 2);

    let contours = find_contours::<i32>(&opened);
    let mut bubbles = Vec::new();

    for contour in contours.iter().filter(|c| c.parent.is_none()) {
        let Some(bbox) = contour_bbox(contour) else {
            continue;
        };
        let area = polygon_area(&contour.points);
        if area < tuning.min_bubble_area || area > tuning.max_bubble_area_frac * image_area {
            continue;
        }
        if bbox.h == 0 {
            continue;
        }
        let aspect = bbox.w as f64 / bbox.h as f64;
        if aspect < tuning.min_bubble_aspect || aspect > tuning.max_bubble_aspect {
            continue;
        }
        let sol = solidity(&contour.points);
        if sol < tuning.min_bubble_solidity {
            continue;
        }
        if bbox.w < tuning.min_bubble_dim || bbox.h < tuning.min_bubble_dim {
            continue;
        }
        bubbles.push(Bubble {
            id: 0,
            bbox,
            area,
            solidity: sol,
        });
    }

    bubbles.sort_by_key(|b| (b.bbox.y, b.bbox.x));
    for (i, b) in bubbles.iter_mut().enumerate() {
        b.id = i;
    }

    debug!(count = bubbles.len(), "bubble detection complete");
    bubbles
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Dark page with white filled ellipses where bubbles should be found.
    fn synthetic_page(bubbles: &[(i32, i32, i32, i32)]) -> GrayImage {
        let mut img = GrayImage::from_pixel(400, 600, Luma([40u8]));
        for &(cx, cy, rx, ry) in bubbles {
            for y in (cy - ry).max(0)..(cy + ry).min(600) {
                for x in (cx - rx).max(0)..(cx + rx).min(400) {
                    let dx = (x - cx) as f64 / rx as f64;
                    let dy = (y - cy) as f64 / ry as f64;
                    if dx * dx + dy * dy <= 1.0 {
                        img.put_pixel(x as u32, y as u32, Luma([250u8]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn finds_white_ellipses_and_orders_them() {
        let img = synthetic_page(&[(100, 100, 60, 40), (300, 400, 50, 50)]);
        let bubbles = detect_bubbles(&img, &AnalyzerTuning::default());
        assert_eq!(bubbles.len(), 2);
        // Top bubble first
        assert!(bubbles[0].bbox.y < bubbles[1].bbox.y);
        assert_eq!(bubbles[0].id, 0);
        assert_eq!(bubbles[1].id, 1);
    }

    #[test]
    fn accepted_bubbles_respect_filter_bounds() {
        let img = synthetic_page(&[(200, 300, 80, 60)]);
        let tuning = AnalyzerTuning::default();
        let image_area = 400.0 * 600.0;
        for b in detect_bubbles(&img, &tuning) {
            assert!(b.area >= tuning.min_bubble_area);
            assert!(b.area <= tuning.max_bubble_area_frac * image_area);
            let aspect = b.bbox.w as f64 / b.bbox.h as f64;
            assert!(aspect >= tuning.min_bubble_aspect && aspect <= tuning.max_bubble_aspect);
            assert!(b.solidity >= tuning.min_bubble_solidity);
            assert!(b.bbox.x >= 0 && b.bbox.y >= 0);
            assert!(b.bbox.right() <= 400 && b.bbox.bottom() <= 600);
        }
    }

    #[test]
    fn speckle_is_rejected() {
        // A handful of isolated bright pixels, far below the area floor.
        let mut img = GrayImage::from_pixel(200, 200, Luma([30u8]));
        img.put_pixel(50, 50, Luma([255u8]));
        img.put_pixel(120, 80, Luma([255u8]));
        let bubbles = detect_bubbles(&img, &AnalyzerTuning::default());
        assert!(bubbles.is_empty());
    }

    #[test]
    fn empty_image_yields_no_bubbles() {
        let img = GrayImage::new(0, 0);
        assert!(detect_bubbles(&img, &AnalyzerTuning::default()).is_empty());
    }
}
