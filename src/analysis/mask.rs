// Binary mask primitives shared by bubble and panel detection.
//
// Masks are GrayImages with 255 = foreground, 0 = background. The
// directional openings are run-length filters: a 1xN (or Nx1) morphological
// opening of a binary image keeps exactly the runs of length >= N.

use image::{GrayImage, Luma};
use imageproc::contours::Contour;
use imageproc::geometry::convex_hull;
use imageproc::point::Point;

use crate::core::types::BBox;

pub const FG: u8 = 255;

/// Threshold a grayscale image: pixels >= `thresh` become foreground.
pub fn binarize(gray: &GrayImage, thresh: u8) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] >= thresh {
            Luma([FG])
        } else {
            Luma([0])
        }
    })
}

pub fn or_masks(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        if a.get_pixel(x, y)[0] > 0 || b.get_pixel(x, y)[0] > 0 {
            Luma([FG])
        } else {
            Luma([0])
        }
    })
}

/// Remove from `a` everything covered by `b`.
pub fn subtract(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        if a.get_pixel(x, y)[0] > 0 && b.get_pixel(x, y)[0] == 0 {
            Luma([FG])
        } else {
            Luma([0])
        }
    })
}

pub fn invert(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            Luma([0])
        } else {
            Luma([FG])
        }
    })
}

/// Horizontal opening with a 1xN kernel: keep foreground runs along each
/// row whose length is >= `min_len`.
pub fn open_rows(mask: &GrayImage, min_len: u32) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w, h);
    if min_len == 0 {
        return mask.clone();
    }
    for y in 0..h {
        let mut run_start = 0u32;
        let mut in_run = false;
        for x in 0..=w {
            let fg = x < w && mask.get_pixel(x, y)[0] > 0;
            if fg && !in_run {
                run_start = x;
                in_run = true;
            } else if !fg && in_run {
                in_run = false;
                if x - run_start >= min_len {
                    for rx in run_start..x {
                        out.put_pixel(rx, y, Luma([FG]));
                    }
                }
            }
        }
    }
    out
}

/// Vertical opening with an Nx1 kernel: keep foreground runs along each
/// column whose length is >= `min_len`.
pub fn open_cols(mask: &GrayImage, min_len: u32) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w, h);
    if min_len == 0 {
        return mask.clone();
    }
    for x in 0..w {
        let mut run_start = 0u32;
        let mut in_run = false;
        for y in 0..=h {
            let fg = y < h && mask.get_pixel(x, y)[0] > 0;
            if fg && !in_run {
                run_start = y;
                in_run = true;
            } else if !fg && in_run {
                in_run = false;
                if y - run_start >= min_len {
                    for ry in run_start..y {
                        out.put_pixel(x, ry, Luma([FG]));
                    }
                }
            }
        }
    }
    out
}

/// Paint a filled rectangle into a mask, clamped to the mask bounds.
pub fn fill_rect(mask: &mut GrayImage, bbox: &BBox, padding: i32) {
    let (w, h) = mask.dimensions();
    let x1 = (bbox.x - padding).max(0) as u32;
    let y1 = (bbox.y - padding).max(0) as u32;
    let x2 = ((bbox.right() + padding).max(0) as u32).min(w);
    let y2 = ((bbox.bottom() + padding).max(0) as u32).min(h);
    for y in y1..y2 {
        for x in x1..x2 {
            mask.put_pixel(x, y, Luma([FG]));
        }
    }
}

/// Bounding box of a contour's points (inclusive pixel extents).
pub fn contour_bbox(contour: &Contour<i32>) -> Option<BBox> {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    if min_x > max_x {
        return None;
    }
    Some(BBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

/// Shoelace area of a closed polygon.
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0i64;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        sum += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    (sum.abs() as f64) / 2.0
}

/// Contour area divided by its convex-hull area. 0 when the hull is
/// degenerate.
pub fn solidity(points: &[Point<i32>]) -> f64 {
    let area = polygon_area(points);
    if area <= 0.0 {
        return 0.0;
    }
    let hull = convex_hull(points.to_vec());
    let hull_area = polygon_area(&hull);
    if hull_area <= 0.0 {
        0.0
    } else {
        (area / hull_area).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> GrayImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        GrayImage::from_fn(w, h, |x, y| {
            if rows[y as usize].as_bytes()[x as usize] == b'#' {
                Luma([FG])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn binarize_thresholds_inclusive() {
        let gray = GrayImage::from_fn(2, 1, |x, _| if x == 0 { Luma([240]) } else { Luma([239]) });
        let m = binarize(&gray, 240);
        assert_eq!(m.get_pixel(0, 0)[0], FG);
        assert_eq!(m.get_pixel(1, 0)[0], 0);
    }

    #[test]
    fn open_rows_keeps_only_long_runs() {
        let m = mask_from(&["##..#####.", ".........."]);
        let opened = open_rows(&m, 4);
        assert_eq!(opened.get_pixel(0, 0)[0], 0); // short run removed
        assert_eq!(opened.get_pixel(4, 0)[0], FG); // long run kept
        assert_eq!(opened.get_pixel(8, 0)[0], FG);
    }

    #[test]
    fn open_cols_keeps_only_long_runs() {
        let m = mask_from(&["#.", "#.", "#.", ".#"]);
        let opened = open_cols(&m, 3);
        assert_eq!(opened.get_pixel(0, 1)[0], FG);
        assert_eq!(opened.get_pixel(1, 3)[0], 0);
    }

    #[test]
    fn square_polygon_area() {
        let pts = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&pts), 100.0);
        assert!((solidity(&pts) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fill_rect_clamps_to_bounds() {
        let mut m = GrayImage::new(10, 10);
        fill_rect(&mut m, &BBox::new(8, 8, 10, 10), 2);
        assert_eq!(m.get_pixel(9, 9)[0], FG);
        assert_eq!(m.get_pixel(5, 5)[0], 0);
        assert_eq!(m.get_pixel(6, 6)[0], FG); // padding applied
    }
}
