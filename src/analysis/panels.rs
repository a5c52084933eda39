// Panel detection: partitions a page into reading frames using gutters,
// line art and diagonal cuts as separators, with bubbles masked out so a
// bubble outline never becomes a panel border.

use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::hough::{detect_lines, draw_polar_lines_mut, LineDetectionOptions};
use imageproc::morphology;
use tracing::debug;

use crate::analysis::mask::{
    binarize, contour_bbox, fill_rect, invert, open_cols, open_rows, or_masks, subtract, FG,
};
use crate::analysis::AnalyzerTuning;
use crate::core::types::{BBox, Bubble, Panel};

/// Partition the page into reading panels.
///
/// The separator mask OR-s three signals: white gutter strips (directional
/// run openings), straight line art (canny edges + directional openings) and
/// diagonal cuts (polar line transform, axis-aligned angles excluded). A
/// padded bubble mask is subtracted before the mask is dilated and inverted;
/// the surviving connected areas become panel candidates. Falls back to one
/// whole-page panel when nothing survives the filters.
pub fn detect_panels(gray: &GrayImage, bubbles: &[Bubble], tuning: &AnalyzerTuning) -> Vec<Panel> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let image_area = w as f64 * h as f64;
    let whole_page = BBox::new(0, 0, w as i32, h as i32);

    // Signal 1: white gutter strips.
    let white = binarize(gray, tuning.bubble_threshold_strict);
    let gutters = or_masks(
        &open_rows(&white, w / tuning.gutter_run_divisor),
        &open_cols(&white, h / tuning.gutter_run_divisor),
    );

    // Signal 2: straight line art.
    let edges = canny(gray, tuning.canny_low, tuning.canny_high);
    let line_art = or_masks(
        &open_rows(&edges, w / tuning.edge_run_divisor),
        &open_cols(&edges, h / tuning.edge_run_divisor),
    );

    // Signal 3: diagonal cuts. The vote threshold stands in for a minimum
    // line length of min(w,h)/6; axis-aligned angles are already covered by
    // the directional signals.
    let min_support = (w.min(h) / tuning.diagonal_min_len_divisor).max(1);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: min_support,
            suppression_radius: 8,
        },
    );
    let diagonals: Vec<_> = lines
        .into_iter()
        .filter(|l| {
            let a = l.angle_in_degrees % 90;
            a > 3 && a < 87
        })
        .collect();
    let mut diagonal_mask = GrayImage::new(w, h);
    draw_polar_lines_mut(&mut diagonal_mask, &diagonals, image::Luma([FG]));

    let mut separators = or_masks(&or_masks(&gutters, &line_art), &diagonal_mask);

    // Bubble outlines must never act as panel borders.
    if !bubbles.is_empty() {
        let mut bubble_mask = GrayImage::new(w, h);
        for b in bubbles {
            fill_rect(&mut bubble_mask, &b.bbox, tuning.bubble_mask_padding);
        }
        separators = subtract(&separators, &bubble_mask);
    }

    let dilated = morphology::dilate(&separators, Norm::LInf, 1);
    let inverted = invert(&dilated);

    let contours = find_contours::<i32>(&inverted);
    let mut candidates: Vec<BBox> = contours
        .iter()
        .filter(|c| c.parent.is_none())
        .filter_map(contour_bbox)
        .filter(|bbox| {
            let frac = bbox.area() as f64 / image_area;
            frac >= tuning.min_panel_area_frac
                && frac <= tuning.max_panel_area_frac
                && bbox.w >= tuning.min_panel_dim
                && bbox.h >= tuning.min_panel_dim
        })
        .collect();

    if candidates.is_empty() {
        debug!("no panel candidates survived, falling back to whole page");
        return vec![Panel {
            id: 0,
            bbox: whole_page,
        }];
    }

    let clipped = clip_overlaps(candidates.drain(..).collect(), tuning.min_clipped_panel_dim);
    let without_bubbles = drop_bubble_like(clipped, bubbles, tuning);
    let survivors = drop_nested(without_bubbles, image_area, tuning.nested_panel_max_frac);

    if survivors.is_empty() {
        return vec![Panel {
            id: 0,
            bbox: whole_page,
        }];
    }

    let ordered = sort_reading_order(survivors);
    ordered
        .into_iter()
        .enumerate()
        .map(|(id, bbox)| Panel { id, bbox })
        .collect()
}

/// Remove mutual overlaps by clipping the smaller panel along whichever axis
/// has the larger center-to-center offset from its larger neighbor. Panels
/// shrunk below `min_dim` on either side are discarded.
pub(crate) fn clip_overlaps(mut boxes: Vec<BBox>, min_dim: i32) -> Vec<BBox> {
    boxes.sort_by(|a, b| b.area().cmp(&a.area()));
    let mut alive = vec![true; boxes.len()];

    for i in 0..boxes.len() {
        if !alive[i] {
            continue;
        }
        for j in (i + 1)..boxes.len() {
            if !alive[j] {
                continue;
            }
            if boxes[i].intersection(&boxes[j]).is_none() {
                continue;
            }
            let (cxi, cyi) = boxes[i].center();
            let (cxj, cyj) = boxes[j].center();
            let dx = (cxi - cxj).abs();
            let dy = (cyi - cyj).abs();

            let larger = boxes[i];
            let smaller = &mut boxes[j];
            if dx >= dy {
                if cxj < cxi {
                    smaller.w = larger.x - smaller.x;
                } else {
                    let old_right = smaller.right();
                    smaller.x = larger.right();
                    smaller.w = old_right - smaller.x;
                }
            } else if cyj < cyi {
                smaller.h = larger.y - smaller.y;
            } else {
                let old_bottom = smaller.bottom();
                smaller.y = larger.bottom();
                smaller.h = old_bottom - smaller.y;
            }

            if smaller.w < min_dim || smaller.h < min_dim {
                alive[j] = false;
            }
        }
    }

    boxes
        .into_iter()
        .zip(alive)
        .filter_map(|(b, keep)| keep.then_some(b))
        .collect()
}

/// Drop panels that geometrically coincide with a detected bubble.
pub(crate) fn drop_bubble_like(
    boxes: Vec<BBox>,
    bubbles: &[Bubble],
    tuning: &AnalyzerTuning,
) -> Vec<BBox> {
    boxes
        .into_iter()
        .filter(|panel| {
            !bubbles.iter().any(|b| {
                let panel_cov = panel.overlap_ratio(&b.bbox);
                let bubble_cov = b.bbox.overlap_ratio(panel);
                if panel_cov > tuning.panel_bubble_overlap_high
                    || bubble_cov > tuning.panel_bubble_overlap_high
                {
                    return true;
                }
                if panel_cov > tuning.panel_bubble_overlap_low
                    || bubble_cov > tuning.panel_bubble_overlap_low
                {
                    let pa = panel.area() as f64;
                    let ba = b.bbox.area() as f64;
                    let rel_diff = (pa - ba).abs() / pa.max(ba).max(1.0);
                    return rel_diff < tuning.panel_bubble_area_diff;
                }
                false
            })
        })
        .collect()
}

/// Drop small panels fully nested inside another panel.
pub(crate) fn drop_nested(boxes: Vec<BBox>, image_area: f64, max_frac: f64) -> Vec<BBox> {
    let snapshot = boxes.clone();
    boxes
        .into_iter()
        .filter(|panel| {
            let small = (panel.area() as f64) < max_frac * image_area;
            !(small
                && snapshot
                    .iter()
                    .any(|other| other != panel && other.contains(panel)))
        })
        .collect()
}

/// Manga reading order: top row first, right-to-left within a row.
pub(crate) fn sort_reading_order(mut boxes: Vec<BBox>) -> Vec<BBox> {
    boxes.sort_by_key(|b| b.y);
    let mut rows: Vec<Vec<BBox>> = Vec::new();
    for b in boxes {
        match rows.last_mut() {
            Some(row) => {
                let anchor = row[0];
                // Same row while the top edge is above the anchor's midline.
                if (b.y as f32) < anchor.y as f32 + anchor.h as f32 / 2.0 {
                    row.push(b);
                } else {
                    rows.push(vec![b]);
                }
            }
            None => rows.push(vec![b]),
        }
    }
    for row in &mut rows {
        row.sort_by_key(|b| -b.x);
    }
    rows.into_iter().flatten().collect()
}
