// Structural page analysis: speech bubbles, panel boundaries and
// reading-order text grouping.

pub mod bubbles;
pub mod grouping;
pub mod mask;
pub mod panels;

pub use bubbles::detect_bubbles;
pub use grouping::{group_text_by_structure, DisjointSet};
pub use panels::detect_panels;

use image::GrayImage;
use tracing::instrument;

use crate::core::errors::{AnalysisError, AnalysisResult};
use crate::core::types::{DetectionPayload, Region};

/// Empirically-chosen thresholds for the structural analyzer.
///
/// These have no documented geometric derivation; they are a tuning surface
/// and every one can be overridden per analyzer instance.
#[derive(Debug, Clone)]
pub struct AnalyzerTuning {
    // Bubble detection
    pub bubble_threshold_strict: u8,
    pub bubble_threshold_loose: u8,
    pub min_bubble_area: f64,
    pub max_bubble_area_frac: f64,
    pub min_bubble_aspect: f64,
    pub max_bubble_aspect: f64,
    pub min_bubble_solidity: f64,
    pub min_bubble_dim: i32,

    // Panel detection
    pub gutter_run_divisor: u32,
    pub edge_run_divisor: u32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub diagonal_min_len_divisor: u32,
    pub bubble_mask_padding: i32,
    pub min_panel_area_frac: f64,
    pub max_panel_area_frac: f64,
    pub min_panel_dim: i32,
    pub min_clipped_panel_dim: i32,
    pub panel_bubble_overlap_high: f64,
    pub panel_bubble_overlap_low: f64,
    pub panel_bubble_area_diff: f64,
    pub nested_panel_max_frac: f64,

    // Text grouping
    pub group_h_gap: f32,
    pub group_v_gap: f32,
    pub group_v_limit: f32,
    pub group_tight_gap: f32,
    pub group_overlap_merge: f64,
    pub group_center_align_factor: f32,
    pub single_char_max_w: i32,
    pub single_char_max_h: i32,
    pub single_char_same_line_factor: f32,
    pub single_char_inline_factor: f32,
    pub bubble_overlap_floor: f64,
}

impl Default for AnalyzerTuning {
    fn default() -> Self {
        Self {
            bubble_threshold_strict: 240,
            bubble_threshold_loose: 220,
            min_bubble_area: 500.0,
            max_bubble_area_frac: 0.4,
            min_bubble_aspect: 0.1,
            max_bubble_aspect: 10.0,
            min_bubble_solidity: 0.4,
            min_bubble_dim: 20,

            gutter_run_divisor: 5,
            edge_run_divisor: 10,
            canny_low: 50.0,
            canny_high: 150.0,
            diagonal_min_len_divisor: 6,
            bubble_mask_padding: 5,
            min_panel_area_frac: 0.01,
            max_panel_area_frac: 0.95,
            min_panel_dim: 50,
            min_clipped_panel_dim: 30,
            panel_bubble_overlap_high: 0.6,
            panel_bubble_overlap_low: 0.3,
            panel_bubble_area_diff: 0.5,
            nested_panel_max_frac: 0.15,

            group_h_gap: 80.0,
            group_v_gap: 50.0,
            group_v_limit: 100.0,
            group_tight_gap: 20.0,
            group_overlap_merge: 0.3,
            group_center_align_factor: 1.5,
            single_char_max_w: 50,
            single_char_max_h: 90,
            single_char_same_line_factor: 0.6,
            single_char_inline_factor: 3.0,
            bubble_overlap_floor: 0.3,
        }
    }
}

/// Facade over the three structural passes.
#[derive(Debug, Clone, Default)]
pub struct StructuralAnalyzer {
    tuning: AnalyzerTuning,
}

impl StructuralAnalyzer {
    pub fn new(tuning: AnalyzerTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &AnalyzerTuning {
        &self.tuning
    }

    /// Full structural enrichment of raw detections. Callers must treat an
    /// error as a signal to fall back to `DetectionPayload::ungrouped`.
    #[instrument(skip(self, gray, regions), fields(regions = regions.len()))]
    pub fn analyze(
        &self,
        gray: &GrayImage,
        regions: Vec<Region>,
        rtl: bool,
    ) -> AnalysisResult<DetectionPayload> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Err(AnalysisError::InvalidImageSize {
                width: w,
                height: h,
            });
        }

        let bubbles = detect_bubbles(gray, &self.tuning);
        let panels = detect_panels(gray, &bubbles, &self.tuning);
        let (annotated, groups) =
            group_text_by_structure(&regions, &bubbles, &panels, rtl, &self.tuning);

        Ok(DetectionPayload {
            regions: annotated,
            bubble_groups: groups,
            panel_boundaries: panels,
            detected_bubbles: bubbles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BBox;
    use image::Luma;

    #[test]
    fn analyze_rejects_empty_image() {
        let analyzer = StructuralAnalyzer::default();
        let gray = GrayImage::new(0, 0);
        assert!(analyzer.analyze(&gray, Vec::new(), false).is_err());
    }

    #[test]
    fn analyze_produces_complete_payload() {
        let analyzer = StructuralAnalyzer::default();
        let gray = GrayImage::from_pixel(300, 300, Luma([140u8]));
        let regions = vec![Region::new(BBox::new(50, 50, 80, 20), "hi", 0.95)];
        let payload = analyzer.analyze(&gray, regions, false).unwrap();
        assert_eq!(payload.regions.len(), 1);
        assert_eq!(payload.bubble_groups.len(), 1);
        // Featureless page collapses to a single whole-page panel.
        assert_eq!(payload.panel_boundaries.len(), 1);
    }
}
