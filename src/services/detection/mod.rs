// Text detection facade over the pluggable OCR backends.
//
// `detect_text_with_grouping` enriches raw boxes with the structural
// analyzer; any analyzer failure degrades to the ungrouped one-region-per-
// group shape rather than failing the page.

pub mod backends;
pub mod direct;

pub use backends::{
    CredentialFileBackend, DetectionBackend, PollingVisionBackend, RestVisionBackend,
};
pub use direct::{DirectOutput, DirectTranslator};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::analysis::StructuralAnalyzer;
use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{is_cjk_text, BBox, DetectionPayload, Region};
use crate::utils::{crop_and_encode_png_async, load_image_from_memory_async};

/// Result of re-scanning a single rectangle: the merged text of every line
/// found inside it, with a length-weighted average confidence.
#[derive(Debug, Clone)]
pub struct RegionScan {
    pub text: String,
    pub confidence: f32,
}

pub struct TextDetector {
    backends: HashMap<String, Arc<dyn DetectionBackend>>,
    analyzer: StructuralAnalyzer,
    default_backend: String,
}

impl TextDetector {
    pub fn from_config(config: &Config) -> DetectionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.detection.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let mut backends: HashMap<String, Arc<dyn DetectionBackend>> = HashMap::new();
        backends.insert(
            "rest".to_string(),
            Arc::new(RestVisionBackend::new(
                client.clone(),
                config.detection.rest_endpoint.clone(),
                config.detection.rest_api_key.clone(),
            )),
        );
        backends.insert(
            "polling".to_string(),
            Arc::new(PollingVisionBackend::new(
                client.clone(),
                config.detection.polling_endpoint.clone(),
                config.detection.polling_api_key.clone(),
                Duration::from_secs(config.detection.poll_timeout_secs),
                Duration::from_millis(config.detection.poll_interval_ms),
            )),
        );
        if let Some(path) = &config.detection.credentials_path {
            backends.insert(
                "credential".to_string(),
                Arc::new(CredentialFileBackend::new(client, path.clone())),
            );
        }

        Ok(Self {
            backends,
            analyzer: StructuralAnalyzer::default(),
            default_backend: config.detection.default_backend.clone(),
        })
    }

    /// Test constructor taking pre-built backends.
    pub fn with_backends(
        backends: HashMap<String, Arc<dyn DetectionBackend>>,
        default_backend: impl Into<String>,
    ) -> Self {
        Self {
            backends,
            analyzer: StructuralAnalyzer::default(),
            default_backend: default_backend.into(),
        }
    }

    fn resolve(&self, backend: Option<&str>) -> DetectionResult<&Arc<dyn DetectionBackend>> {
        let name = backend.unwrap_or(&self.default_backend);
        self.backends
            .get(name)
            .ok_or_else(|| DetectionError::UnknownBackend(name.to_string()))
    }

    /// Raw detection: provider boxes normalized to pixel rectangles.
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn detect_text(
        &self,
        image_bytes: &[u8],
        backend: Option<&str>,
        language: &str,
    ) -> DetectionResult<Vec<Region>> {
        let backend = self.resolve(backend)?;
        let regions = backend.detect(image_bytes, language).await?;
        debug!(regions = regions.len(), "detection complete");
        Ok(regions)
    }

    /// Detection plus structural enrichment. The analyzer is advisory: if it
    /// fails (or the page cannot be decoded) the raw regions are returned in
    /// the ungrouped fallback shape.
    #[instrument(skip(self, image_bytes))]
    pub async fn detect_text_with_grouping(
        &self,
        image_bytes: &[u8],
        backend: Option<&str>,
        language: &str,
        rtl: bool,
    ) -> DetectionResult<DetectionPayload> {
        let regions = self.detect_text(image_bytes, backend, language).await?;
        if regions.is_empty() {
            return Ok(DetectionPayload::default());
        }

        let gray = {
            let bytes = image_bytes.to_vec();
            tokio::task::spawn_blocking(move || {
                image::load_from_memory(&bytes).map(|img| img.to_luma8())
            })
            .await
            .map_err(|e| DetectionError::Provider(format!("blocking task failed: {e}")))?
        };

        let gray = match gray {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "page not decodable, skipping structural analysis");
                return Ok(DetectionPayload::ungrouped(regions));
            }
        };

        let analyzer = self.analyzer.clone();
        let fallback = regions.clone();
        let analyzed =
            tokio::task::spawn_blocking(move || analyzer.analyze(&gray, regions, rtl))
                .await
                .map_err(|e| DetectionError::Provider(format!("blocking task failed: {e}")))?;

        match analyzed {
            Ok(payload) => Ok(payload),
            Err(e) => {
                warn!(error = %e, "structural analysis failed, using ungrouped fallback");
                Ok(DetectionPayload::ungrouped(fallback))
            }
        }
    }

    /// Re-scan one rectangle of the page and merge everything found inside
    /// it into a single text. Returns Ok(None) when the crop is empty or the
    /// provider finds no text in it.
    #[instrument(skip(self, image_bytes))]
    pub async fn detect_text_in_region(
        &self,
        image_bytes: &[u8],
        rect: BBox,
        backend: Option<&str>,
        language: &str,
    ) -> DetectionResult<Option<RegionScan>> {
        let img = load_image_from_memory_async(image_bytes).await?;
        let x = rect.x.max(0) as u32;
        let y = rect.y.max(0) as u32;
        if x >= img.width() || y >= img.height() {
            return Ok(None);
        }
        let w = (rect.w.max(0) as u32).min(img.width() - x);
        let h = (rect.h.max(0) as u32).min(img.height() - y);
        if w == 0 || h == 0 {
            return Ok(None);
        }
        let crop = crop_and_encode_png_async(img, x, y, w, h).await?;

        let regions = self.detect_text(&crop, backend, language).await?;
        Ok(merge_region_scan(regions))
    }
}

/// Merge per-line regions from a crop into one text. Lines are sorted top to
/// bottom; CJK lines join without a separator, everything else with a space.
pub(crate) fn merge_region_scan(mut regions: Vec<Region>) -> Option<RegionScan> {
    if regions.is_empty() {
        return None;
    }
    regions.sort_by_key(|r| (r.bbox.y, r.bbox.x));

    let cjk = regions.iter().any(|r| is_cjk_text(&r.text));
    let separator = if cjk { "" } else { " " };
    let text = regions
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join(separator);

    let mut weighted = 0.0f64;
    let mut total = 0.0f64;
    for r in &regions {
        let weight = r.text.chars().count().max(1) as f64;
        weighted += r.confidence as f64 * weight;
        total += weight;
    }
    Some(RegionScan {
        text,
        confidence: (weighted / total) as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::ImageFormat;
    use std::io::Cursor;

    struct FixedBackend {
        regions: Vec<Region>,
    }

    #[async_trait]
    impl DetectionBackend for FixedBackend {
        async fn detect(&self, _image: &[u8], _language: &str) -> DetectionResult<Vec<Region>> {
            Ok(self.regions.clone())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl DetectionBackend for FailingBackend {
        async fn detect(&self, _image: &[u8], _language: &str) -> DetectionResult<Vec<Region>> {
            Err(DetectionError::Provider("boom".to_string()))
        }
    }

    fn detector_with(backend: Arc<dyn DetectionBackend>) -> TextDetector {
        let mut backends: HashMap<String, Arc<dyn DetectionBackend>> = HashMap::new();
        backends.insert("stub".to_string(), backend);
        TextDetector::with_backends(backends, "stub")
    }

    fn png_page(w: u32, h: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
            w,
            h,
            image::Luma([140u8]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn unknown_backend_is_an_error() {
        let detector = detector_with(Arc::new(FixedBackend { regions: vec![] }));
        let err = detector.detect_text(&[], Some("nope"), "ko").await.unwrap_err();
        assert!(matches!(err, DetectionError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn grouping_falls_back_on_undecodable_image() {
        let regions = vec![Region::new(BBox::new(10, 10, 50, 20), "hi", 0.9)];
        let detector = detector_with(Arc::new(FixedBackend { regions }));
        let payload = detector
            .detect_text_with_grouping(b"not an image", None, "ko", false)
            .await
            .unwrap();
        assert_eq!(payload.regions.len(), 1);
        assert_eq!(payload.bubble_groups.len(), 1);
        assert!(payload.bubble_groups[0].is_ungrouped);
    }

    #[tokio::test]
    async fn grouping_produces_structured_payload() {
        let regions = vec![Region::new(BBox::new(50, 50, 80, 20), "hello", 0.95)];
        let detector = detector_with(Arc::new(FixedBackend { regions }));
        let payload = detector
            .detect_text_with_grouping(&png_page(300, 300), None, "ko", false)
            .await
            .unwrap();
        assert_eq!(payload.regions.len(), 1);
        assert_eq!(payload.bubble_groups.len(), 1);
        assert!(!payload.bubble_groups[0].is_ungrouped);
    }

    #[tokio::test]
    async fn empty_detection_yields_empty_payload() {
        let detector = detector_with(Arc::new(FixedBackend { regions: vec![] }));
        let payload = detector
            .detect_text_with_grouping(&png_page(100, 100), None, "ko", false)
            .await
            .unwrap();
        assert!(payload.regions.is_empty());
        assert!(payload.bubble_groups.is_empty());
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let detector = detector_with(Arc::new(FailingBackend));
        let err = detector
            .detect_text_with_grouping(&png_page(50, 50), None, "ko", false)
            .await
            .unwrap_err();
        assert!(matches!(err, DetectionError::Provider(_)));
    }

    #[tokio::test]
    async fn region_scan_out_of_bounds_is_none() {
        let detector = detector_with(Arc::new(FixedBackend { regions: vec![] }));
        let scan = detector
            .detect_text_in_region(&png_page(50, 50), BBox::new(100, 100, 20, 20), None, "ko")
            .await
            .unwrap();
        assert!(scan.is_none());
    }

    #[test]
    fn merge_sorts_lines_and_spaces_latin() {
        let scan = merge_region_scan(vec![
            Region::new(BBox::new(0, 30, 60, 20), "world", 0.8),
            Region::new(BBox::new(0, 0, 60, 20), "hello", 1.0),
        ])
        .unwrap();
        assert_eq!(scan.text, "hello world");
        // Both lines weigh 5 characters.
        assert!((scan.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn merge_joins_cjk_without_separator() {
        let scan = merge_region_scan(vec![
            Region::new(BBox::new(0, 0, 60, 20), "안녕", 0.9),
            Region::new(BBox::new(0, 30, 60, 20), "하세요", 0.9),
        ])
        .unwrap();
        assert_eq!(scan.text, "안녕하세요");
    }

    #[test]
    fn merge_empty_is_none() {
        assert!(merge_region_scan(Vec::new()).is_none());
    }
}
