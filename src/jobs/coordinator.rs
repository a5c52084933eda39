// Pipeline glue: turns a queued page task into detect → translate →
// inpaint → typeset → persist, with the degradation rules the services
// promise (analyzer fallback inside the detector, quality-inpaint fallback
// inside the inpainter) and the store as the single source of truth.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use image::ImageFormat;
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{PageContext, PipelineError, PipelineResult};
use crate::core::types::{
    BBox, DetectionPayload, TranslatedRegion, TypesetOverrides, TypesetRegion,
};
use crate::jobs::state::{JobStatus, PageStatus};
use crate::jobs::store::{JobRecord, JobStore, PageRecord};
use crate::services::detection::{DirectOutput, DirectTranslator, TextDetector};
use crate::services::inpaint::Inpainter;
use crate::services::translation::Translator;
use crate::services::typeset::Typesetter;
use crate::utils::{encode_preserving_format, load_image_from_memory_async};

/// The collaborators a coordinator drives. Held behind trait objects /
/// shared handles so tests can substitute any of them.
pub struct PipelineServices {
    pub detector: Arc<TextDetector>,
    pub translator: Arc<dyn Translator>,
    pub inpainter: Arc<Inpainter>,
    pub typesetter: Arc<Typesetter>,
    pub direct: Option<Arc<DirectTranslator>>,
}

pub struct JobCoordinator {
    store: Arc<JobStore>,
    services: PipelineServices,
    image_root: PathBuf,
    default_backend: String,
    target_language: String,
}

impl JobCoordinator {
    pub fn new(store: Arc<JobStore>, services: PipelineServices, config: &Config) -> Self {
        Self {
            store,
            services,
            image_root: PathBuf::from(config.image_root()),
            default_backend: config.default_backend().to_string(),
            target_language: config.target_language().to_string(),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Move a pending job into processing and hand back the page ids to
    /// enqueue. Any error here is job-fatal; the caller records it with
    /// `fail_job`.
    #[instrument(skip(self))]
    pub async fn dispatch_job(&self, job_id: &str) -> PipelineResult<Vec<i64>> {
        let job = self.store.get_job(job_id)?;
        if job.status == JobStatus::Pending {
            self.store.set_job_status(job_id, JobStatus::Processing)?;
        }

        let pending = self.store.pending_page_ids(job_id)?;
        if pending.is_empty() {
            // Nothing left to run; settle the counters and finalize if every
            // page already reached a terminal state.
            let status = self.store.recompute_counters(job_id)?;
            debug!(%status, "job has no pending pages");
            return Ok(Vec::new());
        }

        info!(pages = pending.len(), "job dispatched");
        Ok(pending)
    }

    /// One page, end to end. Transitions the page row, runs the pipeline,
    /// records the outcome, then re-derives the job counters. The error is
    /// re-raised for the retry layer after being recorded on the row.
    #[instrument(skip(self), fields(page_id))]
    pub async fn process_page(&self, page_id: i64) -> PipelineResult<()> {
        let page = self.store.get_page(page_id)?;
        let job = self.store.get_job(&page.job_id)?;
        self.store.set_page_status(page_id, PageStatus::Processing)?;

        let started = Instant::now();
        let outcome = self.run_page(&job, &page).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(translated_path) => {
                self.store
                    .complete_page(page_id, translated_path.as_deref(), elapsed)?;
                self.store.recompute_counters(&page.job_id)?;
                info!(page_id, secs = elapsed, "page completed");
                Ok(())
            }
            Err(e) => {
                self.store.mark_page_failed(page_id, &e.to_string())?;
                self.store.recompute_counters(&page.job_id)?;
                warn!(page_id, error = %e, "page failed");
                Err(e)
            }
        }
    }

    /// The page pipeline proper. Returns the translated image path relative
    /// to the image root, or None when the page keeps its original pixels.
    async fn run_page(&self, job: &JobRecord, page: &PageRecord) -> PipelineResult<Option<String>> {
        let source = self.image_root.join(&page.original_path);
        let bytes = match tokio::fs::read(&source).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::MissingSourceFile {
                    path: page.original_path.clone(),
                });
            }
            Err(e) => {
                return Err(PipelineError::InputRead {
                    page_id: page.id,
                    source: e,
                });
            }
        };

        let backend = job
            .detection_backend
            .clone()
            .unwrap_or_else(|| self.default_backend.clone());

        if backend == "direct" {
            return self.run_direct(job, page, &bytes).await;
        }

        // Manga pages read right to left; everything else top-left first.
        let rtl = job.source_language.starts_with("ja");
        let payload = self
            .services
            .detector
            .detect_text_with_grouping(&bytes, Some(&backend), &job.source_language, rtl)
            .await
            .with_page(page.id)?;

        // Persisted before translation so a later failure never loses the
        // detection work.
        self.store.save_detection_payload(page.id, &payload)?;

        if payload.regions.is_empty() {
            debug!(page_id = page.id, "no text found, copying through");
            let path = self.output_path(job, page);
            self.write_output(page.id, &path, &bytes).await?;
            return Ok(Some(path));
        }

        if job.skip_translation {
            let path = self.output_path(job, page);
            self.write_output(page.id, &path, &bytes).await?;
            return Ok(Some(path));
        }

        let translated = self.translate_groups(job, page, &payload).await?;
        self.store.save_translation_payload(page.id, &translated)?;

        if !job.overwrite_text {
            // Reference-only mode: original pixels stay, translations are
            // stored on the row.
            return Ok(None);
        }

        let output = self
            .compose_page(job, page, &bytes, &payload, &translated)
            .await?;
        let path = self.output_path(job, page);
        self.write_output(page.id, &path, &output).await?;
        Ok(Some(path))
    }

    /// Direct image-replacement branch: the provider either hands back a
    /// finished page or a region list we route through inpaint + typeset.
    async fn run_direct(
        &self,
        job: &JobRecord,
        page: &PageRecord,
        bytes: &[u8],
    ) -> PipelineResult<Option<String>> {
        let direct = self.services.direct.as_ref().ok_or_else(|| {
            PipelineError::Detection {
                page_id: page.id,
                source: crate::core::errors::DetectionError::UnknownBackend(
                    "direct backend not configured".to_string(),
                ),
            }
        })?;

        let output = direct
            .translate_page(bytes, &job.source_language, &self.target_language)
            .await
            .with_page(page.id)?;

        match output {
            DirectOutput::FullImage { bytes: image, .. } => {
                let path = self.output_path(job, page);
                self.write_output(page.id, &path, &image).await?;
                Ok(Some(path))
            }
            DirectOutput::RegionList(regions) => {
                self.store.save_translation_payload(page.id, &regions)?;
                let payload = DetectionPayload::default();
                let output = self
                    .compose_page(job, page, bytes, &payload, &regions)
                    .await?;
                let path = self.output_path(job, page);
                self.write_output(page.id, &path, &output).await?;
                Ok(Some(path))
            }
        }
    }

    /// Translate each group's newline-joined member text, in reading order.
    async fn translate_groups(
        &self,
        job: &JobRecord,
        page: &PageRecord,
        payload: &DetectionPayload,
    ) -> PipelineResult<Vec<TranslatedRegion>> {
        let mut translated = Vec::with_capacity(payload.bubble_groups.len());
        for group in &payload.bubble_groups {
            let text = group
                .region_indices
                .iter()
                .filter_map(|&i| payload.regions.get(i))
                .map(|r| r.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if text.trim().is_empty() {
                continue;
            }
            let confidence = {
                let members: Vec<f32> = group
                    .region_indices
                    .iter()
                    .filter_map(|&i| payload.regions.get(i))
                    .map(|r| r.confidence)
                    .collect();
                if members.is_empty() {
                    1.0
                } else {
                    members.iter().sum::<f32>() / members.len() as f32
                }
            };
            let output = self
                .services
                .translator
                .translate(&text, &job.source_language, &job.glossary)
                .await
                .with_page(page.id)?;
            translated.push(TranslatedRegion {
                text: output,
                bbox: group.bbox,
                confidence,
            });
        }
        Ok(translated)
    }

    /// Inpaint the original text boxes and typeset the translated ones,
    /// preserving the page's encoding.
    async fn compose_page(
        &self,
        job: &JobRecord,
        page: &PageRecord,
        bytes: &[u8],
        payload: &DetectionPayload,
        translated: &[TranslatedRegion],
    ) -> PipelineResult<Vec<u8>> {
        let format = image::guess_format(bytes).unwrap_or(ImageFormat::Png);
        let decoded = load_image_from_memory_async(bytes).await.map_err(|source| {
            PipelineError::ImageLoad {
                page_id: page.id,
                source,
            }
        })?;

        // Inpaint always runs over the original detected boxes (or the
        // direct provider's boxes when no detection ran) so removal stays
        // clean even for groups whose translation was skipped.
        let boxes: Vec<BBox> = if payload.regions.is_empty() {
            translated.iter().map(|r| r.bbox).collect()
        } else {
            payload.regions.iter().map(|r| r.bbox).collect()
        };
        let cleaned = self
            .services
            .inpainter
            .clean_text(&decoded, &boxes, job.text_removal)
            .await
            .with_page(page.id)?;

        let cleaned_bytes = encode_preserving_format(&cleaned, format).map_err(|source| {
            PipelineError::ImageLoad {
                page_id: page.id,
                source,
            }
        })?;

        let overrides = TypesetOverrides {
            regions: translated
                .iter()
                .map(|r| TypesetRegion::from_translation(r.bbox, r.text.clone()))
                .collect(),
            strokes: Vec::new(),
        };
        self.services
            .typesetter
            .render_page(&cleaned_bytes, &overrides)
            .await
            .with_page(page.id)
    }

    /// Manual re-render of a page from its stored overrides, producing the
    /// typeset output next to the translated one.
    #[instrument(skip(self))]
    pub async fn typeset_page(&self, page_id: i64) -> PipelineResult<String> {
        let page = self.store.get_page(page_id)?;
        let job = self.store.get_job(&page.job_id)?;
        let overrides = page.typeset_overrides.clone().unwrap_or_default();

        // Re-render on top of the cleaned page when one exists, otherwise
        // the original.
        let base_rel = page
            .translated_path
            .clone()
            .unwrap_or_else(|| page.original_path.clone());
        let base = self.image_root.join(&base_rel);
        let bytes = tokio::fs::read(&base).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::MissingSourceFile { path: base_rel }
            } else {
                PipelineError::InputRead {
                    page_id,
                    source: e,
                }
            }
        })?;

        let rendered = self
            .services
            .typesetter
            .render_page(&bytes, &overrides)
            .await
            .with_page(page_id)?;

        let path = self.typeset_output_path(&job, &page);
        self.write_output(page_id, &path, &rendered).await?;
        self.store.set_typeset_path(page_id, &path)?;
        Ok(path)
    }

    fn output_path(&self, job: &JobRecord, page: &PageRecord) -> String {
        format!(
            "webtoons/{}/translated_{}",
            job.job_id, page.original_filename
        )
    }

    fn typeset_output_path(&self, job: &JobRecord, page: &PageRecord) -> String {
        format!("webtoons/{}/typeset_{}", job.job_id, page.original_filename)
    }

    async fn write_output(&self, page_id: i64, rel: &str, bytes: &[u8]) -> PipelineResult<()> {
        let path = self.image_root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PipelineError::OutputWrite { page_id, source })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| PipelineError::OutputWrite { page_id, source })
    }

    pub fn image_root(&self) -> &Path {
        &self.image_root
    }
}
