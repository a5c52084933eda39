// Task queue: N worker tasks draining one mpsc channel. Job dispatch and
// page processing are independent task kinds; page failures retry with a
// growing delay when the error is retryable, and purged jobs drop their
// not-yet-started tasks at pickup time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::config::QueueConfig;
use crate::jobs::coordinator::JobCoordinator;

#[derive(Debug, Clone)]
pub enum Task {
    DispatchJob {
        job_id: String,
    },
    ProcessPage {
        job_id: String,
        page_id: i64,
        attempt: u32,
    },
}

pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    purged: Arc<SyncMutex<HashSet<String>>>,
    max_attempts: u32,
    retry_backoff_secs: u64,
}

impl TaskQueue {
    /// Spawn the worker pool and return the queue handle.
    pub fn start(coordinator: Arc<JobCoordinator>, config: &QueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let queue = Arc::new(Self {
            tx,
            purged: Arc::new(SyncMutex::new(HashSet::new())),
            max_attempts: config.max_attempts,
            retry_backoff_secs: config.retry_backoff_secs,
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let queue = Arc::clone(&queue);
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                debug!(worker_id, "queue worker started");
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => queue.handle(&coordinator, task).await,
                        None => break,
                    }
                }
                debug!(worker_id, "queue worker stopped");
            });
        }
        queue
    }

    pub fn enqueue_job(&self, job_id: &str) {
        self.send(Task::DispatchJob {
            job_id: job_id.to_string(),
        });
    }

    /// Drop this job's queued-but-not-started page tasks. Pages already in
    /// flight finish normally.
    pub fn purge_job(&self, job_id: &str) {
        self.purged.lock().insert(job_id.to_string());
        info!(job_id, "job purged from the queue");
    }

    fn is_purged(&self, job_id: &str) -> bool {
        self.purged.lock().contains(job_id)
    }

    fn send(&self, task: Task) {
        if self.tx.send(task).is_err() {
            error!("task queue is closed, task dropped");
        }
    }

    async fn handle(&self, coordinator: &JobCoordinator, task: Task) {
        match task {
            Task::DispatchJob { job_id } => match coordinator.dispatch_job(&job_id).await {
                Ok(page_ids) => {
                    for page_id in page_ids {
                        self.send(Task::ProcessPage {
                            job_id: job_id.clone(),
                            page_id,
                            attempt: 1,
                        });
                    }
                }
                Err(e) => {
                    error!(%job_id, error = %e, "job dispatch failed");
                    if let Err(store_err) = coordinator.store().fail_job(&job_id, &e.to_string())
                    {
                        error!(%job_id, error = %store_err, "could not record job failure");
                    }
                }
            },
            Task::ProcessPage {
                job_id,
                page_id,
                attempt,
            } => {
                if self.is_purged(&job_id) {
                    debug!(%job_id, page_id, "skipping page of purged job");
                    return;
                }
                match coordinator.process_page(page_id).await {
                    Ok(()) => {}
                    Err(e) if e.retryable() && attempt < self.max_attempts => {
                        let delay =
                            Duration::from_secs(self.retry_backoff_secs * attempt as u64);
                        warn!(
                            page_id,
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "page failed, scheduling retry"
                        );
                        if let Err(store_err) = coordinator.store().reset_page_for_rerun(page_id)
                        {
                            error!(page_id, error = %store_err, "retry reset failed");
                            return;
                        }
                        let _ = coordinator.store().recompute_counters(&job_id);
                        let tx = self.tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Task::ProcessPage {
                                job_id,
                                page_id,
                                attempt: attempt + 1,
                            });
                        });
                    }
                    Err(e) => {
                        // Already recorded on the page row; retries are spent
                        // or the error is permanent.
                        warn!(page_id, attempt, error = %e, "page failed permanently");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        Config, DetectionConfig, InpaintConfig, ServerConfig, StorageConfig, TranslationConfig,
    };
    use crate::core::errors::{DetectionResult, TranslationError, TranslationResult};
    use crate::core::types::{GlossaryEntry, Region};
    use crate::jobs::state::{JobStatus, PageStatus};
    use crate::jobs::store::{JobStore, NewJob};
    use crate::services::detection::{DetectionBackend, TextDetector};
    use crate::services::inpaint::Inpainter;
    use crate::services::translation::Translator;
    use crate::services::typeset::Typesetter;
    use crate::jobs::coordinator::PipelineServices;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(root: &Path, workers: usize, max_attempts: u32) -> Config {
        Config {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                log_level: tracing::Level::ERROR,
            },
            storage: StorageConfig {
                database_path: ":memory:".to_string(),
                image_root: root.to_string_lossy().into_owned(),
                fonts_dir: "/nonexistent/fonts".to_string(),
            },
            detection: DetectionConfig {
                default_backend: "stub".to_string(),
                rest_endpoint: String::new(),
                rest_api_key: String::new(),
                polling_endpoint: String::new(),
                polling_api_key: String::new(),
                credentials_path: None,
                direct_endpoint: String::new(),
                direct_api_key: String::new(),
                request_timeout_secs: 5,
                poll_timeout_secs: 5,
                poll_interval_ms: 100,
            },
            translation: TranslationConfig {
                endpoint: String::new(),
                api_key: String::new(),
                model: "test".to_string(),
                target_language: "English".to_string(),
                max_retries: 1,
                memo_capacity: 16,
            },
            inpaint: InpaintConfig {
                server_command: "/nonexistent/server".to_string(),
                server_port: 1,
                startup_wait_secs: 1,
                request_timeout_secs: 1,
            },
            queue: QueueConfig {
                workers,
                max_attempts,
                retry_backoff_secs: 0,
            },
        }
    }

    struct StubBackend(Vec<Region>);

    #[async_trait]
    impl DetectionBackend for StubBackend {
        async fn detect(&self, _image: &[u8], _language: &str) -> DetectionResult<Vec<Region>> {
            Ok(self.0.clone())
        }
    }

    struct CountingTranslator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Translator for CountingTranslator {
        async fn translate(
            &self,
            text: &str,
            _source_language: &str,
            _glossary: &[GlossaryEntry],
        ) -> TranslationResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TranslationError::Provider("quota".to_string()));
            }
            Ok(format!("[en] {text}"))
        }
    }

    fn build(
        config: &Config,
        regions: Vec<Region>,
        translator: Arc<CountingTranslator>,
    ) -> Arc<JobCoordinator> {
        let mut backends: HashMap<String, Arc<dyn DetectionBackend>> = HashMap::new();
        backends.insert("stub".to_string(), Arc::new(StubBackend(regions)));
        let services = PipelineServices {
            detector: Arc::new(TextDetector::with_backends(backends, "stub")),
            translator,
            inpainter: Arc::new(Inpainter::from_config(&config.inpaint).unwrap()),
            typesetter: Arc::new(Typesetter::new(config.fonts_dir()).unwrap()),
            direct: None,
        };
        Arc::new(JobCoordinator::new(
            Arc::new(JobStore::open_in_memory().unwrap()),
            services,
            config,
        ))
    }

    fn seed_pages(coordinator: &JobCoordinator, pages: usize) -> (String, Vec<i64>) {
        let store = coordinator.store();
        let job_id = store.create_job(&NewJob::default()).unwrap();
        for i in 0..pages {
            let rel = format!("webtoons/in/p{i}.png");
            let abs = coordinator.image_root().join(&rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
                80,
                80,
                image::Rgba([255, 255, 255, 255]),
            ));
            let mut bytes = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
            std::fs::write(abs, bytes).unwrap();
            store
                .add_page(&job_id, 1, i as i64, &format!("p{i}.png"), &rel)
                .unwrap();
        }
        store.submit_job(&job_id).unwrap();
        let pending = store.pending_page_ids(&job_id).unwrap();
        (job_id, pending)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn dispatch_runs_every_page_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 2, 3);
        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let regions = vec![Region::new(
            crate::core::types::BBox::new(10, 10, 40, 12),
            "안녕",
            0.9,
        )];
        let coordinator = build(&config, regions, translator);
        let (job_id, _) = seed_pages(&coordinator, 3);

        let queue = TaskQueue::start(Arc::clone(&coordinator), &config.queue);
        queue.enqueue_job(&job_id);

        let store = Arc::clone(coordinator.store());
        let check_id = job_id.clone();
        wait_for(move || {
            store
                .get_job(&check_id)
                .map(|j| j.status == JobStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        let job = coordinator.store().get_job(&job_id).unwrap();
        assert_eq!(job.processed_pages, 3);
        assert_eq!(job.failed_pages, 0);
    }

    #[tokio::test]
    async fn retryable_failure_consumes_the_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 3);
        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let regions = vec![Region::new(
            crate::core::types::BBox::new(10, 10, 40, 12),
            "안녕",
            0.9,
        )];
        let coordinator = build(&config, regions, Arc::clone(&translator));
        let (job_id, ids) = seed_pages(&coordinator, 1);

        let queue = TaskQueue::start(Arc::clone(&coordinator), &config.queue);
        queue.enqueue_job(&job_id);

        let store = Arc::clone(coordinator.store());
        let check_id = job_id.clone();
        wait_for(move || {
            store
                .get_job(&check_id)
                .map(|j| j.status == JobStatus::CompletedWithErrors)
                .unwrap_or(false)
        })
        .await;

        // The page ran exactly max_attempts times.
        assert_eq!(translator.calls.load(Ordering::SeqCst), 3);
        let page = coordinator.store().get_page(ids[0]).unwrap();
        assert_eq!(page.status, PageStatus::Failed);
    }

    #[tokio::test]
    async fn purged_job_pages_never_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1, 3);
        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let coordinator = build(&config, Vec::new(), translator);
        let (job_id, ids) = seed_pages(&coordinator, 1);
        coordinator
            .store()
            .set_job_status(&job_id, JobStatus::Processing)
            .unwrap();

        let queue = TaskQueue::start(Arc::clone(&coordinator), &config.queue);
        queue.purge_job(&job_id);
        queue.send(Task::ProcessPage {
            job_id: job_id.clone(),
            page_id: ids[0],
            attempt: 1,
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        let page = coordinator.store().get_page(ids[0]).unwrap();
        assert_eq!(page.status, PageStatus::Pending);
    }
}
