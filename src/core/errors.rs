// Custom error types for better error handling and debugging
//
// Using thiserror for ergonomic error definitions with:
// - Context preservation
// - Type-safe error matching
// - Automatic Display/Error trait implementations
// - Source error chaining

use thiserror::Error;

/// Structural analysis errors (bubbles/panels/grouping)
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },
}

/// Text-detection service errors
#[derive(Debug, Error)]
pub enum DetectionError {
    /// Credentials absent or unreadable — distinguishable from provider faults.
    #[error("Detection credentials missing or invalid: {0}")]
    Credentials(String),

    #[error("Detection provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Detection provider error: {0}")]
    Provider(String),

    #[error("Detection operation did not complete within {timeout_secs}s")]
    PollTimeout { timeout_secs: u64 },

    #[error("Malformed detection response: {0}")]
    MalformedResponse(String),

    #[error("Image decoding failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Unknown detection backend: {0}")]
    UnknownBackend(String),
}

/// Translation service errors
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Translation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Translation provider error: {0}")]
    Provider(String),

    #[error("Invalid translation response: {0}")]
    InvalidResponse(String),

    #[error("Translation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Inpainting service errors
#[derive(Debug, Error)]
pub enum InpaintError {
    #[error("Inpainting server failed to start: {0}")]
    ServerStartFailed(String),

    #[error("Inpainting server did not become healthy within {wait_secs}s")]
    ServerUnhealthy { wait_secs: u64 },

    #[error("Inpainting request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inpainting server returned status {0}")]
    ServerStatus(u16),

    #[error("Malformed inpainting response: {0}")]
    MalformedResponse(String),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Inpainting I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Typesetting service errors
#[derive(Debug, Error)]
pub enum TypesetError {
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid color literal: {0}")]
    InvalidColor(String),
}

/// Job/Page store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Page not found: {0}")]
    PageNotFound(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}

/// Pipeline orchestration errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Detection failed on page {page_id}: {source}")]
    Detection {
        page_id: i64,
        #[source]
        source: DetectionError,
    },

    #[error("Translation failed on page {page_id}: {source}")]
    Translation {
        page_id: i64,
        #[source]
        source: TranslationError,
    },

    #[error("Inpainting failed on page {page_id}: {source}")]
    Inpaint {
        page_id: i64,
        #[source]
        source: InpaintError,
    },

    #[error("Typesetting failed on page {page_id}: {source}")]
    Typeset {
        page_id: i64,
        #[source]
        source: TypesetError,
    },

    #[error("Source image missing: {path}")]
    MissingSourceFile { path: String },

    #[error("Source read failed on page {page_id}: {source}")]
    InputRead {
        page_id: i64,
        #[source]
        source: std::io::Error,
    },

    #[error("Image loading failed on page {page_id}: {source}")]
    ImageLoad {
        page_id: i64,
        #[source]
        source: image::ImageError,
    },

    #[error("Output write failed on page {page_id}: {source}")]
    OutputWrite {
        page_id: i64,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// A missing source file is a permanent input problem and must not
    /// consume retry budget; everything else is treated as transient.
    pub fn retryable(&self) -> bool {
        !matches!(self, PipelineError::MissingSourceFile { .. })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Worker count must be > 0, got {0}")]
    InvalidWorkerCount(usize),

    #[error("Retry attempts must be >= 1, got {0}")]
    InvalidRetryAttempts(u32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid translation config: {0}")]
    InvalidTranslationConfig(String),

    #[error("Invalid inpainting config: {0}")]
    InvalidInpaintConfig(String),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),
}

// Convenience type aliases for Results
pub type AnalysisResult<T> = Result<T, AnalysisError>;
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type InpaintResult<T> = Result<T, InpaintError>;
pub type TypesetResult<T> = Result<T, TypesetError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

// Helper trait for attaching page context when lifting service errors
// into the pipeline error type.
pub trait PageContext<T> {
    fn with_page(self, page_id: i64) -> PipelineResult<T>;
}

impl<T> PageContext<T> for DetectionResult<T> {
    fn with_page(self, page_id: i64) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::Detection { page_id, source })
    }
}

impl<T> PageContext<T> for TranslationResult<T> {
    fn with_page(self, page_id: i64) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::Translation { page_id, source })
    }
}

impl<T> PageContext<T> for InpaintResult<T> {
    fn with_page(self, page_id: i64) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::Inpaint { page_id, source })
    }
}

impl<T> PageContext<T> for TypesetResult<T> {
    fn with_page(self, page_id: i64) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::Typeset { page_id, source })
    }
}
