// Library exports for the webtoon page translation pipeline

pub mod analysis;
pub mod core;
pub mod jobs;
pub mod middleware;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        AnalysisError, ConfigError, DetectionError, InpaintError, PipelineError, StoreError,
        TranslationError, TypesetError,
    },
    types::{
        BBox, Bubble, DetectionPayload, GlossaryEntry, Group, Panel, ReadingMode, Region,
        RemovalMethod, Stroke, TranslatedRegion, TypesetOverrides, TypesetRegion,
    },
};

pub use analysis::{AnalyzerTuning, StructuralAnalyzer};

pub use jobs::{
    JobCoordinator, JobStatus, JobStore, NewJob, PageStatus, PipelineServices, TaskQueue,
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use services::{
    DirectOutput, DirectTranslator, HttpTranslator, Inpainter, TextDetector, TranslationMemo,
    Translator, Typesetter,
};

pub use utils::{crop_and_encode_png_async, load_image_from_memory_async};
