use crate::core::errors::ConfigError;
use std::env;
use std::path::Path;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Storage paths (database, per-user image root, fonts)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: String,
    pub image_root: String,
    pub fonts_dir: String,
}

/// Text-detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Global default backend when neither job nor user picked one.
    pub default_backend: String,
    pub rest_endpoint: String,
    pub rest_api_key: String,
    pub polling_endpoint: String,
    pub polling_api_key: String,
    pub credentials_path: Option<String>,
    pub direct_endpoint: String,
    pub direct_api_key: String,
    pub request_timeout_secs: u64,
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

/// Translation configuration
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub target_language: String,
    pub max_retries: u32,
    pub memo_capacity: usize,
}

/// Quality-tier inpainting server configuration
#[derive(Debug, Clone)]
pub struct InpaintConfig {
    pub server_command: String,
    pub server_port: u16,
    pub startup_wait_secs: u64,
    pub request_timeout_secs: u64,
}

/// Task queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub detection: DetectionConfig,
    pub translation: TranslationConfig,
    pub inpaint: InpaintConfig,
    pub queue: QueueConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        // Parse log level
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        Ok(Self {
            server: ServerConfig {
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8080),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            storage: StorageConfig {
                database_path: env::var("DATABASE_PATH")
                    .unwrap_or_else(|_| "webtoon.db".to_string()),
                image_root: env::var("IMAGE_ROOT").unwrap_or_else(|_| "data/images".to_string()),
                fonts_dir: env::var("FONTS_DIR").unwrap_or_else(|_| "fonts".to_string()),
            },
            detection: DetectionConfig {
                default_backend: env::var("DETECTION_BACKEND")
                    .unwrap_or_else(|_| "rest".to_string()),
                rest_endpoint: env::var("DETECTION_REST_ENDPOINT").unwrap_or_default(),
                rest_api_key: env::var("DETECTION_REST_API_KEY").unwrap_or_default(),
                polling_endpoint: env::var("DETECTION_POLLING_ENDPOINT").unwrap_or_default(),
                polling_api_key: env::var("DETECTION_POLLING_API_KEY").unwrap_or_default(),
                credentials_path: env::var("DETECTION_CREDENTIALS_PATH")
                    .ok()
                    .filter(|s| !s.is_empty()),
                direct_endpoint: env::var("DETECTION_DIRECT_ENDPOINT").unwrap_or_default(),
                direct_api_key: env::var("DETECTION_DIRECT_API_KEY").unwrap_or_default(),
                request_timeout_secs: env::var("DETECTION_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
                poll_timeout_secs: env::var("DETECTION_POLL_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                poll_interval_ms: env::var("DETECTION_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            },
            translation: TranslationConfig {
                endpoint: env::var("TRANSLATION_ENDPOINT").unwrap_or_default(),
                api_key: env::var("TRANSLATION_API_KEY").unwrap_or_default(),
                model: env::var("TRANSLATION_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                target_language: env::var("TARGET_LANGUAGE")
                    .unwrap_or_else(|_| "English".to_string()),
                max_retries: env::var("TRANSLATION_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                memo_capacity: env::var("TRANSLATION_MEMO_CAPACITY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
            },
            inpaint: InpaintConfig {
                server_command: env::var("INPAINT_SERVER_COMMAND")
                    .unwrap_or_else(|_| "iopaint".to_string()),
                server_port: env::var("INPAINT_SERVER_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8081),
                startup_wait_secs: env::var("INPAINT_STARTUP_WAIT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                request_timeout_secs: env::var("INPAINT_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            },
            queue: QueueConfig {
                workers: env::var("QUEUE_WORKERS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| num_cpus::get().max(2)),
                max_attempts: env::var("QUEUE_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                retry_backoff_secs: env::var("QUEUE_RETRY_BACKOFF_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.queue.workers));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts(self.queue.max_attempts));
        }

        if self.detection.poll_timeout_secs == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "poll_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.detection.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        match self.detection.default_backend.as_str() {
            "rest" | "polling" | "credential" | "direct" => {}
            other => {
                return Err(ConfigError::InvalidDetectionConfig(format!(
                    "unknown default backend '{}'",
                    other
                )));
            }
        }

        if self.translation.memo_capacity == 0 {
            return Err(ConfigError::InvalidTranslationConfig(
                "memo_capacity must be > 0".to_string(),
            ));
        }

        if self.inpaint.startup_wait_secs == 0 {
            return Err(ConfigError::InvalidInpaintConfig(
                "startup_wait_secs must be > 0".to_string(),
            ));
        }

        // Validate database directory exists
        let db_path = Path::new(&self.storage.database_path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidStoragePath(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn database_path(&self) -> &str {
        &self.storage.database_path
    }

    pub fn image_root(&self) -> &str {
        &self.storage.image_root
    }

    pub fn fonts_dir(&self) -> &str {
        &self.storage.fonts_dir
    }

    pub fn default_backend(&self) -> &str {
        &self.detection.default_backend
    }

    pub fn target_language(&self) -> &str {
        &self.translation.target_language
    }

    pub fn workers(&self) -> usize {
        self.queue.workers
    }

    pub fn max_attempts(&self) -> u32 {
        self.queue.max_attempts
    }

    pub fn retry_backoff_secs(&self) -> u64 {
        self.queue.retry_backoff_secs
    }
}

// Note: No Default implementation because Config::new() can fail
// Users should explicitly call Config::new()? and handle errors
