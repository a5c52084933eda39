// Managed lifecycle for the quality-tier inpainting side process.
//
// The process is started lazily on first use, health-checked until ready,
// reused across calls, and killed on drop. All spawn/health state lives
// behind one async mutex so concurrent workers never race a double start.

use base64::{engine::general_purpose, Engine};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::config::InpaintConfig;
use crate::core::errors::{InpaintError, InpaintResult};

pub struct InpaintServer {
    command: String,
    port: u16,
    startup_wait_secs: u64,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl InpaintServer {
    pub fn new(config: &InpaintConfig) -> InpaintResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            command: config.server_command.clone(),
            port: config.server_port,
            startup_wait_secs: config.startup_wait_secs,
            client,
            child: Mutex::new(None),
        })
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn is_healthy(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url()))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Start the process if it is not already running and wait until its
    /// health endpoint answers.
    #[instrument(skip(self))]
    pub async fn ensure_running(&self) -> InpaintResult<()> {
        let mut guard = self.child.lock().await;

        if let Some(child) = guard.as_mut() {
            // try_wait is None while the process is still alive.
            if child.try_wait()?.is_none() && self.is_healthy().await {
                return Ok(());
            }
            warn!("inpainting server is down, restarting");
            let _ = child.kill().await;
            *guard = None;
        }

        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            InpaintError::ServerStartFailed("empty server command".to_string())
        })?;
        let child = Command::new(program)
            .args(parts)
            .arg("--port")
            .arg(self.port.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InpaintError::ServerStartFailed(e.to_string()))?;
        info!(command = %self.command, port = self.port, "inpainting server spawned");
        *guard = Some(child);

        for _ in 0..self.startup_wait_secs {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.is_healthy().await {
                debug!("inpainting server healthy");
                return Ok(());
            }
        }

        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
        Err(InpaintError::ServerUnhealthy {
            wait_secs: self.startup_wait_secs,
        })
    }

    /// One inpaint round trip: PNG image + PNG mask in, PNG image out.
    pub async fn inpaint(&self, image_png: &[u8], mask_png: &[u8]) -> InpaintResult<Vec<u8>> {
        let body = json!({
            "image": general_purpose::STANDARD.encode(image_png),
            "mask": general_purpose::STANDARD.encode(mask_png),
        });

        let response = self
            .client
            .post(format!("{}/inpaint", self.base_url()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(InpaintError::ServerStatus(status.as_u16()));
        }

        let value: Value = response.json().await?;
        let encoded = value
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| InpaintError::MalformedResponse("response missing image".to_string()))?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| InpaintError::MalformedResponse(format!("invalid image encoding: {e}")))
    }

    /// Kill the side process if it is running.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
            info!("inpainting server stopped");
        }
    }
}
