// Pluggable OCR backends. Every backend normalizes its provider's geometry
// into (x, y, w, h) pixel rectangles with a [0,1] confidence; credential
// problems and provider faults surface as distinguishable error variants.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{BBox, Region};

/// Fixed confidence for providers that do not report one per line.
const REST_BACKEND_CONFIDENCE: f32 = 0.95;

#[async_trait]
pub trait DetectionBackend: Send + Sync {
    async fn detect(&self, image_bytes: &[u8], language: &str) -> DetectionResult<Vec<Region>>;
}

fn bbox_from_vertices(vertices: &[(i32, i32)]) -> Option<BBox> {
    let min_x = vertices.iter().map(|v| v.0).min()?;
    let min_y = vertices.iter().map(|v| v.1).min()?;
    let max_x = vertices.iter().map(|v| v.0).max()?;
    let max_y = vertices.iter().map(|v| v.1).max()?;
    if max_x <= min_x || max_y <= min_y {
        return None;
    }
    Some(BBox::new(min_x, min_y, max_x - min_x, max_y - min_y))
}

/// Shared single-shot REST call (annotate-style vision API).
async fn rest_detect(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    image_bytes: &[u8],
    language: &str,
) -> DetectionResult<Vec<Region>> {
    let body = json!({
        "requests": [{
            "image": { "content": general_purpose::STANDARD.encode(image_bytes) },
            "features": [{ "type": "TEXT_DETECTION" }],
            "imageContext": { "languageHints": [language] },
        }]
    });

    let response = client
        .post(endpoint)
        .query(&[("key", api_key)])
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DetectionError::Credentials(format!(
            "provider rejected credentials with status {}",
            status
        )));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(DetectionError::Provider(format!(
            "status {}: {}",
            status,
            text.chars().take(200).collect::<String>()
        )));
    }

    let value: Value = response.json().await?;
    parse_annotate_response(&value)
}

fn parse_annotate_response(value: &Value) -> DetectionResult<Vec<Region>> {
    let first = value
        .get("responses")
        .and_then(|r| r.get(0))
        .ok_or_else(|| DetectionError::MalformedResponse("missing responses[0]".to_string()))?;

    if let Some(err) = first.get("error") {
        return Err(DetectionError::Provider(err.to_string()));
    }

    let Some(annotations) = first.get("textAnnotations").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    // The first annotation is the page-level aggregate; the rest are the
    // individual text boxes.
    let mut regions = Vec::new();
    for ann in annotations.iter().skip(1) {
        let text = ann
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        let vertices: Vec<(i32, i32)> = ann
            .get("boundingPoly")
            .and_then(|p| p.get("vertices"))
            .and_then(Value::as_array)
            .map(|vs| {
                vs.iter()
                    .map(|v| {
                        (
                            v.get("x").and_then(Value::as_i64).unwrap_or(0) as i32,
                            v.get("y").and_then(Value::as_i64).unwrap_or(0) as i32,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(bbox) = bbox_from_vertices(&vertices) {
            regions.push(Region::new(bbox, text, REST_BACKEND_CONFIDENCE));
        }
    }
    Ok(regions)
}

/// Direct REST vision backend (single request, single response).
pub struct RestVisionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RestVisionBackend {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: String) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl DetectionBackend for RestVisionBackend {
    async fn detect(&self, image_bytes: &[u8], language: &str) -> DetectionResult<Vec<Region>> {
        if self.api_key.is_empty() {
            return Err(DetectionError::Credentials(
                "no API key configured for the rest backend".to_string(),
            ));
        }
        rest_detect(
            &self.client,
            &self.endpoint,
            &self.api_key,
            image_bytes,
            language,
        )
        .await
    }
}

/// Long-running-operation backend: submit the image, then poll the returned
/// operation location until it succeeds or the bounded wait expires.
pub struct PollingVisionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    poll_timeout: Duration,
    poll_interval: Duration,
}

impl PollingVisionBackend {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        api_key: String,
        poll_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            poll_timeout,
            poll_interval,
        }
    }

    fn parse_read_result(value: &Value) -> DetectionResult<Vec<Region>> {
        let mut regions = Vec::new();
        let read_results = value
            .get("analyzeResult")
            .and_then(|r| r.get("readResults"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                DetectionError::MalformedResponse("missing analyzeResult.readResults".to_string())
            })?;

        for page in read_results {
            let Some(lines) = page.get("lines").and_then(Value::as_array) else {
                continue;
            };
            for line in lines {
                let text = line
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if text.is_empty() {
                    continue;
                }
                // boundingBox is a flat [x1,y1,...,x4,y4] polygon.
                let coords: Vec<i32> = line
                    .get("boundingBox")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .map(|v| v.as_f64().unwrap_or(0.0).round() as i32)
                            .collect()
                    })
                    .unwrap_or_default();
                let vertices: Vec<(i32, i32)> =
                    coords.chunks_exact(2).map(|c| (c[0], c[1])).collect();

                let confidence = line
                    .get("words")
                    .and_then(Value::as_array)
                    .map(|words| {
                        let confidences: Vec<f64> = words
                            .iter()
                            .filter_map(|w| w.get("confidence").and_then(Value::as_f64))
                            .collect();
                        if confidences.is_empty() {
                            1.0
                        } else {
                            confidences.iter().sum::<f64>() / confidences.len() as f64
                        }
                    })
                    .unwrap_or(1.0) as f32;

                if let Some(bbox) = bbox_from_vertices(&vertices) {
                    regions.push(Region::new(bbox, text, confidence));
                }
            }
        }
        Ok(regions)
    }
}

#[async_trait]
impl DetectionBackend for PollingVisionBackend {
    async fn detect(&self, image_bytes: &[u8], language: &str) -> DetectionResult<Vec<Region>> {
        if self.api_key.is_empty() {
            return Err(DetectionError::Credentials(
                "no API key configured for the polling backend".to_string(),
            ));
        }

        let submit = self
            .client
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .query(&[("language", language)])
            .header("Content-Type", "application/octet-stream")
            .body(image_bytes.to_vec())
            .send()
            .await?;

        let status = submit.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(DetectionError::Credentials(format!(
                "provider rejected credentials with status {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(DetectionError::Provider(format!(
                "submit returned status {}",
                status
            )));
        }

        let operation_url = submit
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                DetectionError::MalformedResponse("missing Operation-Location header".to_string())
            })?;

        let deadline = Instant::now() + self.poll_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if Instant::now() >= deadline {
                return Err(DetectionError::PollTimeout {
                    timeout_secs: self.poll_timeout.as_secs(),
                });
            }

            let poll = self
                .client
                .get(&operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .send()
                .await?;
            if !poll.status().is_success() {
                return Err(DetectionError::Provider(format!(
                    "poll returned status {}",
                    poll.status()
                )));
            }
            let value: Value = poll.json().await?;
            match value.get("status").and_then(Value::as_str) {
                Some("succeeded") => return Self::parse_read_result(&value),
                Some("failed") => {
                    return Err(DetectionError::Provider(
                        "operation reported failure".to_string(),
                    ))
                }
                Some(other) => debug!(status = other, "detection operation pending"),
                None => {
                    return Err(DetectionError::MalformedResponse(
                        "poll response missing status".to_string(),
                    ))
                }
            }
        }
    }
}

/// Backend authorized from a credentials JSON file on disk
/// (`{"endpoint": ..., "api_key": ...}`). The file is read per call so a
/// rotated key takes effect without a restart.
pub struct CredentialFileBackend {
    client: reqwest::Client,
    credentials_path: String,
}

impl CredentialFileBackend {
    pub fn new(client: reqwest::Client, credentials_path: String) -> Self {
        Self {
            client,
            credentials_path,
        }
    }

    fn load_credentials(&self) -> DetectionResult<(String, String)> {
        let raw = std::fs::read_to_string(&self.credentials_path).map_err(|e| {
            DetectionError::Credentials(format!(
                "cannot read {}: {}",
                self.credentials_path, e
            ))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            DetectionError::Credentials(format!(
                "invalid credentials file {}: {}",
                self.credentials_path, e
            ))
        })?;
        let endpoint = value
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DetectionError::Credentials("credentials file missing 'endpoint'".to_string())
            })?;
        let api_key = value.get("api_key").and_then(Value::as_str).ok_or_else(|| {
            DetectionError::Credentials("credentials file missing 'api_key'".to_string())
        })?;
        Ok((endpoint.to_string(), api_key.to_string()))
    }
}

#[async_trait]
impl DetectionBackend for CredentialFileBackend {
    async fn detect(&self, image_bytes: &[u8], language: &str) -> DetectionResult<Vec<Region>> {
        let (endpoint, api_key) = self.load_credentials()?;
        if api_key.is_empty() {
            warn!("credentials file has an empty api_key");
            return Err(DetectionError::Credentials(
                "credentials file has an empty api_key".to_string(),
            ));
        }
        rest_detect(&self.client, &endpoint, &api_key, image_bytes, language).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_normalizes_to_bbox() {
        let bbox = bbox_from_vertices(&[(10, 5), (110, 8), (108, 45), (12, 42)]).unwrap();
        assert_eq!((bbox.x, bbox.y), (10, 5));
        assert_eq!((bbox.w, bbox.h), (100, 40));
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        assert!(bbox_from_vertices(&[(10, 10), (10, 10)]).is_none());
        assert!(bbox_from_vertices(&[]).is_none());
    }

    #[test]
    fn annotate_response_skips_page_aggregate() {
        let value = json!({
            "responses": [{
                "textAnnotations": [
                    { "description": "ALL TEXT", "boundingPoly": { "vertices": [
                        {"x": 0, "y": 0}, {"x": 500, "y": 0},
                        {"x": 500, "y": 500}, {"x": 0, "y": 500}
                    ]}},
                    { "description": "hello", "boundingPoly": { "vertices": [
                        {"x": 10, "y": 10}, {"x": 60, "y": 10},
                        {"x": 60, "y": 30}, {"x": 10, "y": 30}
                    ]}}
                ]
            }]
        });
        let regions = parse_annotate_response(&value).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].text, "hello");
        assert_eq!(regions[0].bbox, BBox::new(10, 10, 50, 20));
        assert!((regions[0].confidence - REST_BACKEND_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn annotate_response_without_text_is_empty() {
        let value = json!({ "responses": [{}] });
        assert!(parse_annotate_response(&value).unwrap().is_empty());
    }

    #[test]
    fn read_result_averages_word_confidence() {
        let value = json!({
            "analyzeResult": { "readResults": [{
                "lines": [{
                    "text": "안녕",
                    "boundingBox": [5, 5, 95, 5, 95, 25, 5, 25],
                    "words": [
                        { "confidence": 0.8 },
                        { "confidence": 0.6 }
                    ]
                }]
            }]}
        });
        let regions = PollingVisionBackend::parse_read_result(&value).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].bbox, BBox::new(5, 5, 90, 20));
        assert!((regions[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn missing_credentials_file_is_a_credentials_error() {
        let backend = CredentialFileBackend::new(
            reqwest::Client::new(),
            "/nonexistent/creds.json".to_string(),
        );
        let err = backend.load_credentials().unwrap_err();
        assert!(matches!(err, DetectionError::Credentials(_)));
    }
}
