// Direct image-replacement provider: ships the whole page out and receives
// either an already-translated image or a list of region/text pairs. The
// two shapes are modeled as a tagged result at the provider boundary so
// call sites never have to sniff payloads.

use base64::{engine::general_purpose, Engine};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{BBox, TranslatedRegion};

/// What the direct provider chose to return for a page.
#[derive(Debug, Clone)]
pub enum DirectOutput {
    /// A fully-translated replacement image.
    FullImage { bytes: Vec<u8>, mime: String },
    /// Region/text pairs the caller must route through inpaint + typeset.
    RegionList(Vec<TranslatedRegion>),
}

pub struct DirectTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl DirectTranslator {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: String) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    pub fn from_config(config: &Config) -> DetectionResult<Option<Self>> {
        if config.detection.direct_endpoint.is_empty() {
            return Ok(None);
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.detection.request_timeout_secs,
            ))
            .build()?;
        Ok(Some(Self::new(
            client,
            config.detection.direct_endpoint.clone(),
            config.detection.direct_api_key.clone(),
        )))
    }

    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn translate_page(
        &self,
        image_bytes: &[u8],
        source_language: &str,
        target_language: &str,
    ) -> DetectionResult<DirectOutput> {
        if self.api_key.is_empty() {
            return Err(DetectionError::Credentials(
                "no API key configured for the direct backend".to_string(),
            ));
        }

        let body = json!({
            "image": general_purpose::STANDARD.encode(image_bytes),
            "source_language": source_language,
            "target_language": target_language,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DetectionError::Provider(format!(
                "status {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let value: Value = response.json().await?;
        let output = parse_direct_response(&value)?;
        match &output {
            DirectOutput::FullImage { bytes, .. } => {
                debug!(bytes = bytes.len(), "direct provider returned a full image")
            }
            DirectOutput::RegionList(regions) => {
                debug!(regions = regions.len(), "direct provider returned regions")
            }
        }
        Ok(output)
    }
}

fn parse_direct_response(value: &Value) -> DetectionResult<DirectOutput> {
    if let Some(encoded) = value.get("image").and_then(Value::as_str) {
        let bytes = general_purpose::STANDARD.decode(encoded).map_err(|e| {
            DetectionError::MalformedResponse(format!("invalid image encoding: {e}"))
        })?;
        let mime = value
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        return Ok(DirectOutput::FullImage { bytes, mime });
    }

    let Some(items) = value.get("regions").and_then(Value::as_array) else {
        return Err(DetectionError::MalformedResponse(
            "response has neither 'image' nor 'regions'".to_string(),
        ));
    };

    let mut regions = Vec::new();
    for item in items {
        let text = item
            .get("translated_text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let bbox = item.get("bbox").ok_or_else(|| {
            DetectionError::MalformedResponse("region entry missing bbox".to_string())
        })?;
        let get = |key: &str| -> DetectionResult<i32> {
            bbox.get(key)
                .and_then(Value::as_i64)
                .map(|v| v as i32)
                .ok_or_else(|| {
                    DetectionError::MalformedResponse(format!("bbox missing '{key}'"))
                })
        };
        regions.push(TranslatedRegion {
            text: text.to_string(),
            bbox: BBox::new(get("x")?, get("y")?, get("w")?, get("h")?),
            confidence: item
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(1.0) as f32,
        });
    }
    Ok(DirectOutput::RegionList(regions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_field_wins_as_full_image() {
        let value = json!({
            "image": general_purpose::STANDARD.encode(b"fake png"),
            "mime_type": "image/webp",
        });
        match parse_direct_response(&value).unwrap() {
            DirectOutput::FullImage { bytes, mime } => {
                assert_eq!(bytes, b"fake png");
                assert_eq!(mime, "image/webp");
            }
            other => panic!("expected full image, got {other:?}"),
        }
    }

    #[test]
    fn region_list_shape_parses() {
        let value = json!({
            "regions": [
                { "bbox": { "x": 10, "y": 20, "w": 100, "h": 40 }, "translated_text": "Hi!" }
            ]
        });
        match parse_direct_response(&value).unwrap() {
            DirectOutput::RegionList(regions) => {
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].text, "Hi!");
                assert_eq!(regions[0].bbox, BBox::new(10, 20, 100, 40));
            }
            other => panic!("expected region list, got {other:?}"),
        }
    }

    #[test]
    fn neither_shape_is_malformed() {
        let err = parse_direct_response(&json!({ "status": "ok" })).unwrap_err();
        assert!(matches!(err, DetectionError::MalformedResponse(_)));
    }

    #[test]
    fn bad_base64_is_malformed() {
        let err = parse_direct_response(&json!({ "image": "!!!" })).unwrap_err();
        assert!(matches!(err, DetectionError::MalformedResponse(_)));
    }
}
