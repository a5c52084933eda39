// Translation collaborator. One request carries one dialogue group's text
// (member lines joined by newlines); the glossary rides along in the system
// prompt so character names stay consistent across pages.

pub mod memo;

pub use memo::TranslationMemo;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{TranslationError, TranslationResult};
use crate::core::types::GlossaryEntry;

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        glossary: &[GlossaryEntry],
    ) -> TranslationResult<String>;
}

/// Chat-completions style HTTP translator with a bounded retry loop and a
/// shared LRU memo in front of the provider.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    target_language: String,
    max_retries: u32,
    memo: Arc<TranslationMemo>,
}

impl HttpTranslator {
    pub fn from_config(config: &Config) -> TranslationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.translation.endpoint.clone(),
            api_key: config.translation.api_key.clone(),
            model: config.translation.model.clone(),
            target_language: config.translation.target_language.clone(),
            max_retries: config.translation.max_retries,
            memo: Arc::new(TranslationMemo::new(config.translation.memo_capacity)),
        })
    }

    fn system_prompt(&self, source_language: &str, glossary: &[GlossaryEntry]) -> String {
        let mut prompt = format!(
            "You are a professional comic translator. Translate the {} dialogue \
             into natural {}. Preserve line breaks. Reply with the translation \
             only, no commentary.",
            source_language, self.target_language
        );
        if !glossary.is_empty() {
            prompt.push_str("\nCharacter names must be rendered consistently:");
            for entry in glossary {
                match &entry.gender {
                    Some(gender) => prompt.push_str(&format!(
                        "\n- {} -> {} ({})",
                        entry.source_name, entry.target_name, gender
                    )),
                    None => prompt.push_str(&format!(
                        "\n- {} -> {}",
                        entry.source_name, entry.target_name
                    )),
                }
            }
        }
        prompt
    }

    async fn request_once(
        &self,
        text: &str,
        source_language: &str,
        glossary: &[GlossaryEntry],
    ) -> TranslationResult<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt(source_language, glossary) },
                { "role": "user", "content": text },
            ],
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
            return Err(TranslationError::Provider(format!(
                "status {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let value: Value = response.json().await?;
        let translated = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TranslationError::InvalidResponse(
                    "missing choices[0].message.content".to_string(),
                )
            })?;

        let translated = translated.trim();
        if translated.is_empty() {
            return Err(TranslationError::InvalidResponse(
                "provider returned an empty translation".to_string(),
            ));
        }
        Ok(translated.to_string())
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    #[instrument(skip(self, text, glossary), fields(chars = text.chars().count()))]
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        glossary: &[GlossaryEntry],
    ) -> TranslationResult<String> {
        if let Some(hit) = self.memo.get(text, source_language, glossary) {
            debug!("translation memo hit");
            return Ok(hit);
        }

        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();
        let attempts = self.max_retries.max(1);
        for attempt in 1..=attempts {
            match self.request_once(text, source_language, glossary).await {
                Ok(translated) => {
                    self.memo
                        .put(text, source_language, glossary, translated.clone());
                    return Ok(translated);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "translation attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(TranslationError::Exhausted {
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator(memo: Arc<TranslationMemo>) -> HttpTranslator {
        HttpTranslator {
            client: reqwest::Client::new(),
            endpoint: String::new(),
            api_key: String::new(),
            model: "test".to_string(),
            target_language: "English".to_string(),
            max_retries: 3,
            memo,
        }
    }

    #[test]
    fn system_prompt_lists_glossary_entries() {
        let t = translator(Arc::new(TranslationMemo::new(4)));
        let glossary = vec![
            GlossaryEntry {
                source_name: "지후".to_string(),
                target_name: "Jihu".to_string(),
                gender: Some("male".to_string()),
            },
            GlossaryEntry {
                source_name: "수아".to_string(),
                target_name: "Sua".to_string(),
                gender: None,
            },
        ];
        let prompt = t.system_prompt("Korean", &glossary);
        assert!(prompt.contains("지후 -> Jihu (male)"));
        assert!(prompt.contains("수아 -> Sua"));
        assert!(prompt.contains("English"));
    }

    #[test]
    fn system_prompt_without_glossary_has_no_name_section() {
        let t = translator(Arc::new(TranslationMemo::new(4)));
        let prompt = t.system_prompt("Korean", &[]);
        assert!(!prompt.contains("Character names"));
    }

    #[tokio::test]
    async fn memo_hit_short_circuits_the_provider() {
        // Endpoint is empty so any real request would error; a memo hit must
        // return before the request is attempted.
        let memo = Arc::new(TranslationMemo::new(4));
        memo.put("안녕", "ko", &[], "Hello".to_string());
        let t = translator(memo);
        let out = t.translate("안녕", "ko", &[]).await.unwrap();
        assert_eq!(out, "Hello");
    }
}
