// Bounded LRU memo for translations. Identical (text, language, glossary)
// requests within a run are served from memory instead of re-hitting the
// provider; capacity is explicit and eviction is least-recently-used.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::types::GlossaryEntry;

pub struct TranslationMemo {
    inner: Mutex<LruCache<u64, String>>,
}

impl TranslationMemo {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Key over the full request identity. Glossary entries participate so a
    /// changed character name invalidates previous translations.
    fn key(text: &str, language: &str, glossary: &[GlossaryEntry]) -> u64 {
        let mut material = String::with_capacity(text.len() + language.len() + 16);
        material.push_str(language);
        material.push('\u{1f}');
        material.push_str(text);
        for entry in glossary {
            material.push('\u{1f}');
            material.push_str(&entry.source_name);
            material.push('=');
            material.push_str(&entry.target_name);
            if let Some(gender) = &entry.gender {
                material.push('/');
                material.push_str(gender);
            }
        }
        xxh3_64(material.as_bytes())
    }

    pub fn get(&self, text: &str, language: &str, glossary: &[GlossaryEntry]) -> Option<String> {
        self.inner
            .lock()
            .get(&Self::key(text, language, glossary))
            .cloned()
    }

    pub fn put(&self, text: &str, language: &str, glossary: &[GlossaryEntry], translated: String) {
        self.inner
            .lock()
            .put(Self::key(text, language, glossary), translated);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
