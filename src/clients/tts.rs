//! Text-to-speech client.
//!
//! # Responsibilities
//! - Synthesize speech through the TTS HTTP API under a circuit breaker
//! - Cache synthesized clips in memory (repeated prompts are common)
//! - List available voices
//!
//! # Design Decisions
//! - Playback is not this client's job; callers receive raw audio bytes and
//!   hand them to an `AudioSink`
//! - Synthesis is not queued for retry: a stale spoken response is worse
//!   than silence

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::schema::{ResilienceConfig, TtsConfig};
use crate::error::{BridgeError, Result};
use crate::resilience::{BreakerConfig, CircuitBreaker};

/// A voice offered by the TTS API.
#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    voices: Vec<Voice>,
}

struct ClipCache {
    clips: HashMap<u64, Arc<Vec<u8>>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl ClipCache {
    fn get(&mut self, key: u64) -> Option<Arc<Vec<u8>>> {
        self.clips.get(&key).cloned()
    }

    fn insert(&mut self, key: u64, clip: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        if self.clips.insert(key, clip).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.clips.remove(&oldest);
            }
        }
    }
}

/// Client for the text-to-speech API.
pub struct TtsClient {
    config: TtsConfig,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    cache: Mutex<ClipCache>,
    voices: Mutex<Option<Vec<Voice>>>,
}

impl TtsClient {
    pub const SERVICE: &'static str = "tts";

    pub fn new(config: &TtsConfig, resilience: &ResilienceConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BridgeError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            config: config.clone(),
            client,
            breaker: CircuitBreaker::new(BreakerConfig {
                name: Self::SERVICE.to_string(),
                failure_threshold: resilience.failure_threshold,
                recovery_timeout: Duration::from_secs(resilience.recovery_timeout_secs),
            }),
            cache: Mutex::new(ClipCache {
                clips: HashMap::new(),
                order: VecDeque::new(),
                capacity: config.cache_entries,
            }),
            voices: Mutex::new(None),
        }))
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Synthesize `text` with the configured voice. Cached clips skip the
    /// network entirely.
    pub async fn synthesize(&self, text: &str) -> Result<Arc<Vec<u8>>> {
        if !self.config.enabled {
            return Err(BridgeError::Configuration(
                "tts is disabled in configuration".to_string(),
            ));
        }

        let key = self.cache_key(text);
        if let Some(clip) = lock_cache(&self.cache).get(key) {
            tracing::debug!(chars = text.len(), "TTS cache hit");
            return Ok(clip);
        }

        let clip = self.breaker.call(|| self.request_synthesis(text)).await?;
        let clip = Arc::new(clip);
        lock_cache(&self.cache).insert(key, clip.clone());
        tracing::info!(chars = text.len(), bytes = clip.len(), "Synthesized speech");
        Ok(clip)
    }

    async fn request_synthesis(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v1/text-to-speech/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.voice_id
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .json(&json!({
                "text": text,
                "model_id": self.config.model_id,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Remote(format!(
                "tts API returned {status}: {body}"
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// List available voices. The first successful answer is cached.
    pub async fn voices(&self) -> Result<Vec<Voice>> {
        if let Some(cached) = self
            .voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(cached);
        }

        let voices = self.breaker.call(|| self.request_voices()).await?;
        *self.voices.lock().unwrap_or_else(|e| e.into_inner()) = Some(voices.clone());
        Ok(voices)
    }

    async fn request_voices(&self) -> Result<Vec<Voice>> {
        let url = format!("{}/v1/voices", self.config.api_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("xi-api-key", &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Remote(format!("tts API returned {status}")));
        }

        let parsed: VoicesResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Remote(format!("invalid voices response: {e}")))?;
        Ok(parsed.voices)
    }

    /// Whether the API currently answers.
    pub async fn health(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.breaker.call(|| self.request_voices()).await.is_ok()
    }

    pub fn breaker_stats(&self) -> crate::resilience::circuit_breaker::BreakerStats {
        self.breaker.stats()
    }

    fn cache_key(&self, text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        self.config.voice_id.hash(&mut hasher);
        self.config.model_id.hash(&mut hasher);
        hasher.finish()
    }
}

fn lock_cache(cache: &Mutex<ClipCache>) -> std::sync::MutexGuard<'_, ClipCache> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = ClipCache {
            clips: HashMap::new(),
            order: VecDeque::new(),
            capacity: 2,
        };

        cache.insert(1, Arc::new(vec![1]));
        cache.insert(2, Arc::new(vec![2]));
        cache.insert(3, Arc::new(vec![3]));

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_cache_key_varies_with_text() {
        let config = TtsConfig {
            voice_id: "v1".to_string(),
            ..TtsConfig::default()
        };
        let client = TtsClient::new(&config, &ResilienceConfig::default()).unwrap();
        assert_ne!(client.cache_key("hello"), client.cache_key("goodbye"));
        assert_eq!(client.cache_key("hello"), client.cache_key("hello"));
    }

    #[tokio::test]
    async fn test_disabled_synthesis_is_configuration_error() {
        let client = TtsClient::new(&TtsConfig::default(), &ResilienceConfig::default()).unwrap();
        let result = client.synthesize("hello").await;
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }
}
