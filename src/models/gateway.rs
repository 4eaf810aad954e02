use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, SamplingParams, UiCache};
use crate::error::{EngineError, Result};
use crate::markers::strip_think;
use crate::models::endpoint::{ByteStream, ModelEndpoint, ModelInfo};
use crate::models::purpose::Purpose;
use crate::protocol::{ChatMessage, ChatRequest};
use crate::stream_decoder::StreamDecoder;

/// Model id used when neither the configuration nor the UI cache names one.
pub const FALLBACK_MODEL_ID: &str = "local-model";

const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);
const MODELS_MAX_RETRIES: u32 = 2;

struct ModelCache {
    models: Vec<ModelInfo>,
    last_fetch: Instant,
}

/// Routes requests by [`Purpose`] to a model id and an ordered list of
/// endpoints, moving to the next endpoint on connection errors and non-2xx
/// responses. Other errors stop the walk.
pub struct ModelGateway {
    endpoint: Arc<dyn ModelEndpoint>,
    config: EngineConfig,
    ui_cache: UiCache,
    models_cache: tokio::sync::Mutex<Option<ModelCache>>,
}

impl ModelGateway {
    pub fn new(config: EngineConfig, endpoint: Arc<dyn ModelEndpoint>) -> Self {
        Self {
            endpoint,
            config,
            ui_cache: UiCache::default(),
            models_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_ui_cache(mut self, ui_cache: UiCache) -> Self {
        self.ui_cache = ui_cache;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Configured id for `purpose`, then the model last picked in the UI,
    /// then [`FALLBACK_MODEL_ID`].
    pub fn resolve_model(&self, purpose: Purpose) -> String {
        self.config
            .models
            .get(&purpose)
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                self.ui_cache
                    .selected_model
                    .as_ref()
                    .filter(|id| !id.trim().is_empty())
            })
            .cloned()
            .unwrap_or_else(|| FALLBACK_MODEL_ID.to_string())
    }

    pub fn build_request(
        &self,
        purpose: Purpose,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> ChatRequest {
        ChatRequest::new(self.resolve_model(purpose), messages, params)
    }

    /// Open the primary streaming response. Errors surface to the caller
    /// once every endpoint has been tried.
    pub async fn open_stream(
        &self,
        purpose: Purpose,
        messages: &[ChatMessage],
        params: &SamplingParams,
        tools: Vec<Value>,
        exchange_id: u64,
    ) -> Result<StreamDecoder<ByteStream>> {
        let request = self.build_request(purpose, messages, params).with_tools(tools);
        let mut last_error = None;

        for base_url in self.config.endpoints_for(purpose) {
            match self
                .endpoint
                .open_stream(&base_url, &request, &self.config.api_key, None)
                .await
            {
                Ok(stream) => {
                    info!(purpose = %purpose, endpoint = %base_url, model = %request.model, exchange_id, "stream opened");
                    return Ok(StreamDecoder::new(exchange_id, stream));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(purpose = %purpose, endpoint = %base_url, error = %e, "endpoint failed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| EngineError::Config("no endpoints configured".to_string())))
    }

    /// Non-streaming completion for best-effort callers.
    ///
    /// Each endpoint gets `request_timeout`; reasoning blocks are stripped
    /// from the answer. Callers are expected to fall back on `Err`.
    pub async fn complete_text(
        &self,
        purpose: Purpose,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<String> {
        let request = self.build_request(purpose, messages, params);
        let timeout = self.config.request_timeout();
        let mut last_error = None;

        for base_url in self.config.endpoints_for(purpose) {
            let attempt = async {
                let stream = self
                    .endpoint
                    .open_stream(&base_url, &request, &self.config.api_key, Some(timeout))
                    .await?;
                let outcome = StreamDecoder::new(0, stream).drive(|_| {}).await;
                match outcome.error {
                    Some(e) => Err(e),
                    None => Ok(outcome.snapshot.text),
                }
            };

            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(text)) => {
                    debug!(purpose = %purpose, endpoint = %base_url, chars = text.len(), "completion finished");
                    return Ok(strip_think(&text).trim().to_string());
                }
                Ok(Err(e)) if e.is_recoverable() => {
                    warn!(purpose = %purpose, endpoint = %base_url, error = %e, "completion failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(purpose = %purpose, endpoint = %base_url, ?timeout, "completion timed out");
                    last_error = Some(EngineError::Timeout(timeout));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| EngineError::Config("no endpoints configured".to_string())))
    }

    /// Models advertised by the primary endpoint, cached for five minutes.
    /// After failed retries a stale cache is better than nothing.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut cache = self.models_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.last_fetch.elapsed() < MODELS_CACHE_TTL {
                return cached.models.clone();
            }
        }

        let base_url = self.config.endpoint.trim_end_matches('/').to_string();
        let mut retry_count = 0;
        loop {
            match self.endpoint.fetch_models(&base_url, &self.config.api_key).await {
                Ok(models) => {
                    info!(endpoint = %base_url, count = models.len(), "fetched models");
                    *cache = Some(ModelCache {
                        models: models.clone(),
                        last_fetch: Instant::now(),
                    });
                    return models;
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > MODELS_MAX_RETRIES {
                        warn!(endpoint = %base_url, error = %e, retries = MODELS_MAX_RETRIES, "giving up on model list");
                        break;
                    }
                    let delay = Duration::from_millis(500 * (1 << (retry_count - 1)));
                    debug!(error = %e, ?delay, "model list fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        match cache.as_ref() {
            Some(cached) => {
                warn!("using expired model cache");
                cached.models.clone()
            }
            None => Vec::new(),
        }
    }
}
