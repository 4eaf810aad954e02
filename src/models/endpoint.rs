use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::protocol::ChatRequest;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

/// Transport to one OpenAI-compatible server.
///
/// The gateway owns fallback and model selection; an endpoint only knows how
/// to talk to the base URL it is handed.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    /// POST a streaming chat completion. `timeout` bounds the whole request
    /// when set; the primary chat stream passes `None`.
    async fn open_stream(
        &self,
        base_url: &str,
        request: &ChatRequest,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> Result<ByteStream>;

    async fn fetch_models(&self, base_url: &str, api_key: &str) -> Result<Vec<ModelInfo>>;
}

pub struct HttpEndpoint {
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

fn with_auth(builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.trim().is_empty() {
        builder
    } else {
        builder.bearer_auth(api_key.trim())
    }
}

#[async_trait]
impl ModelEndpoint for HttpEndpoint {
    async fn open_stream(
        &self,
        base_url: &str,
        request: &ChatRequest,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> Result<ByteStream> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        debug!(url = %url, model = %request.model, "opening completion stream");

        let mut builder = with_auth(self.client.post(&url), api_key).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                endpoint: url,
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| EngineError::transport(&url, e)));
        Ok(Box::pin(stream))
    }

    async fn fetch_models(&self, base_url: &str, api_key: &str) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
        let response = with_auth(self.client.get(&url), api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::transport(&url, e))?;
        if !status.is_success() {
            return Err(EngineError::Status {
                endpoint: url,
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: ModelsResponse = serde_json::from_str(&text)?;
        Ok(parsed.data)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use futures_util::stream;
    use serde_json::json;

    use super::*;

    pub fn delta_frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    /// One scripted reply to `open_stream`.
    pub enum Reply {
        /// Each string becomes one SSE delta frame, followed by `[DONE]`.
        Deltas(Vec<String>),
        /// Deltas, then a transport failure.
        DeltasThenError(Vec<String>),
        /// Deltas, then the stream stays open forever.
        DeltasThenHang(Vec<String>),
        Status(u16),
        /// Deltas then `[DONE]`, each frame arriving after `gap`.
        Paced(Vec<String>, Duration),
        /// The request fails before any stream is opened.
        Fail(EngineError),
    }

    impl Reply {
        pub fn text(text: &str) -> Self {
            Reply::Deltas(vec![text.to_string()])
        }

        pub fn chunks(chunks: &[&str]) -> Self {
            Reply::Deltas(chunks.iter().map(|c| c.to_string()).collect())
        }
    }

    /// Endpoint that replays scripted replies in order and records requests.
    #[derive(Default)]
    pub struct ScriptedEndpoint {
        replies: Mutex<VecDeque<Reply>>,
        unreachable: HashSet<String>,
        pub requests: Mutex<Vec<(String, ChatRequest)>>,
        pub models: Mutex<Option<Vec<ModelInfo>>>,
        pub model_fetches: Mutex<usize>,
    }

    impl ScriptedEndpoint {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        pub fn with_unreachable(mut self, base_url: &str) -> Self {
            self.unreachable.insert(base_url.to_string());
            self
        }

        pub fn requests(&self) -> Vec<(String, ChatRequest)> {
            self.requests.lock().unwrap().clone()
        }

        pub fn remaining(&self) -> usize {
            self.replies.lock().unwrap().len()
        }
    }

    fn frames(deltas: Vec<String>) -> Vec<Result<Bytes>> {
        deltas
            .iter()
            .map(|d| Ok(Bytes::from(delta_frame(d))))
            .collect()
    }

    #[async_trait]
    impl ModelEndpoint for ScriptedEndpoint {
        async fn open_stream(
            &self,
            base_url: &str,
            request: &ChatRequest,
            _api_key: &str,
            _timeout: Option<Duration>,
        ) -> Result<ByteStream> {
            if self.unreachable.contains(base_url) {
                return Err(EngineError::transport(base_url, "connection refused"));
            }
            self.requests
                .lock()
                .unwrap()
                .push((base_url.to_string(), request.clone()));

            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Deltas(Vec::new()));

            let stream: ByteStream = match reply {
                Reply::Deltas(deltas) => {
                    let mut items = frames(deltas);
                    items.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
                    Box::pin(stream::iter(items))
                }
                Reply::DeltasThenError(deltas) => {
                    let mut items = frames(deltas);
                    items.push(Err(EngineError::transport(base_url, "connection reset")));
                    Box::pin(stream::iter(items))
                }
                Reply::DeltasThenHang(deltas) => {
                    Box::pin(stream::iter(frames(deltas)).chain(stream::pending()))
                }
                Reply::Paced(deltas, gap) => {
                    let mut items = frames(deltas);
                    items.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
                    Box::pin(stream::iter(items).then(move |item| async move {
                        tokio::time::sleep(gap).await;
                        item
                    }))
                }
                Reply::Fail(error) => return Err(error),
                Reply::Status(status) => {
                    return Err(EngineError::Status {
                        endpoint: base_url.to_string(),
                        status,
                        body: String::new(),
                    })
                }
            };
            Ok(stream)
        }

        async fn fetch_models(&self, base_url: &str, _api_key: &str) -> Result<Vec<ModelInfo>> {
            *self.model_fetches.lock().unwrap() += 1;
            self.models
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| EngineError::transport(base_url, "connection refused"))
        }
    }
}
