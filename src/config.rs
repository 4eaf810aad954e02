use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::purpose::Purpose;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_CONTINUATION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
pub const DEFAULT_MAX_PROJECT_LISTING: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub endpoint: String,
    pub fallback_endpoints: Vec<String>,
    pub api_key: String,
    /// Model id per purpose. Missing purposes fall through to the UI cache.
    pub models: HashMap<Purpose, String>,
    /// Endpoint override per purpose, tried before `endpoint`.
    pub endpoint_overrides: HashMap<Purpose, String>,
    pub request_timeout_secs: u64,
    pub continuation_timeout_secs: u64,
    pub debounce_ms: u64,
    pub max_tool_rounds: usize,
    pub max_project_listing: usize,
    pub resolver: ResolverConfig,
    pub sampling: SamplingParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            fallback_endpoints: Vec::new(),
            api_key: String::new(),
            models: HashMap::new(),
            endpoint_overrides: HashMap::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            continuation_timeout_secs: DEFAULT_CONTINUATION_TIMEOUT_SECS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_project_listing: DEFAULT_MAX_PROJECT_LISTING,
            resolver: ResolverConfig::default(),
            sampling: SamplingParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_secs(self.continuation_timeout_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Endpoints to try for `purpose`, in order, without duplicates.
    pub fn endpoints_for(&self, purpose: Purpose) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::new();
        let candidates = self
            .endpoint_overrides
            .get(&purpose)
            .into_iter()
            .chain(std::iter::once(&self.endpoint))
            .chain(self.fallback_endpoints.iter());
        for candidate in candidates {
            let trimmed = candidate.trim().trim_end_matches('/').to_string();
            if !trimmed.is_empty() && !endpoints.contains(&trimmed) {
                endpoints.push(trimmed);
            }
        }
        endpoints
    }

    /// Apply `POINTER_*` environment overrides (after `.env` is loaded).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("POINTER_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint;
            }
        }
        if self.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var("POINTER_API_KEY") {
                self.api_key = key;
            }
        }
        if let Ok(model) = std::env::var("POINTER_MODEL") {
            if !model.trim().is_empty() {
                self.models.entry(Purpose::Chat).or_insert(model);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Identifier occurrences an existing file needs before a snippet is
    /// attributed to it.
    pub min_identifier_matches: usize,
    /// Largest file (bytes) scanned by the project heuristic.
    pub max_scan_bytes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_identifier_matches: 2,
            max_scan_bytes: 512 * 1024,
        }
    }
}

/// Sampling parameters forwarded verbatim to the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl SamplingParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Settings the editor UI caches locally; only the model selection matters here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiCache {
    #[serde(default)]
    pub selected_model: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "pointer", "pointer")
}

pub fn default_engine_config_path() -> PathBuf {
    let Some(dirs) = project_dirs() else {
        return Path::new("pointer-config.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

pub fn default_ui_cache_path() -> PathBuf {
    let Some(dirs) = project_dirs() else {
        return Path::new("pointer-ui-cache.json").to_path_buf();
    };
    dirs.cache_dir().join("ui-cache.json")
}

/// Load the engine configuration, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_engine_config(path: &Path) -> EngineConfig {
    let Ok(bytes) = fs::read(path) else {
        return EngineConfig::default();
    };
    match serde_json::from_slice::<EngineConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            EngineConfig::default()
        }
    }
}

/// Load `.env`, the config file and environment overrides, in that order.
pub fn load_from_environment(path: &Path) -> EngineConfig {
    dotenvy::dotenv().ok();
    let mut config = load_engine_config(path);
    config.apply_env_overrides();
    config
}

pub fn save_engine_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(cfg).map_err(|e| EngineError::Config(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json)?;
    Ok(())
}

pub fn load_ui_cache(path: &Path) -> UiCache {
    let Ok(bytes) = fs::read(path) else {
        return UiCache::default();
    };
    serde_json::from_slice::<UiCache>(&bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_engine_config(&dir.path().join("absent.json"));
        assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.continuation_timeout_secs, 30);
        assert_eq!(config.resolver.min_identifier_matches, 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_missing_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"endpoint": "http://10.0.0.2:8080", "models": {"merge_missing": "x", "chat": "qwen"}}"#,
        )
        .unwrap();
        // Unknown purpose keys make the map invalid, so the whole file falls back.
        let config = load_engine_config(&path);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);

        fs::write(
            &path,
            r#"{"endpoint": "http://10.0.0.2:8080", "models": {"chat": "qwen"}}"#,
        )
        .unwrap();
        let config = load_engine_config(&path);
        assert_eq!(config.endpoint, "http://10.0.0.2:8080");
        assert_eq!(config.models.get(&Purpose::Chat).map(String::as_str), Some("qwen"));
        assert_eq!(config.max_tool_rounds, DEFAULT_MAX_TOOL_ROUNDS);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = EngineConfig::default();
        cfg.debounce_ms = 350;
        save_engine_config(&path, &cfg).unwrap();
        assert_eq!(load_engine_config(&path).debounce_ms, 350);
    }

    #[test]
    fn test_endpoints_for_orders_override_primary_fallbacks() {
        let mut cfg = EngineConfig::default();
        cfg.endpoint = "http://primary/".to_string();
        cfg.fallback_endpoints = vec!["http://backup".to_string(), "http://primary".to_string()];
        cfg.endpoint_overrides
            .insert(Purpose::Summary, "http://small-model".to_string());

        assert_eq!(
            cfg.endpoints_for(Purpose::Summary),
            vec!["http://small-model", "http://primary", "http://backup"]
        );
        assert_eq!(
            cfg.endpoints_for(Purpose::Chat),
            vec!["http://primary", "http://backup"]
        );
    }
}
