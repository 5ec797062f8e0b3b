use config::{Config, File};
use serde::Deserialize;

use crate::error::TracelensError;

#[derive(Debug, Deserialize, Clone)]
pub struct TracelensConfig {
    pub service: ServiceConfig,
    pub upstream: UpstreamConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the tracing-console backend the proxy forwards to.
    pub base_url: String,
    #[serde(default = "default_detail_path")]
    pub detail_path: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

fn default_detail_path() -> String {
    "/api/trace/detail".to_string()
}

fn default_search_path() -> String {
    "/api/trace/search".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Chat-completions endpoint base, e.g. "https://proxy.api.example.com".
    /// The client appends "/v1/chat/completions".
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub model: String,
    /// Fallback only — the TRACELENS_API_KEY env var takes precedence.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.8
}

fn default_llm_timeout() -> u64 {
    300
}

impl LlmConfig {
    /// Resolved API key: env var first, config file fallback.
    pub fn resolved_api_key(&self) -> String {
        std::env::var("TRACELENS_API_KEY").unwrap_or_else(|_| self.api_key.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
        }
    }
}

impl TracelensConfig {
    pub fn load(path: &str) -> Result<Self, TracelensError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        Ok(s.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg: TracelensConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [service]
                log_level = "info"

                [upstream]
                base_url = "http://portal.example.internal.com"

                [llm]
                endpoint = "https://proxy.api.example.com"
                model = "qwen3-32b"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.upstream.detail_path, "/api/trace/detail");
        assert_eq!(cfg.upstream.search_path, "/api/trace/search");
        assert_eq!(cfg.http.port, 8790);
        assert!((cfg.llm.temperature - 0.7).abs() < f32::EPSILON);
        assert!((cfg.llm.top_p - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.llm.frequency_penalty, 0.0);
        assert!(!cfg.llm.enable_thinking);
    }
}
