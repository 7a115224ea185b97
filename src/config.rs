use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const NIM_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
pub const DEFAULT_MODEL: &str = "moonshotai/kimi-k2.5";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Client model name -> remote model name. Unmapped names use `upstream.model`.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub skip: SkipConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_name")]
    pub name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Merged verbatim into every outbound request body.
    #[serde(default = "default_extra_body")]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPolicy {
    /// Answer 429 with `retry-after` immediately.
    Reject,
    /// Hold the request until a slot frees up.
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Window width in seconds.
    #[serde(default = "default_rate_window")]
    pub rate_window: u64,
    #[serde(default = "default_policy")]
    pub policy: RateLimitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipConfig {
    #[serde(default = "default_true")]
    pub quota_check: bool,
    #[serde(default = "default_true")]
    pub title_generation: bool,
    #[serde(default = "default_true")]
    pub suggestion_mode: bool,
    #[serde(default = "default_true")]
    pub filepath_extraction: bool,
    #[serde(default = "default_true")]
    pub fast_prefix_detection: bool,
}

/// Marker strings the short-circuit rules look for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_quota_marker")]
    pub quota_marker: String,
    #[serde(default = "default_title_markers")]
    pub title_markers: Vec<String>,
    #[serde(default = "default_suggestion_marker")]
    pub suggestion_marker: String,
    #[serde(default = "default_policy_marker")]
    pub policy_marker: String,
    #[serde(default = "default_prefix_scan_chars")]
    pub prefix_scan_chars: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_upstream_name() -> String {
    "nvidia_nim".to_string()
}

fn default_base_url() -> String {
    NIM_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_extra_body() -> serde_json::Map<String, serde_json::Value> {
    let mut body = serde_json::Map::new();
    body.insert(
        "chat_template_kwargs".to_string(),
        serde_json::json!({ "thinking": true }),
    );
    body
}

fn default_rate_limit() -> u32 {
    40
}

fn default_rate_window() -> u64 {
    60
}

fn default_policy() -> RateLimitPolicy {
    RateLimitPolicy::Reject
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_tokens() -> u64 {
    81_920
}

fn default_true() -> bool {
    true
}

fn default_quota_marker() -> String {
    "quota".to_string()
}

fn default_title_markers() -> Vec<String> {
    vec!["write a 5-10 word title".to_string()]
}

fn default_suggestion_marker() -> String {
    "[SUGGESTION MODE:".to_string()
}

fn default_policy_marker() -> String {
    "<policy_spec>".to_string()
}

fn default_prefix_scan_chars() -> usize {
    2048
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: default_upstream_name(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            extra_body: default_extra_body(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            rate_window: default_rate_window(),
            policy: default_policy(),
        }
    }
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for SkipConfig {
    fn default() -> Self {
        Self {
            quota_check: true,
            title_generation: true,
            suggestion_mode: true,
            filepath_extraction: true,
            fast_prefix_detection: true,
        }
    }
}

impl SkipConfig {
    pub fn none() -> Self {
        Self {
            quota_check: false,
            title_generation: false,
            suggestion_mode: false,
            filepath_extraction: false,
            fast_prefix_detection: false,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            quota_marker: default_quota_marker(),
            title_markers: default_title_markers(),
            suggestion_marker: default_suggestion_marker(),
            policy_marker: default_policy_marker(),
            prefix_scan_chars: default_prefix_scan_chars(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: UpstreamConfig::default(),
            models: HashMap::new(),
            limits: LimitsConfig::default(),
            params: ParamsConfig::default(),
            skip: SkipConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults and environment");
        Ok(Self::default())
    }

    /// Apply the installer-provided variables (`RATE_LIMIT`, `SKIP_QUOTA_CHECK`, ...).
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RATE_LIMIT") {
            self.limits.rate_limit = parse_number("RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("RATE_WINDOW") {
            self.limits.rate_window = parse_number("RATE_WINDOW", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_POLICY") {
            self.limits.policy = match v.trim().to_ascii_lowercase().as_str() {
                "reject" => RateLimitPolicy::Reject,
                "wait" => RateLimitPolicy::Wait,
                other => {
                    return Err(ProxyError::config(format!(
                        "RATE_LIMIT_POLICY must be 'reject' or 'wait', got '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = lookup("TEMPERATURE") {
            self.params.temperature = parse_number("TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("MAX_TOKENS") {
            self.params.max_tokens = parse_number("MAX_TOKENS", &v)?;
        }

        let flags: [(&str, &mut bool); 5] = [
            ("SKIP_QUOTA_CHECK", &mut self.skip.quota_check),
            ("SKIP_TITLE_GENERATION", &mut self.skip.title_generation),
            ("SKIP_SUGGESTION_MODE", &mut self.skip.suggestion_mode),
            ("SKIP_FILEPATH_EXTRACTION", &mut self.skip.filepath_extraction),
            ("FAST_PREFIX_DETECTION", &mut self.skip.fast_prefix_detection),
        ];
        for (name, slot) in flags {
            if let Some(v) = lookup(name) {
                *slot = parse_bool(name, &v)?;
            }
        }

        Ok(())
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.rate_limit == 0 {
            return Err(ProxyError::config("rate_limit must be at least 1"));
        }
        if self.limits.rate_window == 0 {
            return Err(ProxyError::config("rate_window must be at least 1 second"));
        }
        if !self.params.temperature.is_finite() || self.params.temperature < 0.0 {
            return Err(ProxyError::config(format!(
                "temperature must be a non-negative number, got {}",
                self.params.temperature
            )));
        }
        if self.params.max_tokens == 0 {
            return Err(ProxyError::config("max_tokens must be at least 1"));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ProxyError::config("upstream.base_url is empty"));
        }
        Ok(())
    }

    /// Resolve the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        match std::env::var(&self.upstream.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your provider API key.",
                self.upstream.api_key_env
            ))),
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.upstream.base_url.trim_end_matches('/'))
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.limits.rate_window)
    }

    /// Remote model for a client-facing model name.
    pub fn target_model(&self, requested: &str) -> String {
        self.models
            .get(requested)
            .cloned()
            .unwrap_or_else(|| self.upstream.model.clone())
    }
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ProxyError::config(format!("{name}='{raw}' is not a valid number: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ProxyError::config(format!(
            "{name}='{raw}' is not a boolean (use true/false)"
        ))),
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("kimigate.toml")];

    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("kimigate")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("kimigate").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("kimigate").join("config.toml"));
        }
    }

    if let Some(home) = dirs_path() {
        paths.push(home.join(".kimigate.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
