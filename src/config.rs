//! Trace configuration: layered defaults → profile preset → `TRACE_*`
//! environment variables → explicit caller overrides, frozen by `validate()`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TraceError};

/// Configuration presets for different environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Production,
    Development,
    Debug,
}

impl Profile {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Profile::Production),
            "development" => Ok(Profile::Development),
            "debug" => Ok(Profile::Debug),
            other => Err(TraceError::config(format!("unknown profile '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Production => "production",
            Profile::Development => "development",
            Profile::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    // Sampling
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default)]
    pub only_on_error: bool,

    // Queue and batching
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default)]
    pub block_on_run_end: bool,
    #[serde(default = "default_run_end_block_timeout_ms")]
    pub run_end_block_timeout_ms: u64,

    // Redaction
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,

    // Pipeline
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,

    // Storage
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    // API server
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub api_key_required: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_cors_origins")]
    pub api_cors_origins: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub api_rate_limit_per_min: u32,
}

fn default_sample_rate() -> f64 {
    0.1
}
fn default_queue_size() -> usize {
    1000
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_timeout_ms() -> u64 {
    1000
}
fn default_run_end_block_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_compression_level() -> u32 {
    6
}
fn default_max_blob_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_db_path() -> String {
    "tracevault.db".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_rate_limit() -> u32 {
    100
}

fn default_redact_keys() -> Vec<String> {
    [
        "password",
        "api_key",
        "token",
        "secret",
        "credential",
        "access_key",
        "private_key",
        "auth_token",
        "session_token",
        "authorization",
        "bearer",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        // SSN
        r"\d{3}-\d{2}-\d{4}".to_string(),
        // Credit card
        r"\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}".to_string(),
        // Long opaque tokens/keys
        r"[A-Za-z0-9]{32,}".to_string(),
        // Bearer tokens
        r"Bearer\s+[A-Za-z0-9\-._~+/]+=*".to_string(),
    ]
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            only_on_error: false,
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            block_on_run_end: false,
            run_end_block_timeout_ms: default_run_end_block_timeout_ms(),
            redact_keys: default_redact_keys(),
            redact_patterns: default_redact_patterns(),
            compression_enabled: true,
            compression_level: default_compression_level(),
            encryption_enabled: false,
            encryption_key: None,
            max_blob_bytes: default_max_blob_bytes(),
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            api_host: default_api_host(),
            api_port: default_api_port(),
            api_key_required: false,
            api_key: None,
            api_cors_origins: default_cors_origins(),
            api_rate_limit_per_min: default_rate_limit(),
        }
    }
}

impl TraceConfig {
    /// Defaults → `TRACE_PROFILE` preset → `TRACE_*` env overrides → validate.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(profile) = std::env::var("TRACE_PROFILE") {
            config.apply_profile(Profile::parse(&profile)?);
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Production preset: minimal overhead, compression on, encryption on
    /// when a key is present.
    pub fn production() -> Self {
        let mut c = Self::default();
        c.apply_profile(Profile::Production);
        c
    }

    /// Development preset: moderate sampling, no encryption.
    pub fn development() -> Self {
        let mut c = Self::default();
        c.apply_profile(Profile::Development);
        c
    }

    /// Debug preset: trace everything, one event per batch.
    pub fn debug() -> Self {
        let mut c = Self::default();
        c.apply_profile(Profile::Debug);
        c
    }

    pub fn apply_profile(&mut self, profile: Profile) {
        match profile {
            Profile::Production => {
                self.sample_rate = 0.01;
                self.queue_size = 1000;
                self.batch_size = 100;
                self.compression_enabled = true;
                self.compression_level = 6;
                if self.encryption_key.is_none() {
                    self.encryption_key = std::env::var("TRACE_ENCRYPTION_KEY").ok();
                }
                self.encryption_enabled = self.encryption_key.is_some();
            }
            Profile::Development => {
                self.sample_rate = 0.5;
                self.queue_size = 1000;
                self.batch_size = 50;
                self.compression_enabled = true;
                self.compression_level = 3;
                self.encryption_enabled = false;
            }
            Profile::Debug => {
                self.sample_rate = 1.0;
                self.queue_size = 2000;
                self.batch_size = 1;
                self.compression_enabled = false;
                self.encryption_enabled = false;
            }
        }
    }

    /// Apply `TRACE_*` environment variables. Malformed values are rejected
    /// rather than silently ignored.
    pub fn apply_env(&mut self) -> Result<()> {
        read_env("TRACE_SAMPLE_RATE", &mut self.sample_rate)?;
        read_env_bool("TRACE_ONLY_ON_ERROR", &mut self.only_on_error)?;
        read_env("TRACE_QUEUE_SIZE", &mut self.queue_size)?;
        read_env("TRACE_BATCH_SIZE", &mut self.batch_size)?;
        read_env("TRACE_BATCH_TIMEOUT", &mut self.batch_timeout_ms)?;
        read_env_bool("TRACE_BLOCK_ON_RUN_END", &mut self.block_on_run_end)?;
        read_env(
            "TRACE_RUN_END_BLOCK_TIMEOUT",
            &mut self.run_end_block_timeout_ms,
        )?;
        read_env_list("TRACE_REDACT_KEYS", &mut self.redact_keys);
        read_env_list("TRACE_REDACT_PATTERNS", &mut self.redact_patterns);
        read_env_bool("TRACE_COMPRESSION_ENABLED", &mut self.compression_enabled)?;
        read_env("TRACE_COMPRESSION_LEVEL", &mut self.compression_level)?;
        read_env_bool("TRACE_ENCRYPTION_ENABLED", &mut self.encryption_enabled)?;
        read_env_opt("TRACE_ENCRYPTION_KEY", &mut self.encryption_key);
        read_env("TRACE_MAX_BLOB_BYTES", &mut self.max_blob_bytes)?;
        read_env_str("TRACE_DB_PATH", &mut self.db_path);
        read_env("TRACE_RETENTION_DAYS", &mut self.retention_days)?;
        read_env_str("TRACE_API_HOST", &mut self.api_host);
        read_env("TRACE_API_PORT", &mut self.api_port)?;
        read_env_bool("TRACE_API_KEY_REQUIRED", &mut self.api_key_required)?;
        read_env_opt("TRACE_API_KEY", &mut self.api_key);
        read_env_list("TRACE_API_CORS_ORIGINS", &mut self.api_cors_origins);
        read_env("TRACE_API_RATE_LIMIT", &mut self.api_rate_limit_per_min)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(TraceError::config(format!(
                "sample_rate must be within 0.0..=1.0, got {}",
                self.sample_rate
            )));
        }
        if self.queue_size == 0 {
            return Err(TraceError::config("queue_size must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(TraceError::config("batch_size must be at least 1"));
        }
        if self.batch_timeout_ms == 0 {
            return Err(TraceError::config("batch_timeout_ms must be at least 1"));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(TraceError::config(format!(
                "compression_level must be within 1..=9, got {}",
                self.compression_level
            )));
        }
        if self.max_blob_bytes == 0 {
            return Err(TraceError::config("max_blob_bytes must be at least 1"));
        }
        for pattern in &self.redact_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                TraceError::config(format!("invalid redaction pattern '{pattern}': {e}"))
            })?;
        }
        if self.encryption_enabled {
            self.resolved_encryption_key()?;
        }
        if self.api_key_required && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(TraceError::config(
                "api_key is required when api_key_required is set",
            ));
        }
        Ok(())
    }

    /// Resolve the configured key material to a 32-byte AES-256 key.
    ///
    /// Accepted forms: 64 hex chars, base64 of exactly 32 bytes, or a
    /// passphrase of at least 8 characters (SHA-256 derived).
    pub fn resolved_encryption_key(&self) -> Result<[u8; 32]> {
        let raw = self
            .encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                TraceError::config("encryption_key is required when encryption is enabled")
            })?;

        if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut key = [0u8; 32];
            for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
                let hex = std::str::from_utf8(chunk).expect("ascii hex");
                key[i] = u8::from_str_radix(hex, 16)
                    .map_err(|e| TraceError::config(format!("invalid hex key: {e}")))?;
            }
            return Ok(key);
        }

        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(raw) {
            if decoded.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&decoded);
                return Ok(key);
            }
        }

        if raw.len() < 8 {
            return Err(TraceError::config(
                "encryption_key passphrase must be at least 8 characters",
            ));
        }
        Ok(Sha256::digest(raw.as_bytes()).into())
    }
}

fn read_env<T: std::str::FromStr>(var: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(var) {
        *target = value
            .trim()
            .parse()
            .map_err(|e| TraceError::config(format!("invalid {var}='{value}': {e}")))?;
    }
    Ok(())
}

fn read_env_bool(var: &str, target: &mut bool) -> Result<()> {
    if let Ok(value) = std::env::var(var) {
        *target = match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(TraceError::config(format!(
                    "invalid {var}='{other}': expected true/false"
                )))
            }
        };
    }
    Ok(())
}

fn read_env_str(var: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *target = value;
    }
}

fn read_env_opt(var: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = Some(value);
        }
    }
}

fn read_env_list(var: &str, target: &mut Vec<String>) {
    if let Ok(value) = std::env::var(var) {
        *target = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_validate() {
        TraceConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let mut c = TraceConfig::default();
        c.sample_rate = 1.5;
        assert!(c.validate().is_err());
        c.sample_rate = -0.1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_queue_and_batch() {
        let mut c = TraceConfig::default();
        c.queue_size = 0;
        assert!(c.validate().is_err());

        let mut c = TraceConfig::default();
        c.batch_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_bad_compression_level() {
        let mut c = TraceConfig::default();
        c.compression_level = 0;
        assert!(c.validate().is_err());
        c.compression_level = 10;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_invalid_redaction_pattern() {
        let mut c = TraceConfig::default();
        c.redact_patterns = vec!["[unclosed".to_string()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn encryption_requires_key() {
        let mut c = TraceConfig::default();
        c.encryption_enabled = true;
        assert!(c.validate().is_err());

        c.encryption_key = Some("short".to_string());
        assert!(c.validate().is_err(), "weak passphrase must be rejected");

        c.encryption_key = Some("a perfectly reasonable passphrase".to_string());
        c.validate().unwrap();
    }

    #[test]
    fn key_resolution_forms_agree_on_length() {
        let mut c = TraceConfig::default();
        c.encryption_enabled = true;

        c.encryption_key = Some("00".repeat(32));
        assert_eq!(c.resolved_encryption_key().unwrap(), [0u8; 32]);

        c.encryption_key = Some(base64::engine::general_purpose::STANDARD.encode([7u8; 32]));
        assert_eq!(c.resolved_encryption_key().unwrap(), [7u8; 32]);

        c.encryption_key = Some("passphrase-derived".to_string());
        let a = c.resolved_encryption_key().unwrap();
        let b = c.resolved_encryption_key().unwrap();
        assert_eq!(a, b, "derivation must be deterministic");
    }

    #[test]
    fn profile_presets() {
        let p = TraceConfig::production();
        assert_eq!(p.sample_rate, 0.01);
        assert!(p.compression_enabled);

        let d = TraceConfig::development();
        assert_eq!(d.sample_rate, 0.5);
        assert!(!d.encryption_enabled);

        let dbg = TraceConfig::debug();
        assert_eq!(dbg.sample_rate, 1.0);
        assert_eq!(dbg.batch_size, 1);
        assert!(!dbg.compression_enabled);
    }

    #[test]
    #[serial]
    fn env_overrides_and_rejects_malformed() {
        std::env::set_var("TRACE_SAMPLE_RATE", "0.25");
        std::env::set_var("TRACE_QUEUE_SIZE", "64");
        std::env::set_var("TRACE_REDACT_KEYS", "alpha, beta ,,gamma");
        let mut c = TraceConfig::default();
        c.apply_env().unwrap();
        assert_eq!(c.sample_rate, 0.25);
        assert_eq!(c.queue_size, 64);
        assert_eq!(c.redact_keys, vec!["alpha", "beta", "gamma"]);

        std::env::set_var("TRACE_QUEUE_SIZE", "not-a-number");
        let mut c = TraceConfig::default();
        assert!(c.apply_env().is_err());

        std::env::remove_var("TRACE_SAMPLE_RATE");
        std::env::remove_var("TRACE_QUEUE_SIZE");
        std::env::remove_var("TRACE_REDACT_KEYS");
    }

    #[test]
    #[serial]
    fn load_applies_profile_from_env() {
        std::env::set_var("TRACE_PROFILE", "debug");
        let c = TraceConfig::load().unwrap();
        assert_eq!(c.sample_rate, 1.0);
        assert_eq!(c.batch_size, 1);
        std::env::remove_var("TRACE_PROFILE");

        std::env::set_var("TRACE_PROFILE", "staging");
        assert!(TraceConfig::load().is_err());
        std::env::remove_var("TRACE_PROFILE");
    }
}
