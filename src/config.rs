use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-level configuration. The API key is required up front; a missing
/// key is a fatal startup error, not something to discover mid-session.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub api_key: String,
    pub api_base_url: String,
    pub model: String,
    pub runtime: RuntimeConfig,
}

/// Per-session tunables, overridable from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_turns: u32,
    pub session_minutes: u64,
    pub idle_timeout_ms: u64,
    pub keystroke_min_ms: u64,
    pub keystroke_max_ms: u64,
    pub requests_per_minute: u32,
    pub max_concurrent: usize,
    pub speed: f64,
    pub sim_start: Option<DateTime<Utc>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_turns: 60,
            session_minutes: 20,
            idle_timeout_ms: 1500,
            keystroke_min_ms: 40,
            keystroke_max_ms: 120,
            requests_per_minute: 20,
            max_concurrent: 4,
            speed: 1.0,
            sim_start: None,
        }
    }
}

impl Config {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aibbs")
        });

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let api_key = std::env::var("API_KEY")
            .context("API_KEY environment variable is required")?;

        Ok(Config {
            data_dir,
            api_key,
            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: "gpt-4o-mini".to_string(),
            runtime: RuntimeConfig::default(),
        })
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn personas_dir(&self) -> PathBuf {
        self.data_dir.join("personas")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_defaults() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.max_turns, 60);
        assert_eq!(runtime.session_minutes, 20);
        assert_eq!(runtime.idle_timeout_ms, 1500);
        assert!(runtime.keystroke_min_ms <= runtime.keystroke_max_ms);
    }
}
