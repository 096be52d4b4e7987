//! Configuration management for fatwa-speaker-rs.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so a missing or partial file still yields a usable config.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const API_KEY_ENV: &str = "GEMINI_API_KEY";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a careful assistant answering questions about \
Islamic rulings. Answer only from published fatwas of the allowed sources, in plain spoken \
language suitable for reading aloud. After the answer, write the line \
OFFICIAL VERBATIM RECORD followed by the issuing institution, a line \"Fatwa ID: <id>\" and \
the exact quoted text of the fatwa.";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    pub allowed_domains: Vec<String>,
    pub history_turns: usize,
    pub max_retries: u32,
    pub backoff_unit_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            host: "https://generativelanguage.googleapis.com".into(),
            api_key: String::new(),
            model: "gemini-2.5-flash".into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            allowed_domains: vec![
                "darulifta-deoband.com".into(),
                "daruliftaa.com".into(),
                "askimam.org".into(),
                "islamqa.info".into(),
                "muftionline.co.za".into(),
            ],
            history_turns: 6,
            max_retries: 2,
            backoff_unit_ms: 1000,
            request_timeout_secs: 120,
        }
    }
}

impl GenerationConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub host: String,
    pub model: String,
    pub voice: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub auto_play: bool,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "https://generativelanguage.googleapis.com".into(),
            model: "gemini-2.5-flash-preview-tts".into(),
            voice: "Kore".into(),
            sample_rate: 24000,
            channels: 1,
            request_delay_ms: 150,
            request_timeout_secs: 30,
            auto_play: false,
        }
    }
}

impl SpeechConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub intro_greeting: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            intro_greeting: "Assalamu alaikum. Ask me a question and I will answer from \
                             published fatwas, with the official record quoted verbatim."
                .into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub generation: GenerationConfig,
    pub speech: SpeechConfig,
    pub conversation: ConversationConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/fatwa-speaker/config.yaml
    /// 3. /etc/fatwa-speaker/config.yaml
    ///
    /// An empty `generation.api_key` is filled from `GEMINI_API_KEY`.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::load_file(path);
        config.apply_env(std::env::var(API_KEY_ENV).ok());
        config
    }

    fn load_file(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/fatwa-speaker/config.yaml")),
                Some(PathBuf::from("/etc/fatwa-speaker/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }

    fn apply_env(&mut self, api_key: Option<String>) {
        if !self.generation.api_key.is_empty() {
            return;
        }
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.generation.api_key = key.trim().to_string();
        }
    }

    /// The speech API shares the generation key.
    pub fn api_key(&self) -> &str {
        &self.generation.api_key
    }
}
