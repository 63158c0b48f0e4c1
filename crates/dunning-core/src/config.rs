//! Dunning configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DunningError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DunningConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl DunningConfig {
    /// Load config from the default path (~/.dunning/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DunningError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| DunningError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DunningError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Dunning home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dunning")
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let q = &self.quota;
        if q.hourly_cap == 0 || q.daily_cap == 0 {
            return Err(DunningError::Config("quota caps must be greater than zero".into()));
        }
        check_range("quota.cooldown_secs", q.cooldown_min_secs, q.cooldown_max_secs)?;

        let b = &self.behavior;
        check_range("behavior.message_gap_secs", b.message_gap_min_secs, b.message_gap_max_secs)?;
        check_range("behavior.batch_pause_secs", b.batch_pause_min_secs, b.batch_pause_max_secs)?;
        check_range("behavior.batch_size", b.batch_size_min as u64, b.batch_size_max as u64)?;
        check_range("behavior.keystroke_ms", b.keystroke_min_ms, b.keystroke_max_ms)?;
        check_range("behavior.word_pause_ms", b.word_pause_min_ms, b.word_pause_max_ms)?;
        check_range(
            "behavior.punctuation_pause_ms",
            b.punctuation_pause_min_ms,
            b.punctuation_pause_max_ms,
        )?;
        if b.batch_size_min == 0 {
            return Err(DunningError::Config("behavior.batch_size_min must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&b.typo_probability) {
            return Err(DunningError::Config(
                "behavior.typo_probability must be within [0, 1]".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(DunningError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_secs.is_empty() {
            return Err(DunningError::Config("retry.backoff_secs must not be empty".into()));
        }
        if self.session.reconnect_backoff_secs.is_empty() {
            return Err(DunningError::Config(
                "session.reconnect_backoff_secs must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn check_range(name: &str, min: u64, max: u64) -> Result<()> {
    if min > max {
        return Err(DunningError::Config(format!(
            "{name}: minimum ({min}) is greater than maximum ({max})"
        )));
    }
    Ok(())
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Dispatch quota caps and cooldown range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: u32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    #[serde(default = "default_cooldown_min")]
    pub cooldown_min_secs: u64,
    #[serde(default = "default_cooldown_max")]
    pub cooldown_max_secs: u64,
}

fn default_hourly_cap() -> u32 { 50 }
fn default_daily_cap() -> u32 { 200 }
fn default_cooldown_min() -> u64 { 30 * 60 }
fn default_cooldown_max() -> u64 { 60 * 60 }

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            hourly_cap: default_hourly_cap(),
            daily_cap: default_daily_cap(),
            cooldown_min_secs: default_cooldown_min(),
            cooldown_max_secs: default_cooldown_max(),
        }
    }
}

/// Human-like pacing and typing simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Fixed RNG seed; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_gap_min")]
    pub message_gap_min_secs: u64,
    #[serde(default = "default_gap_max")]
    pub message_gap_max_secs: u64,
    #[serde(default = "default_batch_pause_min")]
    pub batch_pause_min_secs: u64,
    #[serde(default = "default_batch_pause_max")]
    pub batch_pause_max_secs: u64,
    #[serde(default = "default_batch_size_min")]
    pub batch_size_min: u32,
    #[serde(default = "default_batch_size_max")]
    pub batch_size_max: u32,
    #[serde(default = "default_keystroke_min")]
    pub keystroke_min_ms: u64,
    #[serde(default = "default_keystroke_max")]
    pub keystroke_max_ms: u64,
    #[serde(default = "default_word_pause_min")]
    pub word_pause_min_ms: u64,
    #[serde(default = "default_word_pause_max")]
    pub word_pause_max_ms: u64,
    #[serde(default = "default_punct_pause_min")]
    pub punctuation_pause_min_ms: u64,
    #[serde(default = "default_punct_pause_max")]
    pub punctuation_pause_max_ms: u64,
    #[serde(default = "default_typo_probability")]
    pub typo_probability: f64,
}

fn bool_true() -> bool { true }
fn default_gap_min() -> u64 { 15 }
fn default_gap_max() -> u64 { 45 }
fn default_batch_pause_min() -> u64 { 120 }
fn default_batch_pause_max() -> u64 { 300 }
fn default_batch_size_min() -> u32 { 2 }
fn default_batch_size_max() -> u32 { 10 }
fn default_keystroke_min() -> u64 { 50 }
fn default_keystroke_max() -> u64 { 150 }
fn default_word_pause_min() -> u64 { 200 }
fn default_word_pause_max() -> u64 { 600 }
fn default_punct_pause_min() -> u64 { 300 }
fn default_punct_pause_max() -> u64 { 900 }
fn default_typo_probability() -> f64 { 0.02 }

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
            message_gap_min_secs: default_gap_min(),
            message_gap_max_secs: default_gap_max(),
            batch_pause_min_secs: default_batch_pause_min(),
            batch_pause_max_secs: default_batch_pause_max(),
            batch_size_min: default_batch_size_min(),
            batch_size_max: default_batch_size_max(),
            keystroke_min_ms: default_keystroke_min(),
            keystroke_max_ms: default_keystroke_max(),
            word_pause_min_ms: default_word_pause_min(),
            word_pause_max_ms: default_word_pause_max(),
            punctuation_pause_min_ms: default_punct_pause_min(),
            punctuation_pause_max_ms: default_punct_pause_max(),
            typo_probability: default_typo_probability(),
        }
    }
}

/// Transient-failure retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait before attempt N+1, indexed by N-1. The last entry repeats.
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff() -> Vec<u64> { vec![2, 8, 30] }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff(),
        }
    }
}

/// Per-delivery timeouts and message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub document_timeout_secs: u64,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_currency")]
    pub currency_symbol: String,
}

fn default_timeout() -> u64 { 30 }
fn default_template() -> String {
    "Olá {name}, identificamos um valor em aberto de {amount} com vencimento em {due_date}. \
     Segue a fatura para regularização."
        .into()
}
fn default_currency() -> String { "R$".into() }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_timeout(),
            document_timeout_secs: default_timeout(),
            template: default_template(),
            currency_symbol: default_currency(),
        }
    }
}

/// Transport session recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: Vec<u64>,
}

fn default_reconnect_attempts() -> u32 { 3 }
fn default_reconnect_backoff() -> Vec<u64> { vec![5, 15, 30] }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_secs: default_reconnect_backoff(),
        }
    }
}

/// WhatsApp Business Cloud API credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default = "default_graph_base")]
    pub api_base: String,
}

fn default_graph_base() -> String { "https://graph.facebook.com/v21.0".into() }

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            api_base: default_graph_base(),
        }
    }
}

/// Billing-portal document retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub portal_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

fn default_download_dir() -> String { "~/.dunning/documents".into() }

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            portal_url: String::new(),
            api_token: String::new(),
            download_dir: default_download_dir(),
        }
    }
}

/// Run-state persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_attempt_log_capacity")]
    pub attempt_log_capacity: usize,
}

fn default_db_path() -> String { "~/.dunning/runs.db".into() }
fn default_attempt_log_capacity() -> usize { 500 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            attempt_log_capacity: default_attempt_log_capacity(),
        }
    }
}
