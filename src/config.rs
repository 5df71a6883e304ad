//! Layered configuration (§10.3).
//!
//! TOML on disk plus `#[serde(default)]` on every nested struct so a
//! partial config file is always valid; API keys are never stored in the
//! file itself, only referenced by name and resolved through the OS
//! keyring (falling back to a restrictive-permission file) at call time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub carrier: CarrierSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub calendar: CalendarSection,
    #[serde(default)]
    pub sms: SmsSection,
    #[serde(default)]
    pub ivr: IvrSection,
    #[serde(default)]
    pub bandit: BanditSection,
    #[serde(default)]
    pub campaign: CampaignSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierSection {
    /// Keyring/file lookup key for the carrier API key, never the key itself.
    #[serde(default = "default_carrier_api_key_ref")]
    pub api_key_ref: String,
    #[serde(default = "default_carrier_base_url")]
    pub base_url: String,
    /// Public base URL the carrier posts call-status webhooks to.
    #[serde(default)]
    pub webhook_base_url: Option<String>,
    /// Keyring/file lookup key for the webhook HMAC signing secret.
    #[serde(default = "default_carrier_webhook_secret_ref")]
    pub webhook_signing_secret_ref: String,
    #[serde(default)]
    pub connection_id: Option<String>,
}

fn default_carrier_api_key_ref() -> String {
    "carrier-api-key".to_string()
}
fn default_carrier_base_url() -> String {
    "https://api.telnyx.com/v2".to_string()
}
fn default_carrier_webhook_secret_ref() -> String {
    "carrier-webhook-signing-secret".to_string()
}

impl Default for CarrierSection {
    fn default() -> Self {
        Self {
            api_key_ref: default_carrier_api_key_ref(),
            base_url: default_carrier_base_url(),
            webhook_base_url: None,
            webhook_signing_secret_ref: default_carrier_webhook_secret_ref(),
            connection_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersSection {
    #[serde(default = "default_realtime_api_key_ref")]
    pub realtime_api_key_ref: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_tts_api_key_ref")]
    pub tts_api_key_ref: String,
    #[serde(default = "default_tts_url")]
    pub tts_url: String,
    #[serde(default = "default_voice_id")]
    pub default_voice_id: String,
}

fn default_realtime_api_key_ref() -> String {
    "provider-realtime-api-key".to_string()
}
fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}
fn default_tts_api_key_ref() -> String {
    "provider-tts-api-key".to_string()
}
fn default_tts_url() -> String {
    "wss://api.elevenlabs.io/v1/text-to-speech/stream-input".to_string()
}
fn default_voice_id() -> String {
    "default".to_string()
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            realtime_api_key_ref: default_realtime_api_key_ref(),
            realtime_url: default_realtime_url(),
            tts_api_key_ref: default_tts_api_key_ref(),
            tts_url: default_tts_url(),
            default_voice_id: default_voice_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSection {
    #[serde(default = "default_calendar_api_key_ref")]
    pub api_key_ref: String,
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub default_event_type_id: Option<u64>,
}

fn default_calendar_api_key_ref() -> String {
    "calendar-api-key".to_string()
}
fn default_calendar_base_url() -> String {
    "https://api.cal.com/v2".to_string()
}

impl Default for CalendarSection {
    fn default() -> Self {
        Self {
            api_key_ref: default_calendar_api_key_ref(),
            base_url: default_calendar_base_url(),
            default_event_type_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSection {
    #[serde(default = "default_sms_api_key_ref")]
    pub api_key_ref: String,
    #[serde(default = "default_sms_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub default_sender_pool: Vec<String>,
}

fn default_sms_api_key_ref() -> String {
    "sms-api-key".to_string()
}
fn default_sms_base_url() -> String {
    "https://api.telnyx.com/v2".to_string()
}

impl Default for SmsSection {
    fn default() -> Self {
        Self {
            api_key_ref: default_sms_api_key_ref(),
            base_url: default_sms_base_url(),
            default_sender_pool: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrSection {
    #[serde(default = "default_loop_similarity_threshold")]
    pub loop_similarity_threshold: f64,
    #[serde(default = "default_consecutive_classifications")]
    pub consecutive_classifications: u32,
    #[serde(default = "default_dtmf_cooldown_ms")]
    pub dtmf_cooldown_ms: u64,
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,
}

fn default_loop_similarity_threshold() -> f64 {
    0.85
}
fn default_consecutive_classifications() -> u32 {
    2
}
fn default_dtmf_cooldown_ms() -> u64 {
    3000
}
fn default_ring_buffer_size() -> usize {
    5
}

impl Default for IvrSection {
    fn default() -> Self {
        Self {
            loop_similarity_threshold: default_loop_similarity_threshold(),
            consecutive_classifications: default_consecutive_classifications(),
            dtmf_cooldown_ms: default_dtmf_cooldown_ms(),
            ring_buffer_size: default_ring_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditSection {
    #[serde(default = "default_monte_carlo_draws")]
    pub monte_carlo_draws: u32,
    #[serde(default = "default_winner_threshold")]
    pub winner_threshold: f64,
    #[serde(default = "default_elimination_threshold")]
    pub elimination_threshold: f64,
}

fn default_monte_carlo_draws() -> u32 {
    10_000
}
fn default_winner_threshold() -> f64 {
    0.95
}
fn default_elimination_threshold() -> f64 {
    0.05
}

impl Default for BanditSection {
    fn default() -> Self {
        Self {
            monte_carlo_draws: default_monte_carlo_draws(),
            winner_threshold: default_winner_threshold(),
            elimination_threshold: default_elimination_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSection {
    #[serde(default = "default_messages_per_minute")]
    pub default_messages_per_minute: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_warm_up_days")]
    pub warm_up_days: u32,
}

fn default_messages_per_minute() -> u32 {
    10
}
fn default_poll_interval_secs() -> u64 {
    1
}
fn default_warm_up_days() -> u32 {
    7
}

impl Default for CampaignSection {
    fn default() -> Self {
        Self {
            default_messages_per_minute: default_messages_per_minute(),
            poll_interval_secs: default_poll_interval_secs(),
            warm_up_days: default_warm_up_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_tool_exec_secs")]
    pub tool_exec_secs: u64,
    #[serde(default = "default_provider_connect_secs")]
    pub provider_connect_secs: u64,
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,
}

fn default_tool_exec_secs() -> u64 {
    8
}
fn default_provider_connect_secs() -> u64 {
    10
}
fn default_graceful_shutdown_secs() -> u64 {
    10
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            tool_exec_secs: default_tool_exec_secs(),
            provider_connect_secs: default_provider_connect_secs(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path).context("failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        let parent = path.parent().context("config path has no parent")?;
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents).context("failed to write config file")?;
        Ok(())
    }

    pub fn carrier_api_key(&self) -> Result<String> {
        crate::security::keyring::get_named_secret(&self.carrier.api_key_ref)
    }

    pub fn carrier_webhook_signing_secret(&self) -> Option<String> {
        crate::security::keyring::get_named_secret(&self.carrier.webhook_signing_secret_ref).ok()
    }

    pub fn realtime_provider_api_key(&self) -> Result<String> {
        crate::security::keyring::get_named_secret(&self.providers.realtime_api_key_ref)
    }

    pub fn tts_provider_api_key(&self) -> Result<String> {
        crate::security::keyring::get_named_secret(&self.providers.tts_api_key_ref)
    }

    pub fn calendar_api_key(&self) -> Result<String> {
        crate::security::keyring::get_named_secret(&self.calendar.api_key_ref)
    }

    pub fn sms_api_key(&self) -> Result<String> {
        crate::security::keyring::get_named_secret(&self.sms.api_key_ref)
    }
}

/// The configuration file path, OS-appropriate via `directories`.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voicebridge", "voicebridge").context("failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// The data directory path (transcripts, local stores when not backed by
/// an external database).
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voicebridge", "voicebridge").context("failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.ivr.loop_similarity_threshold, config.ivr.loop_similarity_threshold);
        assert_eq!(parsed.campaign.default_messages_per_minute, config.campaign.default_messages_per_minute);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let partial = "[carrier]\nbase_url = \"https://example.test\"\n";
        let config: Config = toml::from_str(partial).unwrap();
        assert_eq!(config.carrier.base_url, "https://example.test");
        assert_eq!(config.ivr.dtmf_cooldown_ms, default_dtmf_cooldown_ms());
        assert_eq!(config.timeouts.tool_exec_secs, default_tool_exec_secs());
    }

    #[test]
    fn empty_toml_produces_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bandit.monte_carlo_draws, default_monte_carlo_draws());
    }
}
