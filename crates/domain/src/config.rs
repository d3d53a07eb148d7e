//! Environment-driven configuration.
//!
//! Every knob comes from the environment (the platform runs
//! containerized behind the dashboard); `Config::from_env()` reads the
//! variables once at startup and `validate()` reports issues by
//! severity. Errors are fatal; the binary exits non-zero.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL used to build provider callback and stream URLs,
    /// e.g. `https://calls.example.com`.
    pub public_url: String,
    /// Bearer token protecting `/api/*`; `None` disables auth (dev mode).
    pub api_key: Option<String>,
    /// Per-IP rate limit; `None` disables the governor layer.
    pub rate_limit_rps: Option<u64>,
    pub rate_limit_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            public_url: String::new(),
            api_key: None,
            rate_limit_rps: None,
            rate_limit_burst: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Default outbound caller id (E.164).
    pub outbound_number: String,
    /// Provider REST base; overridable for tests.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    pub api_key: String,
    pub agent_id: String,
    /// HMAC secret for the post-call webhook; unset skips verification.
    pub webhook_secret: Option<String>,
    /// AI-provider API base; overridable for tests.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// State directory holding the JSON-backed stores.
    pub state_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

/// Engine-wide timing defaults; per-campaign settings override the dial
/// cadence and concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub call_delay_ms: u64,
    pub max_concurrent_calls: usize,
    pub inactivity_ms: u64,
    pub duration_cap_ms: u64,
    /// Claim lease duration.
    pub lock_ttl_secs: u64,
    /// Extra grace before the sweeper reclaims an expired lease.
    pub sweep_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_delay_ms: 5_000,
            max_concurrent_calls: 5,
            inactivity_ms: 60_000,
            duration_cap_ms: 600_000,
            lock_ttl_secs: 120,
            sweep_grace_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub crm: CrmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        Self {
            server: ServerConfig {
                host: env("HOST").unwrap_or_else(|| "0.0.0.0".into()),
                port: env_parse("PORT", 8000),
                public_url: env("SERVER_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_default(),
                api_key: env("API_KEY"),
                rate_limit_rps: env("RATE_LIMIT_RPS").and_then(|v| v.parse().ok()),
                rate_limit_burst: env_parse("RATE_LIMIT_BURST", 32),
            },
            telephony: TelephonyConfig {
                account_sid: env("TELEPHONY_SID").unwrap_or_default(),
                auth_token: env("TELEPHONY_TOKEN").unwrap_or_default(),
                outbound_number: env("TELEPHONY_NUMBER").unwrap_or_default(),
                api_base: env("TELEPHONY_API_BASE"),
            },
            ai: AiConfig {
                api_key: env("AI_API_KEY").unwrap_or_default(),
                agent_id: env("AI_AGENT_ID").unwrap_or_default(),
                webhook_secret: env("AI_WEBHOOK_SECRET"),
                api_base: env("AI_API_BASE"),
            },
            store: StoreConfig {
                state_dir: env("STORE_URI")
                    .map(|u| PathBuf::from(u.trim_start_matches("file:")))
                    .unwrap_or_else(|| PathBuf::from("./state")),
            },
            crm: CrmConfig {
                enabled: env_parse("ENABLE_CRM_WEBHOOK", false),
                webhook_url: env("CRM_WEBHOOK_URL"),
            },
            engine: EngineConfig {
                call_delay_ms: env_parse("CALL_DELAY_MS", defaults.call_delay_ms),
                max_concurrent_calls: env_parse(
                    "MAX_CONCURRENT_CALLS",
                    defaults.max_concurrent_calls,
                ),
                inactivity_ms: env_parse("INACTIVITY_MS", defaults.inactivity_ms),
                duration_cap_ms: env_parse("DURATION_CAP_MS", defaults.duration_cap_ms),
                lock_ttl_secs: defaults.lock_ttl_secs,
                sweep_grace_secs: defaults.sweep_grace_secs,
            },
        }
    }

    /// The wss:// URL the telephony provider connects its media stream to.
    pub fn media_stream_url(&self) -> String {
        let base = self
            .server
            .public_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/outbound-media-stream")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        fn error(issues: &mut Vec<ConfigIssue>, field: &str, message: String) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        }

        if self.server.port == 0 {
            error(&mut issues, "server.port", "port must be greater than 0".into());
        }
        if self.server.public_url.is_empty() {
            error(&mut issues,
                "SERVER_URL",
                "public base URL is required to build provider callbacks".into(),
            );
        } else if !self.server.public_url.starts_with("http://")
            && !self.server.public_url.starts_with("https://")
        {
            error(&mut issues,
                "SERVER_URL",
                format!(
                    "must start with http:// or https:// (got \"{}\")",
                    self.server.public_url
                ),
            );
        }
        if self.telephony.account_sid.is_empty() {
            error(&mut issues, "TELEPHONY_SID", "telephony account sid is required".into());
        }
        if self.telephony.auth_token.is_empty() {
            error(&mut issues, "TELEPHONY_TOKEN", "telephony auth token is required".into());
        }
        if self.telephony.outbound_number.is_empty() {
            error(&mut issues, "TELEPHONY_NUMBER", "outbound caller id is required".into());
        }
        if self.ai.api_key.is_empty() {
            error(&mut issues, "AI_API_KEY", "AI provider api key is required".into());
        }
        if self.ai.agent_id.is_empty() {
            error(&mut issues, "AI_AGENT_ID", "AI agent id is required".into());
        }

        if self.server.api_key.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "API_KEY".into(),
                message: "API bearer auth disabled; all /api routes are open".into(),
            });
        }
        if self.ai.webhook_secret.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "AI_WEBHOOK_SECRET".into(),
                message: "post-call webhook signature verification disabled".into(),
            });
        }
        if self.crm.enabled && self.crm.webhook_url.is_none() {
            error(&mut issues,
                "CRM_WEBHOOK_URL",
                "ENABLE_CRM_WEBHOOK is set but no CRM webhook URL given".into(),
            );
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8000,
                public_url: "https://calls.example.com".into(),
                api_key: Some("k".into()),
                ..ServerConfig::default()
            },
            telephony: TelephonyConfig {
                account_sid: "AC123".into(),
                auth_token: "tok".into(),
                outbound_number: "+15550100".into(),
                api_base: None,
            },
            ai: AiConfig {
                api_key: "xi".into(),
                agent_id: "agent_1".into(),
                webhook_secret: Some("s".into()),
                api_base: None,
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        let issues = valid_config().validate();
        assert!(!Config::has_errors(&issues), "{issues:?}");
    }

    #[test]
    fn missing_credentials_are_errors() {
        let mut cfg = valid_config();
        cfg.telephony.account_sid.clear();
        cfg.ai.agent_id.clear();
        let issues = cfg.validate();
        assert!(Config::has_errors(&issues));
        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"TELEPHONY_SID"));
        assert!(fields.contains(&"AI_AGENT_ID"));
    }

    #[test]
    fn missing_api_key_is_only_a_warning() {
        let mut cfg = valid_config();
        cfg.server.api_key = None;
        let issues = cfg.validate();
        assert!(!Config::has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning && i.field == "API_KEY"));
    }

    #[test]
    fn crm_enabled_requires_url() {
        let mut cfg = valid_config();
        cfg.crm.enabled = true;
        assert!(Config::has_errors(&cfg.validate()));
        cfg.crm.webhook_url = Some("https://crm.example.com/hook".into());
        assert!(!Config::has_errors(&cfg.validate()));
    }

    #[test]
    fn media_stream_url_swaps_scheme() {
        let cfg = valid_config();
        assert_eq!(
            cfg.media_stream_url(),
            "wss://calls.example.com/outbound-media-stream"
        );
    }
}
