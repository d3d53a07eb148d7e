//! Command-line interface: `serve` (default), `config validate|show`,
//! `version`.

use clap::{Parser, Subcommand};
use serde_json::json;

use vox_domain::config::{Config, ConfigSeverity};

#[derive(Debug, Parser)]
#[command(name = "voxflow", about = "AI-powered outbound calling platform")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the environment configuration and exit non-zero on
    /// errors.
    Validate,
    /// Print the effective configuration with secrets redacted.
    Show,
}

/// Print issues to stderr; returns false when any is an error.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        eprintln!("{issue}");
    }
    if issues.is_empty() {
        eprintln!("configuration OK");
    }
    !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
}

fn redact(value: &str) -> String {
    if value.is_empty() {
        "(unset)".into()
    } else {
        format!("{}…", &value[..value.len().min(4)])
    }
}

pub fn show(config: &Config) {
    let doc = json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "publicUrl": config.server.public_url,
            "apiKey": config.server.api_key.as_deref().map(redact),
            "rateLimitRps": config.server.rate_limit_rps,
        },
        "telephony": {
            "accountSid": redact(&config.telephony.account_sid),
            "authToken": redact(&config.telephony.auth_token),
            "outboundNumber": config.telephony.outbound_number,
        },
        "ai": {
            "apiKey": redact(&config.ai.api_key),
            "agentId": config.ai.agent_id,
            "webhookSecret": config.ai.webhook_secret.as_deref().map(redact),
        },
        "store": { "stateDir": config.store.state_dir },
        "crm": { "enabled": config.crm.enabled, "webhookUrl": config.crm.webhook_url },
        "engine": {
            "callDelayMs": config.engine.call_delay_ms,
            "maxConcurrentCalls": config.engine.max_concurrent_calls,
            "inactivityMs": config.engine.inactivity_ms,
            "durationCapMs": config.engine.duration_cap_ms,
        },
    });
    println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_keeps_a_stub() {
        assert_eq!(redact(""), "(unset)");
        assert_eq!(redact("abc"), "abc…");
        assert_eq!(redact("AC12345678"), "AC12…");
    }
}
