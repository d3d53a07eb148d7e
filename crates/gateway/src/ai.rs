//! AI-provider client: signed streaming URLs and the conversational
//! socket vocabulary.
//!
//! The REST side is one endpoint (signed-URL fetch); the interesting
//! part is the typed view of the conversation socket the bridge speaks.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use vox_domain::config::Config;
use vox_domain::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.elevenlabs.io";

/// The one REST capability the rest of the system needs from the AI
/// provider. A trait seam so tests can script it.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// A single-use signed wss:// URL for the conversation socket.
    async fn signed_url(&self) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REST client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AiClient {
    http: reqwest::Client,
    base: String,
    api_key: String,
    agent_id: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

impl AiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("ai http client: {e}")))?;
        Ok(Self {
            http,
            base: config
                .ai
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: config.ai.api_key.clone(),
            agent_id: config.ai.agent_id.clone(),
        })
    }

    async fn fetch_signed_url(&self) -> Result<String> {
        let url = format!(
            "{}/v1/convai/conversation/get-signed-url?agent_id={}",
            self.base, self.agent_id
        );
        let resp = self
            .http
            .get(&url)
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("signed url: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => {}
            401 | 403 => return Err(Error::Auth("ai provider rejected api key".into())),
            status => {
                return Err(Error::Transient(format!("signed url: http {status}")));
            }
        }
        let body: SignedUrlResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transient(format!("signed url response: {e}")))?;
        Ok(body.signed_url)
    }
}

#[async_trait]
impl AiProvider for AiClient {
    async fn signed_url(&self) -> Result<String> {
        self.fetch_signed_url().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket vocabulary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation overrides sent as the first client message after the
/// socket opens. Only non-empty overrides are included so agent-side
/// defaults stay in force.
pub fn initiation_payload(
    prompt: Option<&str>,
    first_message: Option<&str>,
    dynamic_variables: &[(&str, &str)],
) -> Value {
    let mut agent = serde_json::Map::new();
    if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
        agent.insert("prompt".into(), json!({ "prompt": prompt }));
    }
    if let Some(first) = first_message.filter(|m| !m.is_empty()) {
        agent.insert("first_message".into(), json!(first));
    }

    let mut payload = json!({
        "type": "conversation_initiation_client_data",
        "conversation_config_override": { "agent": Value::Object(agent) },
    });
    let vars: serde_json::Map<String, Value> = dynamic_variables
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    if !vars.is_empty() {
        payload["dynamic_variables"] = Value::Object(vars);
    }
    payload
}

/// Raw audio frame toward the agent. Deliberately untagged: the
/// provider treats bare `user_audio_chunk` objects as audio.
pub fn audio_chunk_payload(b64_ulaw: &str) -> Value {
    json!({ "user_audio_chunk": b64_ulaw })
}

pub fn pong_payload(event_id: i64) -> Value {
    json!({ "type": "pong", "event_id": event_id })
}

/// Inbound events on the conversation socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AiEvent {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    Audio {
        audio_event: AudioEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponse,
    },
    AgentResponseCorrection {
        agent_response_correction_event: AgentResponseCorrection,
    },
    UserTranscript {
        user_transcription_event: UserTranscript,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Value,
    },
    Ping {
        ping_event: PingEvent,
    },
    ConversationCompleted {
        #[serde(default)]
        conversation_completed_event: CompletedEvent,
    },
    /// Forward-compatible catch-all for vocabulary we do not act on.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    pub agent_response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponseCorrection {
    pub corrected_agent_response: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTranscript {
    pub user_transcript: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    pub event_id: i64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletedEvent {
    /// Which side hung up, when the provider says.
    #[serde(default)]
    pub initiated_by: Option<String>,
}

impl AiEvent {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_payload_includes_only_overrides() {
        let payload = initiation_payload(
            Some("You are a scheduler."),
            None,
            &[("name", "Ada"), ("campaignId", "")],
        );
        assert_eq!(payload["type"], "conversation_initiation_client_data");
        assert_eq!(
            payload["conversation_config_override"]["agent"]["prompt"]["prompt"],
            "You are a scheduler."
        );
        assert!(payload["conversation_config_override"]["agent"]
            .get("first_message")
            .is_none());
        assert_eq!(payload["dynamic_variables"]["name"], "Ada");
        assert!(payload["dynamic_variables"].get("campaignId").is_none());
    }

    #[test]
    fn parses_initiation_metadata() {
        let raw = r#"{
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": {
                "conversation_id": "conv_123",
                "agent_output_audio_format": "ulaw_8000"
            }
        }"#;
        match AiEvent::parse(raw) {
            Some(AiEvent::ConversationInitiationMetadata {
                conversation_initiation_metadata_event: meta,
            }) => {
                assert_eq!(meta.conversation_id, "conv_123");
                assert_eq!(meta.agent_output_audio_format.as_deref(), Some("ulaw_8000"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_audio_and_ping() {
        let audio = r#"{"type":"audio","audio_event":{"audio_base_64":"AAAA","event_id":7}}"#;
        assert!(matches!(
            AiEvent::parse(audio),
            Some(AiEvent::Audio { audio_event }) if audio_event.audio_base_64 == "AAAA"
        ));

        let ping = r#"{"type":"ping","ping_event":{"event_id":42}}"#;
        match AiEvent::parse(ping) {
            Some(AiEvent::Ping { ping_event }) => assert_eq!(ping_event.event_id, 42),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pong_payload(42)["event_id"], 42);
    }

    #[test]
    fn unknown_event_types_fold_to_other() {
        let raw = r#"{"type":"internal_tentative_agent_response","data":{}}"#;
        assert!(matches!(AiEvent::parse(raw), Some(AiEvent::Other)));
    }

    #[test]
    fn completed_event_tolerates_missing_body() {
        let raw = r#"{"type":"conversation_completed"}"#;
        assert!(matches!(
            AiEvent::parse(raw),
            Some(AiEvent::ConversationCompleted { .. })
        ));
    }
}
