//! Telephony gateway — provider REST wrapper and outbound-call
//! orchestration.
//!
//! The provider sits behind the [`TelephonyProvider`] trait so the
//! engine and the API handlers never touch HTTP directly (and tests can
//! swap in a scripted provider). [`CallGateway`] is the orchestration
//! layer: signed-URL prefetch, TwiML assembly, call-row bookkeeping and
//! termination attribution.

pub mod twiml;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use vox_domain::config::Config;
use vox_domain::model::{
    Call, CallEvent, CallEventType, CallSid, EventSource, TerminatedBy,
};
use vox_domain::retry::{self, Backoff};
use vox_domain::{Error, Result};
use vox_store::CallStore;

use crate::ai::AiProvider;
use crate::arbiter::TerminationArbiter;
use crate::bus::EventBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the platform asks of the telephony provider's REST API.
#[derive(Debug, Clone)]
pub struct CreateCallParams {
    pub to: String,
    pub from: String,
    pub twiml: String,
    pub status_callback: String,
    pub amd_callback: String,
    pub recording_callback: String,
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Instruct the provider to dial. Returns the provider call sid.
    async fn create_call(&self, params: &CreateCallParams) -> Result<CallSid>;

    /// Tear an in-flight call down.
    async fn terminate_call(&self, call_sid: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REST client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

pub struct RestTelephonyClient {
    http: reqwest::Client,
    base: String,
    account_sid: String,
    auth_token: String,
}

impl RestTelephonyClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("telephony http client: {e}")))?;
        Ok(Self {
            http,
            base: config
                .telephony
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            account_sid: config.telephony.account_sid.clone(),
            auth_token: config.telephony.auth_token.clone(),
        })
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base, self.account_sid
        )
    }

    fn call_url(&self, sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.base, self.account_sid, sid
        )
    }

    async fn read_error(&self, resp: reqwest::Response) -> Error {
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let message = body["message"].as_str().unwrap_or("provider error");
        map_provider_error(status.as_u16(), message)
    }
}

/// Classify a provider REST failure into the domain taxonomy. Business
/// rejections become `Provider` with a normalized reason string the
/// engine matches on (`insufficient_funds`, `unreachable_number`).
pub fn map_provider_error(status: u16, message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    match status {
        401 | 403 => Error::Auth(message.to_string()),
        429 => Error::RateLimited,
        500..=599 => Error::Transient(message.to_string()),
        _ if lower.contains("fund") || lower.contains("balance") => Error::Provider {
            provider: "telephony".into(),
            reason: "insufficient_funds".into(),
        },
        _ if lower.contains("unreachable") || lower.contains("not a valid phone") => {
            Error::Provider {
                provider: "telephony".into(),
                reason: "unreachable_number".into(),
            }
        }
        _ => Error::Provider {
            provider: "telephony".into(),
            reason: message.to_string(),
        },
    }
}

#[async_trait]
impl TelephonyProvider for RestTelephonyClient {
    async fn create_call(&self, params: &CreateCallParams) -> Result<CallSid> {
        let form: Vec<(&str, &str)> = vec![
            ("To", &params.to),
            ("From", &params.from),
            ("Twiml", &params.twiml),
            ("StatusCallback", &params.status_callback),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
            ("MachineDetection", "Enable"),
            ("AsyncAmd", "true"),
            ("AsyncAmdStatusCallback", &params.amd_callback),
            ("AsyncAmdStatusCallbackMethod", "POST"),
            ("Record", "true"),
            ("RecordingStatusCallback", &params.recording_callback),
        ];

        let resp = self
            .http
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("create call: {e}")))?;

        if !resp.status().is_success() {
            return Err(self.read_error(resp).await);
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Transient(format!("create call response: {e}")))?;
        body["sid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Transient("create call response missing sid".into()))
    }

    async fn terminate_call(&self, call_sid: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|e| Error::Transient(format!("terminate call: {e}")))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(Error::NotFound(format!("call {call_sid}"))),
            _ => Err(self.read_error(resp).await),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a caller wants dialed, before provider specifics.
#[derive(Debug, Clone, Default)]
pub struct OutboundCallRequest {
    pub to: String,
    pub from: Option<String>,
    pub prompt: Option<String>,
    pub first_message: Option<String>,
    pub name: Option<String>,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
}

pub struct CallGateway {
    provider: Arc<dyn TelephonyProvider>,
    ai: Arc<dyn AiProvider>,
    calls: Arc<CallStore>,
    bus: Arc<EventBus>,
    arbiter: Arc<TerminationArbiter>,
    config: Arc<Config>,
}

impl CallGateway {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        ai: Arc<dyn AiProvider>,
        calls: Arc<CallStore>,
        bus: Arc<EventBus>,
        arbiter: Arc<TerminationArbiter>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            provider,
            ai,
            calls,
            bus,
            arbiter,
            config,
        }
    }

    /// Dial one contact. Prefetches an AI signed URL so a dead AI side
    /// fails the call before the provider charges for a dial, builds the
    /// stream TwiML, and records the initial call document.
    pub async fn start_call(&self, req: &OutboundCallRequest) -> Result<CallSid> {
        // The bridge fetches its own signed URL at stream start; this
        // one only proves the AI side is reachable.
        self.ai.signed_url().await?;

        let from = req
            .from
            .clone()
            .unwrap_or_else(|| self.config.telephony.outbound_number.clone());

        let campaign_id = req.campaign_id.map(|id| id.to_string()).unwrap_or_default();
        let contact_id = req.contact_id.map(|id| id.to_string()).unwrap_or_default();
        let twiml = twiml::connect_stream(
            &self.config.media_stream_url(),
            &[
                ("prompt", req.prompt.as_deref().unwrap_or("")),
                ("first_message", req.first_message.as_deref().unwrap_or("")),
                ("name", req.name.as_deref().unwrap_or("")),
                ("campaignId", campaign_id.as_str()),
                ("contactId", contact_id.as_str()),
            ],
        );

        let public = &self.config.server.public_url;
        let params = CreateCallParams {
            to: req.to.clone(),
            from: from.clone(),
            twiml,
            status_callback: format!("{public}/call-status-callback"),
            amd_callback: format!("{public}/amd-status-callback"),
            recording_callback: format!("{public}/recording-status-callback"),
        };

        let provider = self.provider.clone();
        let sid = retry::with_backoff(Backoff::default(), || {
            let provider = provider.clone();
            let params = params.clone();
            async move { provider.create_call(&params).await }
        })
        .await?;

        let mut call = Call::outbound(sid.clone(), from, req.to.clone());
        call.campaign_id = req.campaign_id;
        call.contact_id = req.contact_id;
        self.calls.upsert_call(call.clone());
        let _ = self.calls.append_event(CallEvent::now(
            &sid,
            CallEventType::StatusChange,
            EventSource::Internal,
            json!({"status": "initiated", "to": call.to, "campaignId": req.campaign_id}),
        ));
        self.bus.publish_call(&call);

        tracing::info!(call_sid = %sid, to = %call.to, "outbound call created");
        Ok(sid)
    }

    /// Tear a call down with an explicit attribution. Records the
    /// termination signal first so the provider's own `completed`
    /// callback cannot out-race it.
    pub async fn terminate_call(
        &self,
        sid: &str,
        source: EventSource,
        tag: TerminatedBy,
    ) -> Result<()> {
        self.arbiter.signal(sid, source, tag);

        match self.provider.terminate_call(sid).await {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                // Already gone on the provider side; settle locally.
                tracing::debug!(call_sid = %sid, "terminate: provider no longer knows the call");
            }
            Err(e) => return Err(e),
        }

        if let Some(call) = self.calls.update_call(sid, |call| {
            call.apply_transition(
                vox_domain::model::CallState::Completed,
                chrono::Utc::now(),
            );
            call.clone()
        }) {
            self.bus.publish_call(&call);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_mapping() {
        assert!(matches!(
            map_provider_error(401, "authentication failed"),
            Error::Auth(_)
        ));
        assert!(matches!(map_provider_error(429, "slow down"), Error::RateLimited));
        assert!(matches!(
            map_provider_error(503, "upstream unavailable"),
            Error::Transient(_)
        ));
        match map_provider_error(400, "Account balance too low to place call") {
            Error::Provider { reason, .. } => assert_eq!(reason, "insufficient_funds"),
            other => panic!("unexpected {other:?}"),
        }
        match map_provider_error(400, "The number is unreachable") {
            Error::Provider { reason, .. } => assert_eq!(reason, "unreachable_number"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
