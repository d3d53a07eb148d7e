//! AI-provider post-call webhook.
//!
//! Carries the conversation summary, the final transcript, and which
//! side hung up. Signature: `elevenlabs-signature:
//! t=<unix-ts>,v0=<hex hmac_sha256(secret, "<ts>.<body>")>`, verified
//! when a secret is configured. The route answers 200 unconditionally,
//! since a failing webhook would get disabled provider-side; bad
//! signatures are dropped after logging.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use vox_domain::model::{
    EventSource, TerminatedBy, TranscriptAnalysis, Utterance, UtteranceRole,
};

use crate::crm;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Signatures older or newer than this are rejected.
const TIMESTAMP_TOLERANCE_SECS: i64 = 30 * 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signature
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compute the `v0` hex digest for `(secret, ts, body)`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a `t=<ts>,v0=<hex>` header against the body at `now_unix`.
pub fn verify_at(secret: &str, header: &str, body: &[u8], now_unix: i64) -> Result<(), String> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        if let Some(ts) = part.trim().strip_prefix("t=") {
            timestamp = Some(ts);
        } else if let Some(sig) = part.trim().strip_prefix("v0=") {
            signature = Some(sig);
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err("malformed signature header".into()),
    };

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| "non-numeric timestamp".to_string())?;
    if (now_unix - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err("timestamp outside tolerance".into());
    }

    let expected = sign(secret, timestamp, body);
    if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
        Ok(())
    } else {
        Err("signature mismatch".into())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct PostCallPayload {
    #[serde(rename = "type")]
    kind: String,
    data: PostCallData,
}

#[derive(Debug, Deserialize)]
struct PostCallData {
    conversation_id: String,
    #[serde(default)]
    transcript: Vec<PostCallTurn>,
    #[serde(default)]
    analysis: Option<PostCallAnalysis>,
    #[serde(default)]
    termination_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostCallTurn {
    role: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostCallAnalysis {
    #[serde(default)]
    transcript_summary: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /webhooks/elevenlabs`
pub async fn post_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.config.ai.webhook_secret {
        let header = headers
            .get("elevenlabs-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Err(reason) = verify_at(secret, header, &body, Utc::now().timestamp()) {
            tracing::warn!(%reason, "rejecting unsigned ai webhook");
            return (StatusCode::OK, "Webhook received").into_response();
        }
    }

    let payload: PostCallPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable ai webhook payload");
            return (StatusCode::OK, "Webhook received").into_response();
        }
    };
    if payload.kind != "post_call_transcription" {
        tracing::debug!(kind = %payload.kind, "ignoring ai webhook type");
        return (StatusCode::OK, "Webhook received").into_response();
    }

    process(&state, payload).await;
    (StatusCode::OK, "Webhook received").into_response()
}

async fn process(state: &AppState, payload: PostCallPayload) {
    let data = payload.data;
    let Some(call) = state.calls.find_by_conversation_id(&data.conversation_id) else {
        tracing::warn!(
            conversation_id = %data.conversation_id,
            "post-call webhook for unknown conversation"
        );
        return;
    };
    let sid = call.sid.clone();

    // Backfill utterances the live bridge missed (late events are legal
    // until the analysis freezes the transcript).
    let existing = state
        .calls
        .transcript(&sid)
        .map(|t| t.utterances.len())
        .unwrap_or(0);
    if existing == 0 {
        for turn in &data.transcript {
            let Some(text) = turn.message.as_deref().filter(|m| !m.is_empty()) else {
                continue;
            };
            let role = match turn.role.as_str() {
                "agent" => UtteranceRole::Agent,
                "user" => UtteranceRole::User,
                _ => UtteranceRole::System,
            };
            let _ = state.calls.append_utterance(
                &sid,
                Utterance {
                    role,
                    text: text.to_string(),
                    timestamp: Utc::now(),
                },
            );
        }
    }

    // Attribution: only fills a missing/unknown value (arbiter rule).
    if let Some(reason) = data.termination_reason.as_deref() {
        let lower = reason.to_ascii_lowercase();
        let tag = if lower.contains("agent") {
            Some(TerminatedBy::Agent)
        } else if lower.contains("user") || lower.contains("client") || lower.contains("caller")
        {
            Some(TerminatedBy::User)
        } else {
            None
        };
        if let Some(tag) = tag {
            state.arbiter.signal(&sid, EventSource::Ai, tag);
        }
    }

    let analysis = data.analysis.unwrap_or_default();
    let summary = analysis.transcript_summary.clone();
    if let Err(e) = state.calls.apply_analysis(
        &sid,
        TranscriptAnalysis {
            summary: analysis.transcript_summary,
            sentiment: analysis.sentiment,
            topics: analysis.topics,
        },
    ) {
        tracing::warn!(call_sid = %sid, error = %e, "could not apply post-call analysis");
    }

    if let Some(call) = state.calls.get(&sid) {
        state.bus.publish_call(&call);
        crm::dispatch(state, &call, summary.as_deref());
    }
    tracing::info!(call_sid = %sid, "post-call analysis applied");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // hmac_sha256("s", "1700000000.{\"ok\":true}")
        let v0 = sign("s", "1700000000", br#"{"ok":true}"#);
        assert_eq!(
            v0,
            "ebe1cdffb0cfaddc2dfdee3c485bd7211f01cd51a95bdeacfe09f5cbe4fdade1"
        );
    }

    #[test]
    fn signer_and_verifier_agree() {
        let secret = "wh_secret_123";
        let body = br#"{"type":"post_call_transcription"}"#;
        let ts = 1_712_345_678i64;
        let header = format!("t={ts},v0={}", sign(secret, &ts.to_string(), body));
        assert!(verify_at(secret, &header, body, ts + 60).is_ok());
    }

    #[test]
    fn verifier_rejects_tampering() {
        let secret = "s";
        let body = br#"{"ok":true}"#;
        let ts = 1_700_000_000i64;
        let header = format!("t={ts},v0={}", sign(secret, &ts.to_string(), body));

        assert!(verify_at(secret, &header, br#"{"ok":false}"#, ts).is_err());
        assert!(verify_at("other", &header, body, ts).is_err());
        assert!(verify_at(secret, "v0=deadbeef", body, ts).is_err());
    }

    #[test]
    fn verifier_rejects_stale_timestamps() {
        let secret = "s";
        let body = b"{}";
        let ts = 1_700_000_000i64;
        let header = format!("t={ts},v0={}", sign(secret, &ts.to_string(), body));

        assert!(verify_at(secret, &header, body, ts + TIMESTAMP_TOLERANCE_SECS - 1).is_ok());
        assert!(verify_at(secret, &header, body, ts + TIMESTAMP_TOLERANCE_SECS + 1).is_err());
        assert!(verify_at(secret, &header, body, ts - TIMESTAMP_TOLERANCE_SECS - 1).is_err());
    }
}
