//! One bridge session: the per-call task tree that owns both WebSocket
//! ends.
//!
//! Three concurrent loops (telephony-read, AI-read, activity watchdog)
//! race inside a `select!`; whichever returns first decides the
//! termination cause, the others are dropped (cancelled), and teardown
//! closes both sockets with a short grace before attributing the call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as TMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use vox_domain::events::{topics, DomainEvent};
use vox_domain::model::{
    CallEvent, CallEventType, EventSource, TerminatedBy, Utterance, UtteranceRole,
};

use crate::ai::{self, AiEvent};
use crate::bridge::frames::{
    self, FrameQueue, PushOutcome, StreamInbound, StreamParams, FRAME_QUEUE_CAPACITY,
};
use crate::bridge::{BridgeContext, BridgeState};

type AiSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const START_TIMEOUT: Duration = Duration::from_secs(10);
const AI_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why the session ended. Decides attribution and whether the bridge
/// itself must tear the provider call down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    /// Provider sent `stop` or closed the media socket; its status
    /// callback owns attribution.
    TelephonyStopped,
    /// The AI reported the conversation over, with the hanging-up side.
    AiCompleted(TerminatedBy),
    /// The AI socket died without a completion event.
    AiClosed,
    Inactivity,
    DurationCap,
    /// Externally cancelled through the registry (API terminate).
    Cancelled,
}

struct Shared {
    call_sid: String,
    stream_sid: String,
    last_activity: Mutex<Instant>,
    started: Instant,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Drive one media-stream connection to completion.
pub async fn run(socket: WebSocket, ctx: Arc<BridgeContext>) {
    let (tel_sink, mut tel_stream) = socket.split();

    let (call_sid, stream_sid, params) = match wait_for_start(&mut tel_stream).await {
        Some(v) => v,
        None => {
            tracing::warn!("media stream closed before start event");
            return;
        }
    };
    tracing::info!(call_sid = %call_sid, stream_sid = %stream_sid, "media stream started");

    // Signed URLs are single-use; fetch a fresh one per session.
    let signed_url = match ctx.ai.signed_url().await {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(call_sid = %call_sid, error = %e, "signed url fetch failed");
            abort_call(&ctx, &call_sid).await;
            return;
        }
    };

    let ai_ws = match tokio::time::timeout(
        AI_CONNECT_TIMEOUT,
        connect_async(signed_url.as_str()),
    )
    .await
    {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            tracing::error!(call_sid = %call_sid, error = %e, "ai socket connect failed");
            abort_call(&ctx, &call_sid).await;
            return;
        }
        Err(_) => {
            tracing::error!(call_sid = %call_sid, "ai socket connect timed out");
            abort_call(&ctx, &call_sid).await;
            return;
        }
    };
    let (mut ai_sink, mut ai_stream) = ai_ws.split();

    let campaign_var = params
        .campaign_id
        .map(|id| id.to_string())
        .unwrap_or_default();
    let dynamic_vars = [
        ("name", params.name.as_deref().unwrap_or("")),
        ("campaign_id", campaign_var.as_str()),
    ];
    let init = ai::initiation_payload(
        params.prompt.as_deref(),
        params.first_message.as_deref(),
        &dynamic_vars,
    );
    if ai_sink.send(TMessage::Text(init.to_string())).await.is_err() {
        tracing::error!(call_sid = %call_sid, "could not send conversation initiation");
        abort_call(&ctx, &call_sid).await;
        return;
    }

    let cancel = CancellationToken::new();
    ctx.registry.register(&call_sid, cancel.clone());

    let tel_queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY));
    let (ai_tx, ai_rx) = mpsc::channel::<String>(64);

    let tel_writer = spawn_telephony_writer(tel_sink, tel_queue.clone());
    let ai_writer = spawn_ai_writer(ai_sink, ai_rx);

    let shared = Shared {
        call_sid: call_sid.clone(),
        stream_sid,
        last_activity: Mutex::new(Instant::now()),
        started: Instant::now(),
    };

    let cause = tokio::select! {
        c = telephony_loop(&shared, &mut tel_stream, &ai_tx) => c,
        c = ai_loop(&ctx, &shared, &mut ai_stream, &ai_tx, &tel_queue) => c,
        c = watchdog(&ctx, &shared) => c,
        _ = cancel.cancelled() => Cause::Cancelled,
    };

    ctx.registry.advance(&call_sid, BridgeState::Terminating);
    teardown(&ctx, &shared, cause, tel_queue, ai_tx, tel_writer, ai_writer).await;
}

/// Hang up a call whose bridge never came up. The callee would
/// otherwise sit in silence until the provider gives up.
async fn abort_call(ctx: &BridgeContext, call_sid: &str) {
    if let Err(e) = ctx
        .gateway
        .terminate_call(call_sid, EventSource::Internal, TerminatedBy::System)
        .await
    {
        tracing::warn!(call_sid = %call_sid, error = %e, "abort teardown failed");
    }
}

async fn wait_for_start(
    stream: &mut SplitStream<WebSocket>,
) -> Option<(String, String, StreamParams)> {
    let fut = async {
        while let Some(Ok(msg)) = stream.next().await {
            if let WsMessage::Text(text) = msg {
                if let Some(StreamInbound::Start { stream_sid, start }) =
                    StreamInbound::parse(&text)
                {
                    let params = StreamParams::from_map(&start.custom_parameters);
                    let stream_sid = stream_sid
                        .or(start.stream_sid)
                        .unwrap_or_default();
                    return Some((start.call_sid, stream_sid, params));
                }
            }
        }
        None
    };
    tokio::time::timeout(START_TIMEOUT, fut).await.ok().flatten()
}

fn spawn_telephony_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
    queue: Arc<FrameQueue>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = queue.pop().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    })
}

fn spawn_ai_writer(
    mut sink: SplitSink<AiSocket, TMessage>,
    mut rx: mpsc::Receiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(TMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

async fn telephony_loop(
    shared: &Shared,
    stream: &mut SplitStream<WebSocket>,
    ai_tx: &mpsc::Sender<String>,
) -> Cause {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => match StreamInbound::parse(&text) {
                Some(StreamInbound::Media { media }) => {
                    shared.touch();
                    let chunk = ai::audio_chunk_payload(&media.payload).to_string();
                    // The AI side falling behind on caller audio is not
                    // recoverable by queueing; drop and move on.
                    if ai_tx.try_send(chunk).is_err() {
                        tracing::trace!(call_sid = %shared.call_sid, "ai send queue full, frame dropped");
                    }
                }
                Some(StreamInbound::Stop { .. }) => return Cause::TelephonyStopped,
                _ => {}
            },
            WsMessage::Close(_) => return Cause::TelephonyStopped,
            WsMessage::Ping(_) | WsMessage::Pong(_) => shared.touch(),
            _ => {}
        }
    }
    Cause::TelephonyStopped
}

async fn ai_loop(
    ctx: &BridgeContext,
    shared: &Shared,
    stream: &mut SplitStream<AiSocket>,
    ai_tx: &mpsc::Sender<String>,
    tel_queue: &FrameQueue,
) -> Cause {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            TMessage::Text(text) => {
                let Some(event) = AiEvent::parse(&text) else {
                    tracing::debug!(call_sid = %shared.call_sid, "unparseable ai event");
                    continue;
                };
                if let Some(cause) = handle_ai_event(ctx, shared, event, ai_tx, tel_queue) {
                    return cause;
                }
            }
            TMessage::Close(_) => return Cause::AiClosed,
            _ => {}
        }
    }
    Cause::AiClosed
}

/// React to one AI event; a `Some` return ends the session.
fn handle_ai_event(
    ctx: &BridgeContext,
    shared: &Shared,
    event: AiEvent,
    ai_tx: &mpsc::Sender<String>,
    tel_queue: &FrameQueue,
) -> Option<Cause> {
    let sid = &shared.call_sid;
    match event {
        AiEvent::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: meta,
        } => {
            ctx.registry.advance(sid, BridgeState::Active);
            ctx.registry.set_conversation_id(sid, &meta.conversation_id);
            if let Some(call) = ctx.calls.update_call(sid, |call| {
                call.conversation_id = Some(meta.conversation_id.clone());
                call.clone()
            }) {
                ctx.bus.publish_call(&call);
            }
            tracing::info!(
                call_sid = %sid,
                conversation_id = %meta.conversation_id,
                "bridge session active"
            );
        }
        AiEvent::Audio { audio_event } => {
            shared.touch();
            let frame = frames::media_frame(&shared.stream_sid, &audio_event.audio_base_64);
            if tel_queue.push(frame) == PushOutcome::BurstStarted {
                report_overflow(ctx, sid, tel_queue.len());
            }
        }
        AiEvent::AgentResponse {
            agent_response_event,
        } => {
            publish_utterance(
                ctx,
                sid,
                UtteranceRole::Agent,
                &agent_response_event.agent_response,
                false,
            );
        }
        AiEvent::AgentResponseCorrection {
            agent_response_correction_event,
        } => {
            publish_utterance(
                ctx,
                sid,
                UtteranceRole::Agent,
                &agent_response_correction_event.corrected_agent_response,
                true,
            );
        }
        AiEvent::UserTranscript {
            user_transcription_event,
        } => {
            publish_utterance(
                ctx,
                sid,
                UtteranceRole::User,
                &user_transcription_event.user_transcript,
                false,
            );
        }
        AiEvent::Interruption { .. } => {
            // Stale agent audio must not play over the caller.
            tel_queue.flush_and_push(frames::clear_frame(&shared.stream_sid));
        }
        AiEvent::Ping { ping_event } => {
            let _ = ai_tx.try_send(ai::pong_payload(ping_event.event_id).to_string());
        }
        AiEvent::ConversationCompleted {
            conversation_completed_event,
        } => {
            let tag = match conversation_completed_event.initiated_by.as_deref() {
                Some("user") | Some("caller") => TerminatedBy::User,
                _ => TerminatedBy::Agent,
            };
            return Some(Cause::AiCompleted(tag));
        }
        AiEvent::Other => {}
    }
    None
}

fn publish_utterance(
    ctx: &BridgeContext,
    sid: &str,
    role: UtteranceRole,
    text: &str,
    is_partial: bool,
) {
    let utterance = Utterance {
        role,
        text: text.to_string(),
        timestamp: Utc::now(),
    };
    let stored = if is_partial {
        ctx.calls.correct_last_utterance(sid, utterance)
    } else {
        ctx.calls.append_utterance(sid, utterance)
    };
    if let Err(e) = stored {
        tracing::debug!(call_sid = %sid, error = %e, "utterance not stored");
    } else if !is_partial {
        let _ = ctx.calls.append_event(CallEvent::now(
            sid,
            CallEventType::TranscriptMessage,
            EventSource::Ai,
            json!({ "role": role, "text": text }),
        ));
    }
    ctx.bus.publish(
        &topics::transcript(sid),
        DomainEvent::TranscriptDelta {
            call_sid: sid.to_string(),
            role,
            text: text.to_string(),
            is_partial,
        },
    );
}

fn report_overflow(ctx: &BridgeContext, sid: &str, queue_len: usize) {
    tracing::warn!(call_sid = %sid, queue_len, "outbound frame queue overflow, dropping oldest");
    let payload = json!({ "kind": "send_queue_overflow", "queueLen": queue_len });
    let _ = ctx.calls.append_event(CallEvent::now(
        sid,
        CallEventType::QualityUpdate,
        EventSource::Internal,
        payload.clone(),
    ));
    ctx.bus.publish(
        &topics::call(sid),
        DomainEvent::QualityUpdate {
            call_sid: sid.to_string(),
            payload,
        },
    );
}

async fn watchdog(ctx: &BridgeContext, shared: &Shared) -> Cause {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if shared.started.elapsed() >= ctx.duration_cap {
            return Cause::DurationCap;
        }
        if shared.idle_for() >= ctx.inactivity {
            return Cause::Inactivity;
        }
    }
}

async fn teardown(
    ctx: &BridgeContext,
    shared: &Shared,
    cause: Cause,
    tel_queue: Arc<FrameQueue>,
    ai_tx: mpsc::Sender<String>,
    mut tel_writer: tokio::task::JoinHandle<()>,
    mut ai_writer: tokio::task::JoinHandle<()>,
) {
    let sid = &shared.call_sid;
    tracing::info!(call_sid = %sid, ?cause, "bridge session terminating");

    // Let the writers drain and send close frames, then cut them off.
    drop(ai_tx);
    tel_queue.close();
    if tokio::time::timeout(CLOSE_GRACE, &mut tel_writer).await.is_err() {
        tel_writer.abort();
    }
    if tokio::time::timeout(CLOSE_GRACE, &mut ai_writer).await.is_err() {
        ai_writer.abort();
    }

    let result = match cause {
        // The provider hung up (or an external terminate already ran the
        // teardown); attribution belongs to the status callback / caller.
        Cause::TelephonyStopped | Cause::Cancelled => Ok(()),
        Cause::AiCompleted(tag) => {
            ctx.gateway
                .terminate_call(sid, EventSource::Ai, tag)
                .await
        }
        Cause::AiClosed => {
            ctx.gateway
                .terminate_call(sid, EventSource::Internal, TerminatedBy::System)
                .await
        }
        Cause::Inactivity => {
            ctx.gateway
                .terminate_call(sid, EventSource::Internal, TerminatedBy::SystemInactivity)
                .await
        }
        Cause::DurationCap => {
            ctx.gateway
                .terminate_call(sid, EventSource::Internal, TerminatedBy::DurationLimit)
                .await
        }
    };
    if let Err(e) = result {
        tracing::warn!(call_sid = %sid, error = %e, "provider teardown failed");
        let _ = ctx.calls.append_event(CallEvent::now(
            sid,
            CallEventType::Error,
            EventSource::Internal,
            json!({ "stage": "teardown", "error": e.to_string() }),
        ));
    }

    ctx.registry.advance(sid, BridgeState::Closed);
    ctx.registry.remove(sid);
    ctx.arbiter.forget(sid);
    tracing::info!(call_sid = %sid, "bridge session closed");
}
