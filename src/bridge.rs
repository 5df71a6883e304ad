//! Media bridge (§6 "Carrier media WebSocket").
//!
//! Axum WebSocket handler for `…/voice/stream/{call_id}`. Owns the carrier
//! socket and drives one `VoiceSession` end-to-end: a dumb reader pump
//! decodes inbound frames onto a channel, a dumb writer pump encodes
//! outbound frames off another, and the session task in between is the
//! sole owner of the provider connection and all mutable call state (§5
//! "actor-like pattern").

use crate::bandit;
use crate::codec::{decode_frame_payload, encode_frame_payload};
use crate::executor::ToolExecutor;
use crate::provider::{split_sentence_boundary, Provider, ProviderEvent, RealtimeProvider, TtsStreamProvider};
use crate::registry::SessionRegistry;
use crate::session::{self, SessionCommand, SessionContext, VoiceSession};
use crate::store::Stores;
use crate::types::{Direction, SessionState, VoiceProvider};
use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

/// Idle flush deadline for the hybrid TTS leg: text accumulated from
/// transcript deltas is spoken even without sentence-ending punctuation
/// once this much time passes without a flush (§4.5 "TTS-buffer flush").
const TTS_IDLE_FLUSH: Duration = Duration::from_millis(150);

/// The only wire shape the carrier media socket speaks in either
/// direction: one base64 μ-law 8 kHz chunk per frame (§6).
#[derive(Debug, Deserialize)]
struct InboundFrame {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundFrame {
    payload: String,
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub provider_url: String,
    pub provider_api_key: String,
    pub tts_provider_url: String,
    pub tts_provider_api_key: String,
    pub carrier_base_url: String,
    pub carrier_api_key: String,
    pub provider_connect_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub default_calendar_event_type_id: Option<u64>,
}

#[derive(Clone)]
pub struct BridgeState {
    pub config: BridgeConfig,
    pub registry: Arc<SessionRegistry<SessionCommand>>,
    pub stores: Stores,
    pub executor: Arc<ToolExecutor>,
    pub carrier_dtmf: Arc<crate::executor::CarrierDtmfClient>,
}

pub async fn ws_handler(ws: WebSocketUpgrade, Path(call_id): Path<String>, State(state): State<BridgeState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let span = info_span!("voice_session", call_id = %call_id);
        run_session(socket, call_id, state).instrument(span).await;
    })
}

async fn run_session(socket: WebSocket, call_id: String, state: BridgeState) {
    info!("media socket accepted");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (ingress_tx, mut ingress_rx) = mpsc::channel::<Vec<u8>>(64);
    let (egress_tx, mut egress_rx) = mpsc::channel::<Vec<u8>>(64);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(4);

    if !state.registry.register(call_id.clone(), cmd_tx) {
        warn!("duplicate session registration, closing socket");
        let _ = ws_tx.close().await;
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(mulaw_bytes) = egress_rx.recv().await {
            let frame = OutboundFrame { payload: encode_frame_payload(&mulaw_bytes) };
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let reader_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                        if let Ok(bytes) = decode_frame_payload(&frame.payload) {
                            if ingress_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Minimal anchor-row lookup until a workspace database is wired in; a
    // standalone deployment resolves sensible defaults plus whichever
    // prompt version the bandit currently favors (§4.5 step 1).
    let ctx = resolve_context(&call_id, &state).await;
    let config = session::VoiceSession::build_session_config(&ctx);
    let hybrid = ctx.agent.voice_provider == VoiceProvider::Hybrid;
    let prompt_version_id = ctx.prompt_version.version_id.clone();

    let mut provider = RealtimeProvider::new();
    if let Err(e) = session::connect_provider(
        &mut provider,
        &state.config.provider_url,
        &state.config.provider_api_key,
        state.config.provider_connect_timeout,
    )
    .await
    {
        warn!(error = %e, "provider connect failed, ending session");
        state.registry.remove(&call_id);
        reader_task.abort();
        writer_task.abort();
        return;
    }
    if let Err(e) = provider.configure(&config).await {
        warn!(error = %e, "provider configure failed, ending session");
    }

    let mut tts: Option<TtsStreamProvider> = if hybrid {
        let mut t = TtsStreamProvider::new();
        match t.connect(&state.config.tts_provider_url, &state.config.tts_provider_api_key).await {
            Ok(()) => Some(t),
            Err(e) => {
                warn!(error = %e, "tts provider connect failed, continuing as combined-only");
                None
            }
        }
    } else {
        None
    };
    let mut tts_buffer = String::new();

    let mut voice_session = VoiceSession::new(call_id.clone(), &ctx, Direction::Inbound);
    voice_session.transition(SessionState::Streaming);
    if let Err(e) = provider.request_response().await {
        warn!(error = %e, "initial greeting response request failed");
    }

    let idle_flush = tokio::time::sleep(TTS_IDLE_FLUSH);
    tokio::pin!(idle_flush);

    let mut failed = false;
    loop {
        tokio::select! {
            Some(mulaw_frame) = ingress_rx.recv() => {
                let pcm_24k = voice_session.transcode_ingress(&mulaw_frame);
                if let Err(e) = provider.send_audio(&pcm_24k).await {
                    warn!(error = %e, "send_audio failed, ending session");
                    failed = true;
                    break;
                }
            }
            event = provider.recv_event() => {
                match event {
                    Ok(Some(event)) => {
                        if !handle_event(&mut voice_session, &mut provider, &mut tts, &mut tts_buffer, &state, &call_id, &egress_tx, event).await {
                            break;
                        }
                        if !tts_buffer.is_empty() {
                            idle_flush.as_mut().reset(tokio::time::Instant::now() + TTS_IDLE_FLUSH);
                        }
                    }
                    Ok(None) => {
                        info!("provider closed socket");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "provider recv error, ending session");
                        failed = true;
                        break;
                    }
                }
            }
            res = recv_tts(&mut tts) => {
                match res {
                    Ok(Some(mulaw_bytes)) => {
                        if !voice_session.is_egress_suppressed() {
                            let _ = egress_tx.send(mulaw_bytes).await;
                        }
                    }
                    Ok(None) => { /* tts leg not connected or closed cleanly; combined audio stays suppressed */ }
                    Err(e) => warn!(error = %e, "tts recv error"),
                }
            }
            () = &mut idle_flush, if !tts_buffer.is_empty() => {
                if let Some(t) = tts.as_mut() {
                    if let Err(e) = t.send_text(&tts_buffer, true).await {
                        warn!(error = %e, "tts idle flush failed");
                    }
                }
                tts_buffer.clear();
                idle_flush.as_mut().reset(tokio::time::Instant::now() + TTS_IDLE_FLUSH);
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SessionCommand::ForceEnd => {
                        info!("force-end command received");
                        break;
                    }
                }
            }
            else => break,
        }
    }

    voice_session.transition(if failed { SessionState::Failed } else { SessionState::Completed });
    if let Some(t) = tts.as_mut() {
        t.disconnect().await;
    }
    let outcome = voice_session.classify_outcome(&state.stores).await;
    state.stores.bandit.update_arm(&prompt_version_id, |arm| bandit::apply_outcome(arm, outcome)).await;
    session::shutdown(&mut voice_session, &mut provider, &state.stores, state.config.graceful_shutdown_timeout).await;
    state.registry.remove(&call_id);
    reader_task.abort();
    writer_task.abort();
    info!("session ended");
}

/// Awaits the TTS leg's next audio chunk, or never resolves when there is
/// no hybrid TTS leg so it can sit unconditionally in the session
/// `select!` without an `if` guard.
async fn recv_tts(tts: &mut Option<TtsStreamProvider>) -> Result<Option<Vec<u8>>> {
    match tts {
        Some(t) => t.recv_audio().await,
        None => std::future::pending().await,
    }
}

/// Handle one provider event, returning `false` when the caller should
/// stop the session loop (never happens today; reserved for future
/// provider-initiated terminal signals).
async fn handle_event(
    voice_session: &mut VoiceSession,
    provider: &mut RealtimeProvider,
    tts: &mut Option<TtsStreamProvider>,
    tts_buffer: &mut String,
    state: &BridgeState,
    call_id: &str,
    egress_tx: &mpsc::Sender<Vec<u8>>,
    event: ProviderEvent,
) -> bool {
    if let ProviderEvent::FunctionCall { call_id: fn_call_id, name, arguments } = &event {
        if let Err(e) = session::handle_function_call(provider, &state.executor, call_id, voice_session.event_type_id(), fn_call_id, name, arguments).await {
            warn!(error = %e, "function call dispatch failed");
        }
        return true;
    }

    // §4.5 "Barge-in contract": the moment the caller starts talking over
    // the agent, cancel the in-flight response and drop whatever TTS text
    // was queued but not yet spoken.
    if let ProviderEvent::SpeechStarted = &event {
        if let Err(e) = provider.cancel_response().await {
            warn!(error = %e, "response.cancel failed");
        }
        tts_buffer.clear();
    }

    // In hybrid mode the combined provider's own audio is discarded (§9
    // Open Question); only the TTS leg's mu-law output reaches the carrier.
    if let ProviderEvent::TranscriptDelta(delta) = &event {
        if let Some(t) = tts.as_mut() {
            tts_buffer.push_str(delta);
            if let Some((head, tail)) = split_sentence_boundary(tts_buffer) {
                if let Err(e) = t.send_text(&head, true).await {
                    warn!(error = %e, "tts send_text failed");
                }
                *tts_buffer = tail;
            }
        }
    }
    if let ProviderEvent::ResponseDone { .. } = &event {
        if let Some(t) = tts.as_mut() {
            if !tts_buffer.is_empty() {
                if let Err(e) = t.send_text(tts_buffer, true).await {
                    warn!(error = %e, "tts final flush failed");
                }
                tts_buffer.clear();
            }
        }
    }

    let digits_batches = voice_session.apply_event(&event);
    if let ProviderEvent::AudioDelta(pcm_24k) = &event {
        if tts.is_none() && !voice_session.is_egress_suppressed() {
            let mulaw = voice_session.transcode_egress(pcm_24k);
            let _ = egress_tx.send(mulaw).await;
        }
    }
    for digits in digits_batches {
        match state.carrier_dtmf.send_dtmf(call_id, &digits).await {
            Ok(()) => voice_session.record_dtmf_sent(digits),
            Err(e) => {
                warn!(error = %e, digits = %digits, "dtmf send failed");
                voice_session.record_dtmf_failed(&digits);
            }
        }
    }
    true
}

/// Resolve the session's anchor-row context (§4.5 step 1): the agent
/// configuration and whichever prompt version the bandit currently
/// favors, seeding a default arm the first time an agent is ever called.
/// A workspace database would key the agent/contact/campaign lookup off
/// `call_id`; standalone operation has exactly one agent.
async fn resolve_context(call_id: &str, state: &BridgeState) -> SessionContext {
    use crate::types::{Agent, ChannelMode, PromptVersion};

    let agent = Agent {
        agent_id: "default".into(),
        display_name: "Assistant".into(),
        channel_mode: ChannelMode::Voice,
        voice_provider: VoiceProvider::A,
        voice_id: "default".into(),
        base_system_prompt: "You are a helpful scheduling assistant.".into(),
        temperature: 0.8,
        turn_detection_mode: "server_vad".into(),
        turn_detection_threshold: 0.5,
        silence_duration_ms: 500,
        calendar_event_type_id: state.config.default_calendar_event_type_id,
        enabled_tools: vec!["check_availability".into(), "book_appointment".into(), "send_dtmf".into()],
        ivr_enabled: true,
        ivr_goal: None,
        ivr_loop_threshold: 0.85,
    };

    let prompt_version = match session::select_prompt_version(&state.stores, &agent.agent_id).await {
        Some(pv) => pv,
        None => {
            let mut pv = PromptVersion::new(format!("{}-default", agent.agent_id), agent.agent_id.clone(), 1, agent.base_system_prompt.clone());
            pv.initial_greeting = Some(format!("Thanks for calling, this is {}.", agent.display_name));
            state.stores.bandit.upsert_arm(pv.clone()).await;
            pv
        }
    };
    let _ = call_id; // no workspace database to key off of in standalone operation

    SessionContext { agent, contact: None, campaign: None, offer: None, prompt_version }
}
