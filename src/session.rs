//! Voice session state machine (§4.5) — the heart of the core.
//!
//! Coordinates a single call end-to-end. One owning task per session reads
//! every external message from bounded channels and mutates its `Session`
//! locally (§9 "actor-like pattern"); nothing else touches this state.

use crate::bandit;
use crate::codec::{decode_mulaw, encode_mulaw, Resampler};
use crate::dtmf_handler::DtmfHandler;
use crate::executor::{ToolCall, ToolExecutor};
use crate::ivr::{Classifier, LoopDetector, ModeLatch};
use crate::provider::{AudioFormat, Provider, ProviderEvent, SessionConfig, ToolSchema, TurnDetection};
use crate::store::Stores;
use crate::store::BookingOutcome;
use crate::types::{
    Agent, CallOutcome, Campaign, Contact, Direction, IVRMode, Offer, PromptVersion, Session as SessionData, SessionState, TranscriptRole,
};
use anyhow::Result;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

/// Everything the session needs to know about who it's talking to,
/// resolved once at startup (§4.5 step 1).
pub struct SessionContext {
    pub agent: Agent,
    pub contact: Option<Contact>,
    pub campaign: Option<Campaign>,
    pub offer: Option<Offer>,
    pub prompt_version: PromptVersion,
}

/// Commands accepted on a session's registered handle (§4.8). The webhook
/// router and campaign dispatcher only ever ask, never reach in.
#[derive(Debug)]
pub enum SessionCommand {
    /// A terminal call-state transition arrived out-of-band (carrier hangup
    /// webhook racing the media socket).
    ForceEnd,
}

/// Assembles the deterministic, ordered system prompt (§4.5
/// "System-prompt assembly").
pub fn assemble_system_prompt(ctx: &SessionContext, direction: Direction) -> String {
    let mut parts = Vec::new();

    let today = Utc::now().format("%A, %B %-d, %Y");
    parts.push(format!("Today is {today}."));

    parts.push(format!("You are {}.", ctx.agent.display_name));

    parts.push(ctx.prompt_version.system_prompt.clone());

    let mut context_clause = String::new();
    if let Some(contact) = &ctx.contact {
        context_clause.push_str(&format!("You are speaking with {}.", contact.name));
    }
    if let Some(offer) = &ctx.offer {
        context_clause.push_str(&format!(" You may mention this offer: {} ({}).", offer.offer_name, offer.offer_discount));
    }
    context_clause.push_str(match direction {
        Direction::Outbound => " This is an outbound call you initiated.",
        Direction::Inbound => " This is an inbound call the caller initiated.",
    });
    if !context_clause.trim().is_empty() {
        parts.push(context_clause);
    }

    if ctx.agent.ivr_enabled {
        parts.push(
            "If you detect you are navigating an automated phone menu, use <dtmf>N</dtmf> tags to press digits; \
             never speak digits aloud to a menu."
                .to_string(),
        );
    }

    if ctx.agent.calendar_event_type_id.is_some() {
        parts.push(format!(
            "When booking, only offer times returned by check_availability; the current date is {}.",
            Utc::now().format("%Y-%m-%d")
        ));
    }

    parts.push(match direction {
        Direction::Outbound => {
            "Hey! It's me calling. This is a sales call. Do you wanna hang up, or can I tell you why I'm calling?".to_string()
        }
        Direction::Inbound => ctx
            .prompt_version
            .initial_greeting
            .clone()
            .unwrap_or_else(|| format!("Thanks for calling, this is {}.", ctx.agent.display_name)),
    });

    parts.join("\n\n")
}

/// Select the prompt version a session should use for `agent`, per §4.6.
pub async fn select_prompt_version(stores: &Stores, agent_id: &str) -> Option<PromptVersion> {
    let arms = stores.bandit.list_arms(agent_id).await;
    let candidates = bandit::selectable(&arms);
    if candidates.is_empty() {
        return None;
    }
    let owned: Vec<PromptVersion> = candidates.into_iter().cloned().collect();
    let mut rng = rand::rng();
    let idx = bandit::select_arm(&owned, &mut rng);
    Some(owned[idx].clone())
}

/// Drives one call's lifecycle. Holds all mutable per-call state; nothing
/// outside this struct's owning task mutates it.
pub struct VoiceSession {
    pub data: SessionData,
    mode_latch: ModeLatch,
    loop_detector: LoopDetector,
    dtmf: DtmfHandler,
    ingress_resampler: Resampler,
    egress_resampler: Resampler,
    interrupted_since: Option<Instant>,
    response_transcript_buf: String,
    event_type_id: Option<u64>,
}

impl VoiceSession {
    pub fn new(call_id: impl Into<String>, ctx: &SessionContext, direction: Direction) -> Self {
        let mut data = SessionData::new(call_id, ctx.agent.agent_id.clone(), ctx.prompt_version.version_id.clone(), direction);
        data.contact_id = ctx.contact.as_ref().map(|c| c.contact_id.clone());
        Self {
            data,
            mode_latch: ModeLatch::default(),
            loop_detector: LoopDetector::with_threshold(ctx.agent.ivr_loop_threshold as f64),
            dtmf: DtmfHandler::default(),
            ingress_resampler: Resampler::new(8_000, 24_000),
            egress_resampler: Resampler::new(24_000, 8_000),
            interrupted_since: None,
            response_transcript_buf: String::new(),
            event_type_id: ctx.agent.calendar_event_type_id,
        }
    }

    pub fn build_session_config(ctx: &SessionContext) -> SessionConfig {
        let mut tools = Vec::new();
        if ctx.agent.enabled_tools.iter().any(|t| t == "check_availability") {
            tools.push(ToolSchema {
                name: "check_availability".into(),
                description: "List available appointment slots".into(),
                parameters: serde_json::json!({ "type": "object", "properties": { "start_date": {"type":"string"}, "end_date": {"type":"string"} }, "required": ["start_date"] }),
            });
        }
        if ctx.agent.enabled_tools.iter().any(|t| t == "book_appointment") {
            tools.push(ToolSchema {
                name: "book_appointment".into(),
                description: "Book an appointment at a confirmed slot".into(),
                parameters: serde_json::json!({ "type": "object", "properties": { "date": {"type":"string"}, "time": {"type":"string"}, "email": {"type":"string"} }, "required": ["date", "time", "email"] }),
            });
        }
        if ctx.agent.enabled_tools.iter().any(|t| t == "send_dtmf") {
            tools.push(ToolSchema {
                name: "send_dtmf".into(),
                description: "Send DTMF digits to the remote party".into(),
                parameters: serde_json::json!({ "type": "object", "properties": { "digits": {"type":"string"} }, "required": ["digits"] }),
            });
        }

        SessionConfig {
            instructions: assemble_system_prompt(ctx, Direction::Inbound),
            input_audio_format: AudioFormat::Pcm16_24k,
            output_audio_format: AudioFormat::Pcm16_24k,
            turn_detection: TurnDetection {
                kind: ctx.agent.turn_detection_mode.clone(),
                threshold: ctx.agent.turn_detection_threshold,
                prefix_padding_ms: 300,
                silence_duration_ms: ctx.agent.silence_duration_ms,
            },
            tools,
        }
    }

    /// Ingress: carrier mu-law 8kHz frame -> PCM16 24kHz for the provider.
    pub fn transcode_ingress(&mut self, mulaw_frame: &[u8]) -> Vec<u8> {
        let pcm_8k = decode_mulaw(mulaw_frame);
        self.ingress_resampler.process(&pcm_8k)
    }

    /// Egress (combined-provider mode): PCM16 24kHz from the provider ->
    /// mu-law 8kHz for the carrier. Hybrid-mode TTS audio is already
    /// mu-law 8kHz and bypasses this entirely.
    pub fn transcode_egress(&mut self, pcm_24k: &[u8]) -> Vec<u8> {
        let pcm_8k = self.egress_resampler.process(pcm_24k);
        encode_mulaw(&pcm_8k)
    }

    /// Whether the session should currently suppress egress audio
    /// (§4.5 "Barge-in contract": local drain is authoritative).
    pub fn is_egress_suppressed(&self) -> bool {
        self.data.is_interrupted
    }

    fn on_speech_started(&mut self) {
        self.data.is_interrupted = true;
        self.interrupted_since = Some(Instant::now());
    }

    fn on_response_created(&mut self) {
        self.data.is_interrupted = false;
        self.interrupted_since = None;
        self.dtmf.reset_scan();
        self.response_transcript_buf.clear();
    }

    fn on_response_done(&mut self, cancelled: bool) {
        if !cancelled && !self.response_transcript_buf.is_empty() {
            self.data.push_transcript(TranscriptRole::Agent, self.response_transcript_buf.clone());
        }
    }

    fn on_transcript_delta(&mut self, delta: &str) -> Vec<String> {
        self.response_transcript_buf.push_str(delta);
        let digits = self.dtmf.scan(&self.response_transcript_buf, Instant::now());
        for d in &digits {
            info!(call_id = %self.data.session_id, digits = %d, "dtmf digits ready to send");
        }
        digits
    }

    fn on_user_transcript_completed(&mut self, text: &str) {
        self.data.push_transcript(TranscriptRole::User, text.to_string());
        let (mode, _confidence) = Classifier::classify(text);
        if self.mode_latch.feed(mode) {
            self.data.ivr.mode = Some(self.mode_latch.current());
            if self.mode_latch.current() == IVRMode::Conversation {
                self.data.ivr = Default::default();
                self.data.ivr.mode = Some(IVRMode::Conversation);
            }
        }
        if self.mode_latch.current() == IVRMode::Ivr {
            let is_loop = self.loop_detector.record(text);
            self.data.ivr.loop_detected = is_loop;
            self.data.ivr.last_menu_transcript = Some(text.to_string());
        }
    }

    /// Apply one provider event, returning any DTMF digit sequences newly
    /// ready to transmit (the caller forwards these to the carrier
    /// call-control API and records them via `record_dtmf_sent`).
    pub fn apply_event(&mut self, event: &ProviderEvent) -> Vec<String> {
        match event {
            ProviderEvent::AudioDelta(_) => Vec::new(),
            ProviderEvent::TranscriptDelta(delta) => self.on_transcript_delta(delta),
            ProviderEvent::UserTranscriptCompleted(text) => {
                self.on_user_transcript_completed(text);
                Vec::new()
            }
            ProviderEvent::SpeechStarted => {
                self.on_speech_started();
                Vec::new()
            }
            ProviderEvent::ResponseCreated => {
                self.on_response_created();
                Vec::new()
            }
            ProviderEvent::ResponseDone { cancelled } => {
                self.on_response_done(*cancelled);
                Vec::new()
            }
            ProviderEvent::FunctionCall { .. } => Vec::new(),
        }
    }

    pub fn record_dtmf_sent(&mut self, digits: String) {
        self.data.ivr.attempted_dtmf.push(digits);
    }

    pub fn record_dtmf_failed(&mut self, digits: &str) {
        if !self.data.ivr.failed_dtmf.iter().any(|d| d == digits) {
            self.data.ivr.failed_dtmf.push(digits.to_string());
        }
    }

    /// Digits attempted but never marked failed, restricted to 0-9, for
    /// "try a different digit" navigation guidance (§8 S4).
    pub fn untried_digits(&self) -> Vec<char> {
        ('0'..='9')
            .filter(|d| {
                let s = d.to_string();
                !self.data.ivr.attempted_dtmf.contains(&s) || self.data.ivr.failed_dtmf.contains(&s)
            })
            .collect()
    }

    pub fn transition(&mut self, state: SessionState) {
        self.data.state = state;
    }

    /// Event-type id to book against, resolved once at connection setup
    /// from the agent's calendar configuration (§4.5 step 1).
    pub fn event_type_id(&self) -> Option<u64> {
        self.event_type_id
    }

    /// Classify the call's terminal outcome for bandit reward reporting
    /// (§4.6). A detected voicemail is always a rejection regardless of
    /// what the tool executor recorded; otherwise the booking outcome the
    /// executor persisted is authoritative, falling back to whether any
    /// conversation actually happened.
    pub async fn classify_outcome(&self, stores: &Stores) -> CallOutcome {
        if self.data.ivr.mode == Some(IVRMode::Voicemail) {
            return CallOutcome::Rejected;
        }
        match stores.sessions.get_booking_outcome(&self.data.session_id).await {
            Some(BookingOutcome::Success) => CallOutcome::BookedAppointment,
            Some(BookingOutcome::Failed) => CallOutcome::Rejected,
            None if !self.data.transcript.is_empty() => CallOutcome::LeadQualified,
            None => CallOutcome::Failed,
        }
    }
}

/// Runs the session's tool-call/function-call leg: dispatches to the
/// executor, submits the result back to the provider, and requests the
/// next response (§4.5 "function_call / output_item.done").
pub async fn handle_function_call(
    provider: &mut dyn Provider,
    executor: &ToolExecutor,
    call_id: &str,
    event_type_id: Option<u64>,
    call_id_for_tool: &str,
    name: &str,
    arguments_json: &str,
) -> Result<()> {
    let parsed = serde_json::from_str::<serde_json::Value>(arguments_json).unwrap_or(serde_json::json!({}));
    let tool_call_value = serde_json::json!({ "name": name, "arguments": parsed });
    let tool_call: Result<ToolCall, _> = serde_json::from_value(tool_call_value);
    let outcome = match tool_call {
        Ok(call) => executor.execute(call_id, event_type_id, call).await,
        Err(_) => crate::executor::ToolOutcome {
            success: false,
            data: serde_json::json!({ "error": format!("unknown tool: {name}") }),
        },
    };
    let result_value = serde_json::to_value(&outcome)?;
    provider.submit_tool_result(call_id_for_tool, result_value).await?;
    provider.request_response().await?;
    Ok(())
}

/// Connects a provider with the §5 initial-connection timeout configured
/// via `[timeouts] provider_connect_secs`.
pub async fn connect_provider(provider: &mut dyn Provider, url: &str, api_key: &str, connect_timeout: Duration) -> Result<()> {
    timeout(connect_timeout, provider.connect(url, api_key))
        .await
        .map_err(|_| anyhow::anyhow!("provider connection timed out"))??;
    Ok(())
}

/// Graceful session teardown: cancel children, flush transcript via the
/// store, close the provider, with the §5 hard upper bound configured via
/// `[timeouts] graceful_shutdown_secs`.
pub async fn shutdown(session: &mut VoiceSession, provider: &mut dyn Provider, stores: &Stores, shutdown_timeout: Duration) {
    let work = async {
        provider.disconnect().await;
    };
    if timeout(shutdown_timeout, work).await.is_err() {
        warn!(call_id = %session.data.session_id, "graceful shutdown exceeded deadline, forcing close");
    }
    stores.sessions.save_transcript(&session.data.session_id, session.data.transcript.clone()).await;
}

/// Owning handle type registered in the session registry (§4.8).
pub type SessionSender = mpsc::Sender<SessionCommand>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArmStatus, ChannelMode, VoiceProvider};

    fn test_agent() -> Agent {
        Agent {
            agent_id: "agent-1".into(),
            display_name: "Jess".into(),
            channel_mode: ChannelMode::Voice,
            voice_provider: VoiceProvider::A,
            voice_id: "v1".into(),
            base_system_prompt: "You help callers book appointments.".into(),
            temperature: 0.8,
            turn_detection_mode: "server_vad".into(),
            turn_detection_threshold: 0.5,
            silence_duration_ms: 500,
            calendar_event_type_id: Some(42),
            enabled_tools: vec!["check_availability".into(), "book_appointment".into()],
            ivr_enabled: true,
            ivr_goal: None,
            ivr_loop_threshold: 0.85,
        }
    }

    fn test_ctx(direction: Direction) -> SessionContext {
        let mut prompt_version = PromptVersion::new("v1", "agent-1", 1, "You help callers book appointments.");
        prompt_version.arm_status = ArmStatus::Active;
        prompt_version.initial_greeting = Some("Hi, thanks for calling Jess's office!".into());
        SessionContext {
            agent: test_agent(),
            contact: Some(Contact {
                contact_id: "c1".into(),
                workspace: "w1".into(),
                phone: "+15551234567".into(),
                name: "Alice".into(),
                email: Some("alice@example.com".into()),
                opted_out: false,
                first_contacted_at: None,
            }),
            campaign: None,
            offer: None,
            prompt_version,
        }
        .tap_direction(direction)
    }

    trait TapDirection {
        fn tap_direction(self, _direction: Direction) -> Self;
    }
    impl TapDirection for SessionContext {
        fn tap_direction(self, _direction: Direction) -> Self {
            self
        }
    }

    #[test]
    fn system_prompt_assembly_is_ordered() {
        let ctx = test_ctx(Direction::Inbound);
        let prompt = assemble_system_prompt(&ctx, Direction::Inbound);
        let today_idx = prompt.find("Today is").unwrap();
        let identity_idx = prompt.find("You are Jess").unwrap();
        let base_idx = prompt.find("You help callers book appointments").unwrap();
        let context_idx = prompt.find("You are speaking with Alice").unwrap();
        let booking_idx = prompt.find("only offer times returned").unwrap();
        assert!(today_idx < identity_idx);
        assert!(identity_idx < base_idx);
        assert!(base_idx < context_idx);
        assert!(context_idx < booking_idx);
    }

    #[test]
    fn outbound_prompt_uses_pattern_interrupt_opener() {
        let ctx = test_ctx(Direction::Outbound);
        let prompt = assemble_system_prompt(&ctx, Direction::Outbound);
        assert!(prompt.contains("This is a sales call"));
    }

    #[test]
    fn inbound_prompt_uses_configured_greeting() {
        let ctx = test_ctx(Direction::Inbound);
        let prompt = assemble_system_prompt(&ctx, Direction::Inbound);
        assert!(prompt.contains("Hi, thanks for calling Jess's office!"));
    }

    #[test]
    fn barge_in_suppresses_egress_until_response_created() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        assert!(!session.is_egress_suppressed());
        session.apply_event(&ProviderEvent::SpeechStarted);
        assert!(session.is_egress_suppressed());
        session.apply_event(&ProviderEvent::ResponseCreated);
        assert!(!session.is_egress_suppressed());
    }

    #[test]
    fn transcript_grows_monotonically_across_events() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        session.apply_event(&ProviderEvent::ResponseCreated);
        session.apply_event(&ProviderEvent::TranscriptDelta("Hello".into()));
        session.apply_event(&ProviderEvent::TranscriptDelta(" there.".into()));
        session.apply_event(&ProviderEvent::ResponseDone { cancelled: false });
        assert_eq!(session.data.transcript.len(), 1);
        assert_eq!(session.data.transcript[0].text, "Hello there.");

        session.apply_event(&ProviderEvent::UserTranscriptCompleted("I'd like to book Monday".into()));
        assert_eq!(session.data.transcript.len(), 2);
    }

    #[test]
    fn cancelled_response_does_not_append_transcript() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        session.apply_event(&ProviderEvent::ResponseCreated);
        session.apply_event(&ProviderEvent::TranscriptDelta("partial".into()));
        session.apply_event(&ProviderEvent::ResponseDone { cancelled: true });
        assert!(session.data.transcript.is_empty());
    }

    #[test]
    fn ivr_mode_switch_requires_consecutive_classifications() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        let menu = "For sales press 1, for support press 2";
        session.apply_event(&ProviderEvent::UserTranscriptCompleted(menu.into()));
        assert_ne!(session.data.ivr.mode, Some(IVRMode::Ivr));
        session.apply_event(&ProviderEvent::UserTranscriptCompleted(menu.into()));
        assert_eq!(session.data.ivr.mode, Some(IVRMode::Ivr));
    }

    #[test]
    fn transcode_round_trip_produces_mulaw_sized_output() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        let mulaw_frame = vec![0xFFu8; 160]; // 20ms @ 8kHz
        let pcm_24k = session.transcode_ingress(&mulaw_frame);
        assert_eq!(pcm_24k.len(), 160 * 2 * 3); // 2 bytes/sample, 3x upsample

        let back_to_mulaw = session.transcode_egress(&pcm_24k);
        assert!(back_to_mulaw.len() > 0);
    }

    #[test]
    fn record_dtmf_sent_and_failed_tracked_separately() {
        let ctx = test_ctx(Direction::Inbound);
        let mut session = VoiceSession::new("C1", &ctx, Direction::Inbound);
        session.record_dtmf_sent("1".into());
        session.record_dtmf_failed("1");
        assert!(session.data.ivr.attempted_dtmf.contains(&"1".to_string()));
        assert!(session.data.ivr.failed_dtmf.contains(&"1".to_string()));
    }
}
