//! Conversational AI provider abstraction (§9 "Provider differences behind
//! a common interface").
//!
//! The source has three provider classes sharing a base; here that becomes
//! a capability-set trait plus a tagged session kind for `combined` vs.
//! `hybrid(stt_llm + tts)`. Both concrete providers speak the same
//! WebSocket transport idiom used elsewhere in this codebase for outbound
//! realtime connections.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm16_24k,
    Mulaw8k,
}

#[derive(Debug, Clone)]
pub struct TurnDetection {
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The initial `session.update` contents (§4.5 step 3, §6).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub instructions: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub turn_detection: TurnDetection,
    pub tools: Vec<ToolSchema>,
}

/// Events consumed from a provider's WebSocket (§4.5 event processing).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    AudioDelta(Vec<u8>),
    TranscriptDelta(String),
    UserTranscriptCompleted(String),
    SpeechStarted,
    ResponseCreated,
    ResponseDone { cancelled: bool },
    FunctionCall { call_id: String, name: String, arguments: String },
}

/// The capability set every provider implements, regardless of whether
/// it's a combined STT+LLM+TTS socket or one leg of a hybrid pair.
#[async_trait]
pub trait Provider: Send {
    async fn connect(&mut self, url: &str, api_key: &str) -> Result<()>;
    async fn configure(&mut self, config: &SessionConfig) -> Result<()>;
    async fn send_audio(&mut self, pcm_bytes: &[u8]) -> Result<()>;
    async fn inject_context(&mut self, text: &str) -> Result<()>;
    async fn submit_tool_result(&mut self, call_id: &str, result: Value) -> Result<()>;
    async fn request_response(&mut self) -> Result<()>;
    async fn cancel_response(&mut self) -> Result<()>;
    /// Pulls the next event; `Ok(None)` means the socket closed cleanly.
    async fn recv_event(&mut self) -> Result<Option<ProviderEvent>>;
    async fn disconnect(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A single realtime combined (STT+LLM+TTS) provider connection.
pub struct RealtimeProvider {
    stream: Option<WsStream>,
}

impl Default for RealtimeProvider {
    fn default() -> Self {
        Self { stream: None }
    }
}

impl RealtimeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream> {
        self.stream.as_mut().context("provider not connected")
    }
}

#[async_trait]
impl Provider for RealtimeProvider {
    async fn connect(&mut self, url: &str, api_key: &str) -> Result<()> {
        let request = url.into_client_request_with_auth(api_key)?;
        let (stream, _response) = connect_async(request.take()).await.context("provider websocket connect failed")?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn configure(&mut self, config: &SessionConfig) -> Result<()> {
        let tools: Vec<Value> = config
            .tools
            .iter()
            .map(|t| json!({ "type": "function", "name": t.name, "description": t.description, "parameters": t.parameters }))
            .collect();
        let msg = json!({
            "type": "session.update",
            "session": {
                "instructions": config.instructions,
                "audio": {
                    "input": { "format": audio_format_str(config.input_audio_format) },
                    "output": { "format": audio_format_str(config.output_audio_format) },
                },
                "turn_detection": {
                    "type": config.turn_detection.kind,
                    "threshold": config.turn_detection.threshold,
                    "prefix_padding_ms": config.turn_detection.prefix_padding_ms,
                    "silence_duration_ms": config.turn_detection.silence_duration_ms,
                },
                "tools": tools,
            }
        });
        self.send_json(&msg).await
    }

    async fn send_audio(&mut self, pcm_bytes: &[u8]) -> Result<()> {
        let audio_b64 = crate::codec::encode_frame_payload(pcm_bytes);
        self.send_json(&json!({ "type": "input_audio_buffer.append", "audio": audio_b64 })).await
    }

    async fn inject_context(&mut self, text: &str) -> Result<()> {
        self.send_json(&json!({
            "type": "conversation.item.create",
            "item": { "type": "message", "role": "system", "content": [{ "type": "input_text", "text": text }] }
        }))
        .await?;
        self.request_response().await
    }

    async fn submit_tool_result(&mut self, call_id: &str, result: Value) -> Result<()> {
        self.send_json(&json!({
            "type": "conversation.item.create",
            "item": { "type": "function_call_output", "call_id": call_id, "output": result.to_string() }
        }))
        .await?;
        self.request_response().await
    }

    async fn request_response(&mut self) -> Result<()> {
        self.send_json(&json!({ "type": "response.create" })).await
    }

    async fn cancel_response(&mut self) -> Result<()> {
        self.send_json(&json!({ "type": "response.cancel" })).await
    }

    async fn recv_event(&mut self) -> Result<Option<ProviderEvent>> {
        loop {
            let stream = self.stream_mut()?;
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(event) = parse_event(&text) {
                        return Ok(Some(event));
                    }
                    // Event type we don't act on (e.g. rate_limits.updated); keep reading.
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => bail!("provider websocket error: {e}"),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

impl RealtimeProvider {
    async fn send_json(&mut self, value: &Value) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.send(WsMessage::Text(value.to_string().into())).await.context("provider websocket send failed")?;
        Ok(())
    }
}

fn audio_format_str(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Pcm16_24k => "pcm16_24000hz",
        AudioFormat::Mulaw8k => "g711_ulaw",
    }
}

fn parse_event(text: &str) -> Option<ProviderEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    match kind {
        "response.audio.delta" | "response.output_audio.delta" => {
            let b64 = value.get("delta")?.as_str()?;
            let bytes = crate::codec::decode_frame_payload(b64).ok()?;
            Some(ProviderEvent::AudioDelta(bytes))
        }
        "response.audio_transcript.delta" | "response.output_text.delta" => {
            let delta = value.get("delta")?.as_str()?.to_string();
            Some(ProviderEvent::TranscriptDelta(delta))
        }
        "conversation.item.input_audio_transcription.completed" => {
            let transcript = value.get("transcript")?.as_str()?.to_string();
            Some(ProviderEvent::UserTranscriptCompleted(transcript))
        }
        "input_audio_buffer.speech_started" => Some(ProviderEvent::SpeechStarted),
        "response.created" => Some(ProviderEvent::ResponseCreated),
        "response.done" => {
            let status = value.pointer("/response/status").and_then(|v| v.as_str()).unwrap_or("completed");
            Some(ProviderEvent::ResponseDone { cancelled: status == "cancelled" })
        }
        "response.function_call_arguments.done" => {
            let call_id = value.get("call_id")?.as_str()?.to_string();
            let name = value.get("name")?.as_str()?.to_string();
            let arguments = value.get("arguments")?.as_str()?.to_string();
            Some(ProviderEvent::FunctionCall { call_id, name, arguments })
        }
        other => {
            debug!(event = other, "unhandled provider event type");
            None
        }
    }
}

trait ClientRequestExt {
    fn into_client_request_with_auth(self, api_key: &str) -> Result<RequestHolder>;
}

impl ClientRequestExt for &str {
    fn into_client_request_with_auth(self, api_key: &str) -> Result<RequestHolder> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let mut request = self.into_client_request().context("invalid provider websocket url")?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {api_key}").parse().context("invalid provider api key header")?);
        Ok(RequestHolder(Some(request)))
    }
}

struct RequestHolder(Option<tokio_tungstenite::tungstenite::http::Request<()>>);

impl RequestHolder {
    fn take(mut self) -> tokio_tungstenite::tungstenite::http::Request<()> {
        self.0.take().expect("request taken twice")
    }
}

/// Text-streaming TTS provider used for the TTS leg of a hybrid session
/// (§4.5 step 2). Accepts text fragments with an explicit flush signal and
/// streams back mu-law 8kHz audio already encoded, so no resampling is
/// needed on egress in hybrid mode.
pub struct TtsStreamProvider {
    stream: Option<WsStream>,
}

impl Default for TtsStreamProvider {
    fn default() -> Self {
        Self { stream: None }
    }
}

impl TtsStreamProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn send_text(&mut self, text: &str, flush: bool) -> Result<()> {
        let stream = self.stream.as_mut().context("tts provider not connected")?;
        let msg = json!({ "type": "text", "text": text, "flush": flush });
        stream.send(WsMessage::Text(msg.to_string().into())).await.context("tts websocket send failed")?;
        Ok(())
    }

    pub async fn connect(&mut self, url: &str, api_key: &str) -> Result<()> {
        let request = url.into_client_request_with_auth(api_key)?;
        let (stream, _) = connect_async(request.take()).await.context("tts websocket connect failed")?;
        self.stream = Some(stream);
        Ok(())
    }

    pub async fn recv_audio(&mut self) -> Result<Option<Vec<u8>>> {
        let stream = self.stream.as_mut().context("tts provider not connected")?;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => bail!("tts websocket error: {e}"),
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Splits agent transcript into a flush-ready sentence and the remainder,
/// applying the punctuation-or-idle flush rule (§4.5: flush on sentence-end
/// punctuation or after a 150ms idle, whichever first). The idle branch is
/// the caller's responsibility (a timer); this function only detects
/// sentence boundaries.
pub fn split_sentence_boundary(buffer: &str) -> Option<(String, String)> {
    let boundary = buffer.rfind(['.', '!', '?'])?;
    let (head, tail) = buffer.split_at(boundary + 1);
    if head.trim().is_empty() {
        return None;
    }
    Some((head.to_string(), tail.to_string()))
}
