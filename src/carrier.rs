//! Telephony carrier call-control client and webhook verification (§6).
//!
//! Distinct from `executor::CarrierDtmfClient`, which only needs
//! `send_dtmf` for the tool leg. This is the fuller client the media
//! bridge and campaign dispatcher use to actually place and answer calls
//! and to start/stop the media stream leg.

use crate::error::classify_http;
use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub base_url: String,
    pub api_key: String,
    pub webhook_signing_secret: Option<String>,
    pub connection_id: Option<String>,
    pub stream_websocket_url: String,
}

/// Process-wide cache of the discovered Call-Control Application entity
/// id (§6), since carriers tie webhook routing to it and it rarely
/// changes. Resolved lazily on first use and kept for the process
/// lifetime.
static CONNECTION_ID: OnceCell<String> = OnceCell::new();

pub struct CallControlClient {
    http: Client,
    config: CarrierConfig,
}

impl CallControlClient {
    pub fn new(http: Client, config: CarrierConfig) -> Self {
        Self { http, config }
    }

    /// Resolve and cache the call-control application id, auto-discovering
    /// it from the carrier's connections listing when not configured.
    pub async fn connection_id(&self) -> Result<String> {
        if let Some(id) = CONNECTION_ID.get() {
            return Ok(id.clone());
        }
        if let Some(id) = &self.config.connection_id {
            let _ = CONNECTION_ID.set(id.clone());
            return Ok(id.clone());
        }
        let url = format!("{}/connections", self.config.base_url);
        let resp = self.http.get(&url).bearer_auth(&self.config.api_key).send().await.context("list connections failed")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("list connections classified as {}: {body}", classify_http(status.as_u16(), &body));
        }
        #[derive(Deserialize)]
        struct Connections {
            data: Vec<ConnectionEntry>,
        }
        #[derive(Deserialize)]
        struct ConnectionEntry {
            id: String,
        }
        let parsed: Connections = serde_json::from_str(&body).context("connections response decode failed")?;
        let id = parsed.data.first().context("carrier returned no call-control connections")?.id.clone();
        let _ = CONNECTION_ID.set(id.clone());
        info!(connection_id = %id, "auto-discovered call-control connection id");
        Ok(id)
    }

    pub async fn answer(&self, call_control_id: &str) -> Result<()> {
        let connection_id = self.connection_id().await?;
        self.action(call_control_id, "answer", json!({ "call_control_id": connection_id })).await
    }

    pub async fn hangup(&self, call_control_id: &str) -> Result<()> {
        self.action(call_control_id, "hangup", json!({})).await
    }

    pub async fn start_streaming(&self, call_control_id: &str, stream_track: &str) -> Result<()> {
        self.action(
            call_control_id,
            "streaming_start",
            json!({
                "stream_url": self.config.stream_websocket_url,
                "stream_track": stream_track,
                "stream_bidirectional_mode": "rtp",
                "stream_bidirectional_codec": "PCMU",
            }),
        )
        .await
    }

    pub async fn stop_streaming(&self, call_control_id: &str) -> Result<()> {
        self.action(call_control_id, "streaming_stop", json!({})).await
    }

    pub async fn outbound_dial(&self, to: &str, from: &str) -> Result<String> {
        let connection_id = self.connection_id().await?;
        let url = format!("{}/calls", self.config.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "to": to, "from": from, "connection_id": connection_id }))
            .send()
            .await
            .context("outbound dial request failed")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("outbound dial classified as {}: {body}", classify_http(status.as_u16(), &body));
        }
        let value: serde_json::Value = serde_json::from_str(&body).context("outbound dial response decode failed")?;
        value
            .pointer("/data/call_control_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .context("outbound dial response missing call_control_id")
    }

    async fn action(&self, call_control_id: &str, action: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/calls/{}/actions/{}", self.config.base_url, call_control_id, action);
        let resp = self.http.post(&url).bearer_auth(&self.config.api_key).json(&body).send().await.context("carrier action request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let kind = classify_http(status.as_u16(), &text);
            warn!(action, %kind, "carrier action failed");
            anyhow::bail!("carrier action {action} classified as {kind}: {text}");
        }
        Ok(())
    }

    /// Verify an inbound webhook's HMAC signature (§6), grounded in the
    /// same `v0=<hex hmac>` scheme used for chat-platform webhooks
    /// elsewhere in this codebase.
    pub fn verify_signature(&self, body: &str, timestamp: &str, signature: &str) -> Result<bool> {
        let secret = self.config.webhook_signing_secret.as_ref().context("carrier webhook signing secret not configured")?;
        let basestring = format!("{}|{}", timestamp, body);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("invalid webhook signing secret")?;
        mac.update(basestring.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        Ok(constant_time_eq(signature.as_bytes(), expected.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CarrierConfig {
        CarrierConfig {
            base_url: "http://localhost".into(),
            api_key: "k".into(),
            webhook_signing_secret: Some("shh".into()),
            connection_id: Some("conn-1".into()),
            stream_websocket_url: "wss://example.com/voice/stream".into(),
        }
    }

    #[test]
    fn signature_verification_round_trips() {
        let client = CallControlClient::new(Client::builder().build().unwrap(), config());
        let body = r#"{"event":"call.initiated"}"#;
        let timestamp = "1700000000";
        let basestring = format!("{}|{}", timestamp, body);
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(basestring.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(client.verify_signature(body, timestamp, &sig).unwrap());
    }

    #[test]
    fn signature_verification_rejects_tampered_body() {
        let client = CallControlClient::new(Client::builder().build().unwrap(), config());
        let timestamp = "1700000000";
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(format!("{}|{}", timestamp, "original").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!client.verify_signature("tampered", timestamp, &sig).unwrap());
    }

    #[test]
    fn constant_time_eq_detects_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
