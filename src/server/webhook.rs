//! Carrier call-status webhook (§6).
//!
//! Verifies the HMAC signature on every inbound request, then reacts to
//! the handful of event types that matter outside the media socket itself:
//! a hangup arriving before the media socket closes asks the owning
//! session to end, and a dialed-campaign-call outcome is handed to the
//! campaign dispatcher's SMS-fallback decision.

use super::ServerState;
use crate::campaign::VoiceCallOutcome;
use crate::session::SessionCommand;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    event_type: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    call_control_id: Option<String>,
    #[serde(default)]
    hangup_cause: Option<String>,
}

pub async fn carrier_webhook(State(state): State<ServerState>, headers: HeaderMap, body: String) -> StatusCode {
    let timestamp = headers.get("telnyx-timestamp").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let signature = headers.get("telnyx-signature-ed25519").and_then(|v| v.to_str().ok()).unwrap_or_default();

    match state.carrier.verify_signature(&body, timestamp, signature) {
        Ok(true) => {}
        Ok(false) => {
            warn!("carrier webhook signature mismatch");
            return StatusCode::UNAUTHORIZED;
        }
        Err(e) => {
            warn!(error = %e, "carrier webhook signature verification unavailable, rejecting");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_str(&body) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "carrier webhook body decode failed");
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(call_control_id) = envelope.data.payload.call_control_id.clone() else {
        return StatusCode::OK;
    };

    match envelope.data.event_type.as_str() {
        "call.hangup" => {
            if let Some(handle) = state.bridge.registry.lookup(&call_control_id) {
                let _ = handle.send(SessionCommand::ForceEnd).await;
            }
            if let (Some(dispatcher), Some(cause)) = (&state.campaign, &envelope.data.payload.hangup_cause) {
                if let Some(outcome) = classify_hangup_cause(cause) {
                    info!(call_id = %call_control_id, %cause, "dialed campaign call ended, notifying dispatcher");
                    dispatcher.handle_call_outcome(&call_control_id, outcome).await;
                }
            }
        }
        "call.answered" => {
            info!(call_id = %call_control_id, "carrier reports call answered");
        }
        other => {
            info!(call_id = %call_control_id, event_type = other, "unhandled carrier webhook event type");
        }
    }

    StatusCode::OK
}

fn classify_hangup_cause(cause: &str) -> Option<VoiceCallOutcome> {
    match cause {
        "normal_clearing" => Some(VoiceCallOutcome::Answered),
        "no_answer" | "originator_cancel" | "timeout" => Some(VoiceCallOutcome::NoAnswer),
        "user_busy" => Some(VoiceCallOutcome::Busy),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_hangup_cause_maps_known_causes() {
        assert_eq!(classify_hangup_cause("normal_clearing"), Some(VoiceCallOutcome::Answered));
        assert_eq!(classify_hangup_cause("user_busy"), Some(VoiceCallOutcome::Busy));
        assert_eq!(classify_hangup_cause("no_answer"), Some(VoiceCallOutcome::NoAnswer));
        assert_eq!(classify_hangup_cause("unknown_cause"), None);
    }
}
