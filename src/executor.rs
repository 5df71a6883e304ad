//! Tool executor (§4.4).
//!
//! Dispatches named function calls the AI provider emits mid-session. Tool
//! dispatch is a closed sum type, not a string-keyed table (§9): one
//! variant per tool, each carrying its own strongly-typed argument struct.

use crate::error::{classify_http, ErrorKind};
use crate::store::{BookingOutcome, SessionStore};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fallback timeout when a caller doesn't wire one up from `Config` (§10.3
/// `[timeouts] tool_exec_secs`).
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
const DTMF_CHARSET: &str = "0123456789*#ABCDw";

/// One variant per tool the AI provider may invoke.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    CheckAvailability {
        start_date: String,
        end_date: Option<String>,
    },
    BookAppointment {
        date: String,
        time: String,
        email: String,
        duration_minutes: Option<u32>,
        notes: Option<String>,
    },
    SendDtmf {
        digits: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl ToolOutcome {
    fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: json!({ "error": message.into() }) }
    }

    fn timed_out() -> Self {
        Self::err("Tool execution timed out")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Slot {
    pub time: String,
    pub iso: String,
    pub display_time: String,
}

#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_event_type_id: Option<u64>,
}

/// Thin REST client for the calendar provider (§6).
pub struct CalendarClient {
    http: Client,
    config: CalendarConfig,
}

impl CalendarClient {
    pub fn new(http: Client, config: CalendarConfig) -> Self {
        Self { http, config }
    }

    async fn fetch_slots(&self, event_type_id: u64, start: &str, end: &str) -> Result<Vec<Slot>> {
        let url = format!("{}/slots/available", self.config.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .query(&[
                ("eventTypeId", event_type_id.to_string()),
                ("startTime", start.to_string()),
                ("endTime", end.to_string()),
            ])
            .send()
            .await
            .context("calendar slots request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let kind = classify_http(status.as_u16(), &body);
            anyhow::bail!("calendar slots fetch classified as {kind}: {body}");
        }
        resp.json::<Vec<Slot>>().await.context("calendar slots response decode failed")
    }

    async fn create_booking(&self, event_type_id: u64, start_iso: &str, email: &str, notes: Option<&str>) -> Result<String> {
        let url = format!("{}/bookings", self.config.base_url);
        let body = json!({
            "eventTypeId": event_type_id,
            "start": start_iso,
            "attendee": { "name": email, "email": email, "timeZone": "UTC", "language": "en" },
            "metadata": notes.map(|n| json!({ "notes": n })),
        });
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("calendar booking request failed")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let kind = classify_http(status.as_u16(), &text);
            anyhow::bail!("calendar booking classified as {kind}: {text}");
        }
        let value: serde_json::Value = serde_json::from_str(&text).context("calendar booking response decode failed")?;
        value
            .get("uid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .context("calendar booking response missing uid")
    }
}

#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Thin REST client for the carrier call-control API (§6), restricted to
/// the operations the tool executor needs. The dispatcher/media bridge use
/// a separate, fuller client for `answer`/`outbound_dial`/streaming.
pub struct CarrierDtmfClient {
    http: Client,
    config: CarrierConfig,
}

impl CarrierDtmfClient {
    pub fn new(http: Client, config: CarrierConfig) -> Self {
        Self { http, config }
    }

    /// `pub(crate)` so the session module can send digits scanned from
    /// agent speech without going through a tool call.
    pub(crate) async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<()> {
        let url = format!("{}/calls/{}/actions/send_dtmf", self.config.base_url, call_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "digits": digits, "duration_millis": 250 }))
            .send()
            .await
            .context("carrier send_dtmf request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let kind = classify_http(status.as_u16(), &body);
            anyhow::bail!("carrier send_dtmf classified as {kind}: {body}");
        }
        Ok(())
    }
}

pub struct ToolExecutor {
    calendar: CalendarClient,
    carrier: CarrierDtmfClient,
    sessions: Arc<dyn SessionStore>,
    tool_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(calendar: CalendarClient, carrier: CarrierDtmfClient, sessions: Arc<dyn SessionStore>, tool_timeout: Duration) -> Self {
        Self { calendar, carrier, sessions, tool_timeout }
    }

    /// Execute a tool call with the §4.4 bounded timeout. `call_id` is the
    /// carrier call id, used to key the booking-outcome record.
    pub async fn execute(&self, call_id: &str, event_type_id: Option<u64>, call: ToolCall) -> ToolOutcome {
        match tokio::time::timeout(self.tool_timeout, self.dispatch(call_id, event_type_id, call)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(call_id = %call_id, "tool execution timed out");
                ToolOutcome::timed_out()
            }
        }
    }

    async fn dispatch(&self, call_id: &str, event_type_id: Option<u64>, call: ToolCall) -> ToolOutcome {
        match call {
            ToolCall::CheckAvailability { start_date, end_date } => {
                self.check_availability(event_type_id, &start_date, end_date.as_deref()).await
            }
            ToolCall::BookAppointment { date, time, email, duration_minutes, notes } => {
                self.book_appointment(call_id, event_type_id, &date, &time, &email, duration_minutes, notes.as_deref()).await
            }
            ToolCall::SendDtmf { digits } => self.send_dtmf(call_id, &digits).await,
        }
    }

    async fn check_availability(&self, event_type_id: Option<u64>, start_date: &str, end_date: Option<&str>) -> ToolOutcome {
        let Some(event_type_id) = event_type_id else {
            return ToolOutcome::err("agent has no calendar_event_type_id configured");
        };
        let end = end_date.unwrap_or(start_date);
        match self.calendar.fetch_slots(event_type_id, start_date, end).await {
            Ok(slots) => ToolOutcome::ok(json!({
                "slots": slots,
                "instructions": "offer ONLY these times; do not invent times",
            })),
            Err(e) => {
                warn!(error = %e, "check_availability failed");
                ToolOutcome::err(format!("{e}"))
            }
        }
    }

    async fn book_appointment(
        &self,
        call_id: &str,
        event_type_id: Option<u64>,
        date: &str,
        time: &str,
        email: &str,
        duration_minutes: Option<u32>,
        notes: Option<&str>,
    ) -> ToolOutcome {
        let _ = duration_minutes;
        let Some(event_type_id) = event_type_id else {
            return ToolOutcome::err("agent has no calendar_event_type_id configured");
        };

        // Re-validate the slot is still present before booking (§4.4).
        let slots = match self.calendar.fetch_slots(event_type_id, date, date).await {
            Ok(slots) => slots,
            Err(e) => return ToolOutcome::err(format!("{e}")),
        };
        let Some(slot) = slots.iter().find(|s| s.time == time) else {
            self.sessions.record_booking_outcome(call_id, BookingOutcome::Failed).await;
            return ToolOutcome::ok(json!({
                "success": false,
                "alternative_slots": slots,
                "message": "the requested time is no longer available; do not re-offer it",
            }));
        };

        match self.calendar.create_booking(event_type_id, &slot.iso, email, notes).await {
            Ok(booking_uid) => {
                self.sessions.record_booking_outcome(call_id, BookingOutcome::Success).await;
                ToolOutcome::ok(json!({ "success": true, "booking_uid": booking_uid }))
            }
            Err(e) => {
                self.sessions.record_booking_outcome(call_id, BookingOutcome::Failed).await;
                warn!(error = %e, "book_appointment failed");
                ToolOutcome::err(format!("{e}"))
            }
        }
    }

    async fn send_dtmf(&self, call_id: &str, digits: &str) -> ToolOutcome {
        if digits.is_empty() || !digits.chars().all(|c| DTMF_CHARSET.contains(c.to_ascii_uppercase())) {
            return ToolOutcome::err(format!("digits must be in the set {DTMF_CHARSET}"));
        }
        if digits.chars().all(|c| c.eq_ignore_ascii_case(&'w')) {
            return ToolOutcome::err("send_dtmf requires at least one actual digit, not only pause characters");
        }
        match self.carrier.send_dtmf(call_id, digits).await {
            Ok(()) => {
                info!(call_id = %call_id, digits = %digits, "dtmf sent via tool executor");
                ToolOutcome::ok(json!({ "success": true }))
            }
            Err(e) => {
                let kind = classify_err(&e);
                warn!(error = %e, ?kind, "send_dtmf failed");
                ToolOutcome::err(format!("{e}"))
            }
        }
    }
}

fn classify_err(e: &anyhow::Error) -> ErrorKind {
    classify_http(0, &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;

    fn http() -> Client {
        Client::builder().build().unwrap()
    }

    #[test]
    fn tool_call_deserializes_from_provider_shape() {
        let raw = json!({
            "name": "check_availability",
            "arguments": { "start_date": "2025-01-13" }
        });
        let call: ToolCall = serde_json::from_value(raw).unwrap();
        matches!(call, ToolCall::CheckAvailability { .. });
    }

    #[tokio::test]
    async fn send_dtmf_rejects_invalid_charset() {
        let executor = ToolExecutor::new(
            CalendarClient::new(http(), CalendarConfig { base_url: "http://localhost".into(), api_key: "k".into(), default_event_type_id: None }),
            CarrierDtmfClient::new(http(), CarrierConfig { base_url: "http://localhost".into(), api_key: "k".into() }),
            InMemorySessionStore::new(),
            DEFAULT_TOOL_TIMEOUT,
        );
        let outcome = executor.execute("C1", None, ToolCall::SendDtmf { digits: "xyz".into() }).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn send_dtmf_rejects_pause_only_payload() {
        let executor = ToolExecutor::new(
            CalendarClient::new(http(), CalendarConfig { base_url: "http://localhost".into(), api_key: "k".into(), default_event_type_id: None }),
            CarrierDtmfClient::new(http(), CarrierConfig { base_url: "http://localhost".into(), api_key: "k".into() }),
            InMemorySessionStore::new(),
            DEFAULT_TOOL_TIMEOUT,
        );
        let outcome = executor.execute("C1", None, ToolCall::SendDtmf { digits: "www".into() }).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn check_availability_without_event_type_errors() {
        let executor = ToolExecutor::new(
            CalendarClient::new(http(), CalendarConfig { base_url: "http://localhost".into(), api_key: "k".into(), default_event_type_id: None }),
            CarrierDtmfClient::new(http(), CarrierConfig { base_url: "http://localhost".into(), api_key: "k".into() }),
            InMemorySessionStore::new(),
            DEFAULT_TOOL_TIMEOUT,
        );
        let outcome = executor.execute("C1", None, ToolCall::CheckAvailability { start_date: "2025-01-13".into(), end_date: None }).await;
        assert!(!outcome.success);
    }
}
