//! Domain-typed core entities (§3).
//!
//! These are the in-memory shapes the voice bridge reasons about. They are
//! not a storage layout — persistence is behind the `store` module's traits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which AI provider topology an agent uses for voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceProvider {
    A,
    B,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Voice,
    Text,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub display_name: String,
    pub channel_mode: ChannelMode,
    pub voice_provider: VoiceProvider,
    pub voice_id: String,
    pub base_system_prompt: String,
    pub temperature: f32,
    pub turn_detection_mode: String,
    pub turn_detection_threshold: f32,
    pub silence_duration_ms: u32,
    pub calendar_event_type_id: Option<u64>,
    pub enabled_tools: Vec<String>,
    pub ivr_enabled: bool,
    pub ivr_goal: Option<String>,
    pub ivr_loop_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmStatus {
    Active,
    Paused,
    Eliminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub version_id: String,
    pub agent_id: String,
    pub version_number: u32,
    pub system_prompt: String,
    pub initial_greeting: Option<String>,
    pub temperature: f32,
    pub is_active: bool,
    pub arm_status: ArmStatus,
    pub alpha: f64,
    pub beta: f64,
    pub reward_count: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub booked_appointments: u64,
}

impl PromptVersion {
    /// A fresh arm starts with a uniform Beta(1,1) prior.
    pub fn new(version_id: impl Into<String>, agent_id: impl Into<String>, version_number: u32, system_prompt: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            agent_id: agent_id.into(),
            version_number,
            system_prompt: system_prompt.into(),
            initial_greeting: None,
            temperature: 0.8,
            is_active: true,
            arm_status: ArmStatus::Active,
            alpha: 1.0,
            beta: 1.0,
            reward_count: 0,
            total_calls: 0,
            successful_calls: 0,
            booked_appointments: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: String,
    pub workspace: String,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub opted_out: bool,
    pub first_contacted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Sms,
    VoiceSmsFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Canceled,
}

impl CampaignStatus {
    /// §3 invariant: draft→(scheduled|running)↔paused→completed; terminal states are sinks.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (Completed, _) | (Canceled, _) => false,
            (Draft, Scheduled) | (Draft, Running) | (Draft, Canceled) => true,
            (Scheduled, Running) | (Scheduled, Canceled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Canceled) => true,
            (Paused, Running) | (Paused, Canceled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendingHours {
    pub start: chrono::NaiveTime,
    pub end: chrono::NaiveTime,
    pub tz: String,
    /// 0 = Sunday .. 6 = Saturday, matching chrono::Weekday::num_days_from_sunday.
    pub days: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub offer_name: String,
    pub offer_discount: String,
    pub offer_description: String,
    pub offer_terms: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: String,
    pub workspace: String,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    pub from_numbers: Vec<String>,
    pub initial_message_template: Option<String>,
    pub agent_id: Option<String>,
    pub sending_hours: Option<SendingHours>,
    pub messages_per_minute: u32,
    pub max_follow_ups: u32,
    pub follow_up_delay_hours: u32,
    pub offer: Option<Offer>,
    pub sms_fallback_on_no_answer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignContactStatus {
    Pending,
    Sent,
    Delivered,
    Replied,
    Qualified,
    OptedOut,
    Failed,
    Completed,
    Calling,
    CallAnswered,
    CallFailed,
    SmsFallbackSent,
}

impl CampaignContactStatus {
    /// §3 invariant: opted_out/failed/completed are terminal sinks.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignContactStatus::OptedOut | CampaignContactStatus::Failed | CampaignContactStatus::Completed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignContact {
    pub campaign_id: String,
    pub contact_id: String,
    pub status: CampaignContactStatus,
    pub messages_sent: u32,
    pub follow_ups_sent: u32,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub call_attempts: u32,
    pub last_error: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    Ringing,
    Answered,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IVRMode {
    Unknown,
    Conversation,
    Ivr,
    Voicemail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IVRStatus {
    pub mode: Option<IVRMode>,
    pub loop_detected: bool,
    pub consecutive_ivr: u32,
    pub consecutive_human: u32,
    pub attempted_dtmf: Vec<String>,
    pub failed_dtmf: Vec<String>,
    pub last_menu_transcript: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub prompt_version_id: String,
    pub contact_id: Option<String>,
    pub direction: Direction,
    pub state: SessionState,
    pub is_interrupted: bool,
    pub ivr: IVRStatus,
    pub transcript: Vec<TranscriptEntry>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>, prompt_version_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            prompt_version_id: prompt_version_id.into(),
            contact_id: None,
            direction,
            state: SessionState::Initiated,
            is_interrupted: false,
            ivr: IVRStatus::default(),
            transcript: Vec::new(),
        }
    }

    /// §3: transcript length is monotonically non-decreasing.
    pub fn push_transcript(&mut self, role: TranscriptRole, text: impl Into<String>) {
        self.transcript.push(TranscriptEntry { role, text: text.into() });
    }
}

/// Outcome classification used to update the bandit arm when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    BookedAppointment,
    LeadQualified,
    Rejected,
    Failed,
}

/// Placeholder substitution context for campaign template rendering (§4.7).
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub fields: HashMap<String, String>,
}

impl TemplateContext {
    pub fn from_contact(contact: &Contact, offer: Option<&Offer>) -> Self {
        let mut fields = HashMap::new();
        let mut parts = contact.name.splitn(2, ' ');
        let first = parts.next().unwrap_or("").to_string();
        let last = parts.next().unwrap_or("").to_string();
        fields.insert("first_name".to_string(), first);
        fields.insert("last_name".to_string(), last);
        fields.insert("full_name".to_string(), contact.name.clone());
        fields.insert("company_name".to_string(), String::new());
        fields.insert("email".to_string(), contact.email.clone().unwrap_or_default());
        if let Some(offer) = offer {
            fields.insert("offer_name".to_string(), offer.offer_name.clone());
            fields.insert("offer_discount".to_string(), offer.offer_discount.clone());
            fields.insert("offer_description".to_string(), offer.offer_description.clone());
            fields.insert("offer_terms".to_string(), offer.offer_terms.clone());
        }
        Self { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_terminal_states_are_sinks() {
        assert!(!CampaignStatus::Completed.can_transition_to(CampaignStatus::Running));
        assert!(!CampaignStatus::Canceled.can_transition_to(CampaignStatus::Running));
        assert!(CampaignStatus::Draft.can_transition_to(CampaignStatus::Running));
        assert!(CampaignStatus::Running.can_transition_to(CampaignStatus::Paused));
        assert!(CampaignStatus::Paused.can_transition_to(CampaignStatus::Running));
    }

    #[test]
    fn campaign_contact_terminal_statuses() {
        assert!(CampaignContactStatus::OptedOut.is_terminal());
        assert!(CampaignContactStatus::Failed.is_terminal());
        assert!(CampaignContactStatus::Completed.is_terminal());
        assert!(!CampaignContactStatus::Sent.is_terminal());
    }

    #[test]
    fn session_transcript_grows_monotonically() {
        let mut s = Session::new("C1", "agent-1", "v1", Direction::Inbound);
        assert_eq!(s.transcript.len(), 0);
        s.push_transcript(TranscriptRole::Agent, "hello");
        s.push_transcript(TranscriptRole::User, "hi");
        assert_eq!(s.transcript.len(), 2);
    }

    #[test]
    fn template_context_splits_contact_name() {
        let contact = Contact {
            contact_id: "c1".into(),
            workspace: "w1".into(),
            phone: "+15551234567".into(),
            name: "Alice Smith".into(),
            email: Some("alice@example.com".into()),
            opted_out: false,
            first_contacted_at: None,
        };
        let ctx = TemplateContext::from_contact(&contact, None);
        assert_eq!(ctx.fields.get("first_name").unwrap(), "Alice");
        assert_eq!(ctx.fields.get("last_name").unwrap(), "Smith");
    }
}
