//! Campaign dispatcher (§4.7).
//!
//! Polls running SMS and voice-SMS-fallback campaigns once a second (the
//! same poll-loop idiom as `soul::scheduler::TaskScheduler::start`) and
//! advances each campaign's pending and follow-up-due contacts.

use crate::carrier::CallControlClient;
use crate::types::{Campaign, CampaignContact, CampaignContactStatus, CampaignStatus, CampaignType, Contact, Offer, SendingHours, TemplateContext};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde_json::json;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const PENDING_BATCH_SIZE: usize = 25;

/// Case-insensitive, literal placeholder substitution (§9 "Template string
/// interpolation"). Unknown placeholders are left untouched. Never panics;
/// a malformed template degrades to itself.
pub fn render_template(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let placeholder = &template[i + 1..i + end];
                let key = placeholder.to_lowercase();
                if let Some(value) = ctx.fields.get(&key) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        out.push(template[i..].chars().next().unwrap());
        i += template[i..].chars().next().unwrap().len_utf8();
    }
    out
}

/// Whether `now` falls inside the campaign's sending window. A `None`
/// window always permits sending.
pub fn sending_window_open(hours: Option<&SendingHours>, now: DateTime<Utc>) -> bool {
    let Some(hours) = hours else { return true };
    let tz: Tz = match hours.tz.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(tz = %hours.tz, "unrecognized sending-window timezone, defaulting to closed");
            return false;
        }
    };
    let local = now.with_timezone(&tz);
    let weekday = local.date_naive().weekday().num_days_from_sunday() as u8;
    if !hours.days.is_empty() && !hours.days.contains(&weekday) {
        return false;
    }
    let local_time = local.time();
    if hours.start <= hours.end {
        local_time >= hours.start && local_time <= hours.end
    } else {
        // window spans midnight
        local_time >= hours.start || local_time <= hours.end
    }
}

/// Workspace-scoped opt-out set. Readers are lock-free (`DashMap`); the
/// single write path (`mark`) is naturally serialized per key by the map's
/// sharded locking.
#[async_trait::async_trait]
pub trait OptOutSet: Send + Sync {
    async fn is_opted_out(&self, workspace: &str, phone: &str) -> bool;
    async fn mark(&self, workspace: &str, phone: &str);
}

#[derive(Default)]
pub struct InMemoryOptOutSet {
    entries: DashMap<String, HashSet<String>>,
}

impl InMemoryOptOutSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl OptOutSet for InMemoryOptOutSet {
    async fn is_opted_out(&self, workspace: &str, phone: &str) -> bool {
        self.entries.get(workspace).map(|set| set.contains(phone)).unwrap_or(false)
    }

    async fn mark(&self, workspace: &str, phone: &str) {
        self.entries.entry(workspace.to_string()).or_default().insert(phone.to_string());
    }
}

/// A single sending number's daily usage state (§4.7 "per-number per-day
/// caps and a warm-up schedule").
#[derive(Debug, Clone)]
struct NumberState {
    number: String,
    daily_cap: u32,
    sent_today: u32,
    warm_up_day: u32,
    last_reset: chrono::NaiveDate,
}

/// Acquires a sending number for a campaign, respecting per-number daily
/// caps that ramp up over a warm-up period.
pub struct NumberPool {
    numbers: Mutex<Vec<NumberState>>,
    base_daily_cap: u32,
    warm_up_days: u32,
}

impl NumberPool {
    pub fn new(numbers: Vec<String>, base_daily_cap: u32, warm_up_days: u32) -> Self {
        let today = Utc::now().date_naive();
        Self {
            numbers: Mutex::new(
                numbers
                    .into_iter()
                    .map(|number| NumberState { number, daily_cap: base_daily_cap, sent_today: 0, warm_up_day: 0, last_reset: today })
                    .collect(),
            ),
            base_daily_cap,
            warm_up_days,
        }
    }

    fn warm_up_cap(&self, warm_up_day: u32) -> u32 {
        if self.warm_up_days == 0 || warm_up_day >= self.warm_up_days {
            return self.base_daily_cap;
        }
        let fraction = (warm_up_day + 1) as f64 / (self.warm_up_days + 1) as f64;
        ((self.base_daily_cap as f64) * fraction).ceil().max(1.0) as u32
    }

    /// Acquire the first number still under its (possibly warm-up-reduced)
    /// daily cap, incrementing its usage. Returns `None` if every number
    /// has hit today's cap.
    pub async fn acquire(&self) -> Option<String> {
        let today = Utc::now().date_naive();
        let mut numbers = self.numbers.lock().await;
        for state in numbers.iter_mut() {
            if state.last_reset != today {
                state.sent_today = 0;
                state.warm_up_day += 1;
                state.last_reset = today;
            }
            let cap = self.warm_up_cap(state.warm_up_day);
            if state.sent_today < cap {
                state.sent_today += 1;
                state.daily_cap = cap;
                return Some(state.number.clone());
            }
        }
        None
    }
}

/// Per-campaign token-bucket rate limiter (§5 "SMS send-rate token
/// buckets"). One governor limiter per campaign, created lazily.
#[derive(Default)]
pub struct CampaignRateLimiters {
    limiters: DashMap<String, Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>>,
}

impl CampaignRateLimiters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `true` if a send is permitted right now under the
    /// campaign's `messages_per_minute` quota.
    pub fn try_acquire(&self, campaign_id: &str, messages_per_minute: u32) -> bool {
        let limiter = self
            .limiters
            .entry(campaign_id.to_string())
            .or_insert_with(|| {
                let per_minute = NonZeroU32::new(messages_per_minute.max(1)).unwrap();
                Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
            })
            .clone();
        limiter.check().is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub base_url: String,
    pub api_key: String,
    pub webhook_url: String,
}

pub struct SmsClient {
    http: Client,
    config: SmsConfig,
}

impl SmsClient {
    pub fn new(http: Client, config: SmsConfig) -> Self {
        Self { http, config }
    }

    pub async fn send(&self, from: &str, to: &str, body: &str) -> Result<()> {
        let url = format!("{}/messages", self.config.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "from": from, "to": to, "body": body, "webhook_url": self.config.webhook_url }))
            .send()
            .await
            .context("sms send request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let kind = crate::error::classify_http(status.as_u16(), &text);
            anyhow::bail!("sms send classified as {kind}: {text}");
        }
        Ok(())
    }
}

/// Campaign/contact persistence seam, separate from `store::Stores`
/// because it is consulted by the dispatcher loop, not by a live call
/// session.
#[async_trait::async_trait]
pub trait CampaignStore: Send + Sync {
    async fn list_running(&self) -> Vec<Campaign>;
    async fn fetch_pending(&self, campaign_id: &str, limit: usize) -> Vec<CampaignContact>;
    async fn fetch_follow_up_due(&self, campaign_id: &str, now: DateTime<Utc>) -> Vec<CampaignContact>;
    async fn get_contact(&self, contact_id: &str) -> Option<Contact>;
    async fn get_campaign(&self, campaign_id: &str) -> Option<Campaign>;
    async fn get_campaign_contact(&self, campaign_id: &str, contact_id: &str) -> Option<CampaignContact>;
    async fn update_contact(&self, contact: CampaignContact);
    async fn mark_completed(&self, campaign_id: &str);
    async fn has_outstanding_work(&self, campaign_id: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<String, Campaign>,
    contacts: DashMap<(String, String), CampaignContact>,
    profiles: DashMap<String, Contact>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.campaign_id.clone(), campaign);
    }

    pub fn seed_contact_profile(&self, contact: Contact) {
        self.profiles.insert(contact.contact_id.clone(), contact);
    }

    pub fn seed_campaign_contact(&self, contact: CampaignContact) {
        self.contacts.insert((contact.campaign_id.clone(), contact.contact_id.clone()), contact);
    }
}

#[async_trait::async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn list_running(&self) -> Vec<Campaign> {
        self.campaigns.iter().filter(|e| e.value().status == CampaignStatus::Running).map(|e| e.value().clone()).collect()
    }

    async fn fetch_pending(&self, campaign_id: &str, limit: usize) -> Vec<CampaignContact> {
        let mut rows: Vec<CampaignContact> = self
            .contacts
            .iter()
            .filter(|e| e.key().0 == campaign_id && e.value().status == CampaignContactStatus::Pending)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        rows.truncate(limit);
        rows
    }

    async fn fetch_follow_up_due(&self, campaign_id: &str, now: DateTime<Utc>) -> Vec<CampaignContact> {
        self.contacts
            .iter()
            .filter(|e| {
                e.key().0 == campaign_id
                    && matches!(e.value().status, CampaignContactStatus::Sent | CampaignContactStatus::Delivered)
                    && e.value().next_follow_up_at.map(|t| t <= now).unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    async fn get_contact(&self, contact_id: &str) -> Option<Contact> {
        self.profiles.get(contact_id).map(|v| v.clone())
    }

    async fn get_campaign(&self, campaign_id: &str) -> Option<Campaign> {
        self.campaigns.get(campaign_id).map(|v| v.clone())
    }

    async fn get_campaign_contact(&self, campaign_id: &str, contact_id: &str) -> Option<CampaignContact> {
        self.contacts.get(&(campaign_id.to_string(), contact_id.to_string())).map(|v| v.clone())
    }

    async fn update_contact(&self, contact: CampaignContact) {
        self.contacts.insert((contact.campaign_id.clone(), contact.contact_id.clone()), contact);
    }

    async fn mark_completed(&self, campaign_id: &str) {
        if let Some(mut entry) = self.campaigns.get_mut(campaign_id) {
            if entry.status.can_transition_to(CampaignStatus::Completed) {
                entry.status = CampaignStatus::Completed;
            }
        }
    }

    async fn has_outstanding_work(&self, campaign_id: &str) -> bool {
        self.contacts.iter().any(|e| {
            e.key().0 == campaign_id
                && (e.value().status == CampaignContactStatus::Pending
                    || (matches!(e.value().status, CampaignContactStatus::Sent | CampaignContactStatus::Delivered)
                        && e.value().next_follow_up_at.is_some()))
        })
    }
}

/// Collaborators the dispatcher needs, bundled the way session
/// construction bundles `Stores` (§9 "Global singletons... Deps").
pub struct CampaignDeps {
    pub store: Arc<dyn CampaignStore>,
    pub opt_outs: Arc<dyn OptOutSet>,
    pub numbers: Arc<NumberPool>,
    pub rate_limiters: Arc<CampaignRateLimiters>,
    pub sms: Arc<SmsClient>,
    pub carrier: Arc<CallControlClient>,
}

pub struct CampaignDispatcher {
    deps: CampaignDeps,
    /// carrier call_control_id -> (campaign_id, contact_id), populated when
    /// a voice-campaign dial is placed so the webhook router can later
    /// deliver that call's outcome back to the right contact row.
    call_index: DashMap<String, (String, String)>,
}

impl CampaignDispatcher {
    pub fn new(deps: CampaignDeps) -> Self {
        Self { deps, call_index: DashMap::new() }
    }

    /// Deliver a carrier-reported call outcome to the campaign contact that
    /// placed it (§4.7 "SMS fallback on no-answer"). No-op if the call
    /// wasn't dialed by this dispatcher (e.g. an inbound call).
    pub async fn handle_call_outcome(&self, call_control_id: &str, outcome: VoiceCallOutcome) {
        let Some((_, (campaign_id, contact_id))) = self.call_index.remove(call_control_id) else {
            return;
        };
        let Some(campaign) = self.deps.store.get_campaign(&campaign_id).await else {
            warn!(campaign_id = %campaign_id, "campaign missing for tracked call outcome");
            return;
        };
        let Some(mut contact) = self.deps.store.get_campaign_contact(&campaign_id, &contact_id).await else {
            warn!(campaign_id = %campaign_id, contact_id = %contact_id, "campaign contact missing for tracked call outcome");
            return;
        };
        self.apply_voice_outcome(&campaign, &mut contact, outcome).await;
        self.deps.store.update_contact(contact).await;
    }

    /// Run the poll loop forever (§4.7: default every second), matching
    /// `TaskScheduler::start`'s shape.
    pub async fn run(self: Arc<Self>) {
        info!("campaign dispatcher started");
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "campaign dispatcher tick failed");
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// One pass over every running campaign. Exposed separately from
    /// `run` so tests can drive a deterministic `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        for campaign in self.deps.store.list_running().await {
            if let Err(e) = self.process_campaign(&campaign, now).await {
                warn!(campaign_id = %campaign.campaign_id, error = %e, "campaign processing failed, will retry next tick");
            }
        }
        Ok(())
    }

    async fn process_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<()> {
        if !sending_window_open(campaign.sending_hours.as_ref(), now) {
            return Ok(());
        }

        let pending = self.deps.store.fetch_pending(&campaign.campaign_id, PENDING_BATCH_SIZE).await;
        for mut contact in pending {
            if !self.deps.rate_limiters.try_acquire(&campaign.campaign_id, campaign.messages_per_minute) {
                break;
            }
            self.process_pending_contact(campaign, &mut contact).await;
            self.deps.store.update_contact(contact).await;
        }

        let follow_ups = self.deps.store.fetch_follow_up_due(&campaign.campaign_id, now).await;
        for mut contact in follow_ups {
            if !self.deps.rate_limiters.try_acquire(&campaign.campaign_id, campaign.messages_per_minute) {
                break;
            }
            self.process_follow_up(campaign, &mut contact, now).await;
            self.deps.store.update_contact(contact).await;
        }

        if !self.deps.store.has_outstanding_work(&campaign.campaign_id).await {
            self.deps.store.mark_completed(&campaign.campaign_id).await;
            info!(campaign_id = %campaign.campaign_id, "campaign completed");
        }
        Ok(())
    }

    async fn process_pending_contact(&self, campaign: &Campaign, contact: &mut CampaignContact) {
        let Some(profile) = self.deps.store.get_contact(&contact.contact_id).await else {
            contact.status = CampaignContactStatus::Failed;
            contact.last_error = Some("contact profile not found".into());
            return;
        };
        if profile.opted_out || self.deps.opt_outs.is_opted_out(&campaign.workspace, &profile.phone).await {
            contact.status = CampaignContactStatus::OptedOut;
            return;
        }
        let Some(from) = self.deps.numbers.acquire().await else {
            // no number available this tick; leave pending, try again next tick
            return;
        };

        match campaign.campaign_type {
            CampaignType::Sms => self.send_initial_sms(campaign, contact, &profile, &from).await,
            CampaignType::VoiceSmsFallback => self.dial_voice(campaign, contact, &profile, &from).await,
        }
    }

    async fn send_initial_sms(&self, campaign: &Campaign, contact: &mut CampaignContact, profile: &Contact, from: &str) {
        let Some(template) = &campaign.initial_message_template else {
            contact.status = CampaignContactStatus::Failed;
            contact.last_error = Some("campaign has no initial_message_template".into());
            return;
        };
        let ctx = TemplateContext::from_contact(profile, campaign.offer.as_ref());
        let body = render_template(template, &ctx);
        match self.deps.sms.send(from, &profile.phone, &body).await {
            Ok(()) => {
                contact.status = CampaignContactStatus::Sent;
                contact.messages_sent += 1;
                if campaign.max_follow_ups > 0 {
                    contact.next_follow_up_at = Some(Utc::now() + ChronoDuration::hours(campaign.follow_up_delay_hours as i64));
                }
            }
            Err(e) => {
                contact.status = CampaignContactStatus::Failed;
                contact.last_error = Some(e.to_string());
            }
        }
    }

    async fn dial_voice(&self, campaign: &Campaign, contact: &mut CampaignContact, profile: &Contact, from: &str) {
        match self.deps.carrier.outbound_dial(&profile.phone, from).await {
            Ok(call_control_id) => {
                self.call_index.insert(call_control_id, (campaign.campaign_id.clone(), contact.contact_id.clone()));
                contact.status = CampaignContactStatus::Calling;
                contact.call_attempts += 1;
            }
            Err(e) => {
                contact.status = CampaignContactStatus::Failed;
                contact.last_error = Some(e.to_string());
            }
        }
    }

    /// Apply a voice call outcome to its campaign contact, firing the SMS
    /// fallback path when configured (§4.7 "Voice campaigns differ").
    pub async fn apply_voice_outcome(&self, campaign: &Campaign, contact: &mut CampaignContact, outcome: VoiceCallOutcome) {
        match outcome {
            VoiceCallOutcome::Answered => contact.status = CampaignContactStatus::CallAnswered,
            VoiceCallOutcome::NoAnswer | VoiceCallOutcome::Busy | VoiceCallOutcome::Voicemail => {
                contact.status = CampaignContactStatus::CallFailed;
                if campaign.sms_fallback_on_no_answer {
                    if let (Some(profile), Some(from)) = (self.deps.store.get_contact(&contact.contact_id).await, self.deps.numbers.acquire().await) {
                        self.send_initial_sms(campaign, contact, &profile, &from).await;
                        if contact.status == CampaignContactStatus::Sent {
                            contact.status = CampaignContactStatus::SmsFallbackSent;
                        }
                    }
                }
            }
        }
    }

    async fn process_follow_up(&self, campaign: &Campaign, contact: &mut CampaignContact, now: DateTime<Utc>) {
        if contact.follow_ups_sent >= campaign.max_follow_ups {
            contact.next_follow_up_at = None;
            return;
        }
        let Some(template) = &campaign.initial_message_template else {
            contact.next_follow_up_at = None;
            return;
        };
        let Some(profile) = self.deps.store.get_contact(&contact.contact_id).await else {
            contact.next_follow_up_at = None;
            return;
        };
        let Some(from) = self.deps.numbers.acquire().await else { return };
        let ctx = TemplateContext::from_contact(&profile, campaign.offer.as_ref());
        let body = render_template(template, &ctx);
        match self.deps.sms.send(&from, &profile.phone, &body).await {
            Ok(()) => {
                contact.follow_ups_sent += 1;
                if contact.follow_ups_sent < campaign.max_follow_ups {
                    contact.next_follow_up_at = Some(now + ChronoDuration::hours(campaign.follow_up_delay_hours as i64));
                } else {
                    contact.next_follow_up_at = None;
                }
            }
            Err(e) => {
                contact.last_error = Some(e.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCallOutcome {
    Answered,
    NoAnswer,
    Busy,
    Voicemail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn offer() -> Offer {
        Offer {
            offer_name: "Spring Sale".into(),
            offer_discount: "20% off".into(),
            offer_description: "Save big".into(),
            offer_terms: "Ends soon".into(),
        }
    }

    fn contact() -> Contact {
        Contact {
            contact_id: "c1".into(),
            workspace: "w1".into(),
            phone: "+15551234567".into(),
            name: "Alice Smith".into(),
            email: Some("alice@example.com".into()),
            opted_out: false,
            first_contacted_at: None,
        }
    }

    #[test]
    fn render_template_substitutes_known_placeholders_case_insensitively() {
        let ctx = TemplateContext::from_contact(&contact(), Some(&offer()));
        let rendered = render_template("Hi {FIRST_NAME}, check out {offer_name}: {Offer_Discount}", &ctx);
        assert_eq!(rendered, "Hi Alice, check out Spring Sale: 20% off");
    }

    #[test]
    fn render_template_leaves_unknown_placeholders_untouched() {
        let ctx = TemplateContext::from_contact(&contact(), None);
        let rendered = render_template("Hi {first_name}, your {unknown_field} is ready", &ctx);
        assert_eq!(rendered, "Hi Alice, your {unknown_field} is ready");
    }

    #[test]
    fn render_template_with_all_known_placeholders_leaves_none_behind() {
        let ctx = TemplateContext::from_contact(&contact(), Some(&offer()));
        let rendered = render_template("{first_name} {last_name} {full_name} {email} {offer_name} {offer_discount} {offer_description} {offer_terms}", &ctx);
        assert!(!rendered.contains('{'));
    }

    #[test]
    fn sending_window_none_is_always_open() {
        assert!(sending_window_open(None, Utc::now()));
    }

    #[test]
    fn sending_window_respects_day_of_week() {
        let hours = SendingHours {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            tz: "America/New_York".into(),
            days: vec![1, 2, 3, 4, 5], // Mon-Fri
        };
        // 2024-01-07 is a Sunday
        let sunday_noon = DateTime::parse_from_rfc3339("2024-01-07T17:00:00Z").unwrap().with_timezone(&Utc);
        assert!(!sending_window_open(Some(&hours), sunday_noon));
        // 2024-01-08 is a Monday
        let monday_noon = DateTime::parse_from_rfc3339("2024-01-08T17:00:00Z").unwrap().with_timezone(&Utc);
        assert!(sending_window_open(Some(&hours), monday_noon));
    }

    #[tokio::test]
    async fn opt_out_set_marks_and_checks() {
        let set = InMemoryOptOutSet::new();
        assert!(!set.is_opted_out("w1", "+15551234567").await);
        set.mark("w1", "+15551234567").await;
        assert!(set.is_opted_out("w1", "+15551234567").await);
    }

    #[tokio::test]
    async fn number_pool_respects_daily_cap() {
        let pool = NumberPool::new(vec!["+15550000001".into()], 2, 0);
        assert!(pool.acquire().await.is_some());
        assert!(pool.acquire().await.is_some());
        assert!(pool.acquire().await.is_none());
    }

    #[test]
    fn rate_limiter_blocks_after_quota_exhausted() {
        let limiters = CampaignRateLimiters::new();
        for _ in 0..10 {
            assert!(limiters.try_acquire("camp-1", 10));
        }
        assert!(!limiters.try_acquire("camp-1", 10));
    }

    #[tokio::test]
    async fn dispatcher_sends_pending_contact_and_schedules_follow_up() {
        let store = InMemoryCampaignStore::new();
        let campaign = Campaign {
            campaign_id: "camp-1".into(),
            workspace: "w1".into(),
            campaign_type: CampaignType::Sms,
            status: CampaignStatus::Running,
            from_numbers: vec!["+15550000001".into()],
            initial_message_template: Some("Hi {first_name}!".into()),
            agent_id: None,
            sending_hours: None,
            messages_per_minute: 10,
            max_follow_ups: 1,
            follow_up_delay_hours: 24,
            offer: None,
            sms_fallback_on_no_answer: false,
        };
        store.seed_campaign(campaign.clone());
        store.seed_contact_profile(contact());
        store.seed_campaign_contact(CampaignContact {
            campaign_id: "camp-1".into(),
            contact_id: "c1".into(),
            status: CampaignContactStatus::Pending,
            messages_sent: 0,
            follow_ups_sent: 0,
            next_follow_up_at: None,
            call_attempts: 0,
            last_error: None,
            priority: 0,
            created_at: Utc::now(),
        });

        let deps = CampaignDeps {
            store: store.clone(),
            opt_outs: InMemoryOptOutSet::new(),
            numbers: Arc::new(NumberPool::new(vec!["+15550000001".into()], 100, 0)),
            rate_limiters: CampaignRateLimiters::new(),
            sms: Arc::new(SmsClient::new(
                Client::builder().build().unwrap(),
                SmsConfig { base_url: "http://127.0.0.1:1".into(), api_key: "k".into(), webhook_url: "http://example.com/hook".into() },
            )),
            carrier: Arc::new(CallControlClient::new(
                Client::builder().build().unwrap(),
                crate::carrier::CarrierConfig {
                    base_url: "http://127.0.0.1:1".into(),
                    api_key: "k".into(),
                    webhook_signing_secret: None,
                    connection_id: Some("conn-1".into()),
                    stream_websocket_url: "wss://example.com".into(),
                },
            )),
        };
        let dispatcher = CampaignDispatcher::new(deps);
        // the unreachable SMS endpoint makes the send fail, but this
        // exercises the full pending-contact path deterministically
        // without a real network collaborator.
        dispatcher.tick(Utc::now()).await.unwrap();
        let updated = store.fetch_pending("camp-1", 10).await;
        assert!(updated.is_empty(), "contact should have left pending status");
    }
}
