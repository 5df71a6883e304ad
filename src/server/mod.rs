//! Web server: carrier media WebSocket and call-status webhook (§6).

pub mod webhook;

use crate::bridge::{self, BridgeConfig, BridgeState};
use crate::campaign::{CampaignDeps, CampaignDispatcher, CampaignRateLimiters, InMemoryCampaignStore, InMemoryOptOutSet, NumberPool, SmsClient, SmsConfig};
use crate::carrier::{CallControlClient, CarrierConfig};
use crate::config::Config;
use crate::executor::{self, CalendarClient, CalendarConfig, CarrierDtmfClient};
use crate::registry::SessionRegistry;
use crate::session::SessionCommand;
use crate::store::Stores;
use anyhow::{Context, Result};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Per-number daily send cap absent a CRUD-plane-configured value; the
/// number pool's warm-up ramp still applies on top of this.
const DEFAULT_NUMBER_DAILY_CAP: u32 = 500;

#[derive(Clone)]
pub struct ServerState {
    pub bridge: BridgeState,
    pub carrier: Arc<CallControlClient>,
    pub campaign: Option<Arc<CampaignDispatcher>>,
}

/// Build the application router. Split from `start` so integration tests
/// can drive it without binding a real port.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/voice/stream/:call_id", get(media_ws_handler))
        .route("/webhooks/carrier", post(webhook::carrier_webhook))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn media_ws_handler(ws: WebSocketUpgrade, path: Path<String>, State(state): State<ServerState>) -> Response {
    bridge::ws_handler(ws, path, State(state.bridge)).await
}

pub async fn start(host: &str, port: u16) -> Result<()> {
    let config = Config::load()?;
    let http_client = Client::new();

    let carrier_config = CarrierConfig {
        base_url: config.carrier.base_url.clone(),
        api_key: config.carrier_api_key().unwrap_or_default(),
        webhook_signing_secret: config.carrier_webhook_signing_secret(),
        connection_id: config.carrier.connection_id.clone(),
        stream_websocket_url: config
            .carrier
            .webhook_base_url
            .clone()
            .map(|base| format!("{base}/voice/stream"))
            .unwrap_or_else(|| "wss://localhost/voice/stream".to_string()),
    };
    let carrier = Arc::new(CallControlClient::new(http_client.clone(), carrier_config));

    let carrier_dtmf_config = executor::CarrierConfig {
        base_url: config.carrier.base_url.clone(),
        api_key: config.carrier_api_key().unwrap_or_default(),
    };
    let carrier_dtmf = Arc::new(CarrierDtmfClient::new(http_client.clone(), carrier_dtmf_config.clone()));

    // One shared store instance: the tool executor's booking-outcome
    // writes and the session's end-of-call bandit reporting must see the
    // same state, not independent process-local copies.
    let stores = Stores::in_memory();

    let executor = Arc::new(crate::executor::ToolExecutor::new(
        CalendarClient::new(
            http_client.clone(),
            CalendarConfig {
                base_url: config.calendar.base_url.clone(),
                api_key: config.calendar_api_key().unwrap_or_default(),
                default_event_type_id: config.calendar.default_event_type_id,
            },
        ),
        CarrierDtmfClient::new(http_client.clone(), carrier_dtmf_config),
        stores.sessions.clone(),
        Duration::from_secs(config.timeouts.tool_exec_secs),
    ));

    let bridge_state = BridgeState {
        config: BridgeConfig {
            provider_url: config.providers.realtime_url.clone(),
            provider_api_key: config.realtime_provider_api_key().unwrap_or_default(),
            tts_provider_url: config.providers.tts_url.clone(),
            tts_provider_api_key: config.tts_provider_api_key().unwrap_or_default(),
            carrier_base_url: config.carrier.base_url.clone(),
            carrier_api_key: config.carrier_api_key().unwrap_or_default(),
            provider_connect_timeout: Duration::from_secs(config.timeouts.provider_connect_secs),
            graceful_shutdown_timeout: Duration::from_secs(config.timeouts.graceful_shutdown_secs),
            default_calendar_event_type_id: config.calendar.default_event_type_id,
        },
        registry: SessionRegistry::<SessionCommand>::new(),
        stores,
        executor,
        carrier_dtmf,
    };

    let campaign_deps = CampaignDeps {
        store: InMemoryCampaignStore::new(),
        opt_outs: InMemoryOptOutSet::new(),
        numbers: Arc::new(NumberPool::new(config.sms.default_sender_pool.clone(), DEFAULT_NUMBER_DAILY_CAP, config.campaign.warm_up_days)),
        rate_limiters: CampaignRateLimiters::new(),
        sms: Arc::new(SmsClient::new(
            http_client.clone(),
            SmsConfig {
                base_url: config.sms.base_url.clone(),
                api_key: config.sms_api_key().unwrap_or_default(),
                webhook_url: config.carrier.webhook_base_url.clone().map(|base| format!("{base}/webhooks/sms")).unwrap_or_default(),
            },
        )),
        carrier: carrier.clone(),
    };
    let dispatcher = Arc::new(CampaignDispatcher::new(campaign_deps));
    tokio::spawn(dispatcher.clone().run());

    let state = ServerState {
        bridge: bridge_state,
        carrier,
        campaign: Some(dispatcher),
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse().context("invalid bind address")?;
    info!(%addr, "server listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
