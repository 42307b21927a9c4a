pub mod appresult;
pub mod cleanup;
pub mod config;
pub mod events;
pub mod hub;
pub mod lifecycle;
pub mod liveness;
pub mod messages;
pub mod models;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{FromRef, State},
    http::{HeaderValue, Method, header},
    routing::get,
};
use serde_json::{Value, json};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

pub use appresult::{AppError, AppResult};
use config::{Config, SocketConfig};
use events::HubBus;
use hub::Hub;
use lifecycle::RoomLifecycle;
use liveness::{Clock, LivenessTracker};
use messages::MessageLog;
use store::SessionStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub lifecycle: Arc<RoomLifecycle>,
    pub hub: Arc<Hub>,
    pub bus: Arc<HubBus>,
    pub socket: SocketConfig,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        let messages = Arc::new(MessageLog::new(clock.clone(), config.message_log_capacity));
        let hub = Arc::new(Hub::new(config.outbound_queue_capacity).with_backfill(messages.clone()));
        let bus = Arc::new(HubBus::new(hub.clone(), config.outbound_queue_capacity));
        let liveness = LivenessTracker::new(store.clone(), clock, config.inactivity_timeout);
        let lifecycle = Arc::new(RoomLifecycle::new(
            store,
            liveness,
            bus.clone(),
            messages,
            hub.clone(),
        ));

        Self {
            lifecycle,
            hub,
            bus,
            socket: config.socket(),
        }
    }
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/rooms", rooms::router())
        .nest("/ws", rooms::ws_router())
        .layer(cors(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[debug_handler(state = AppState)]
async fn health(State(hub): State<Arc<Hub>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": hub.total_connections().await,
    }))
}
