//! HTTP routes
//!
//! Layers, outermost first: client tracking (which also pins the settings
//! snapshot), CORS, response sealing, then bearer authentication on every
//! route except `/`.

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};

use crate::state::AppState;

mod handlers;
mod middleware;

/// Header naming the handshake session whose key seals the bodies
pub const SESSION_HEADER: &str = "x-remo-session";

/// Build the bridge router over `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/handshake", post(handlers::handshake))
        .route("/listSlots", get(handlers::list_slots))
        .route("/openChannel", post(handlers::open_channel))
        .route("/sendApdu", post(handlers::send_apdu))
        .route("/sendRawApdu", post(handlers::send_raw_apdu))
        .route("/closeChannel", post(handlers::close_channel))
        .route("/listChannels", get(handlers::list_channels))
        .route("/updateSettings", post(handlers::update_settings))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth))
        .route("/", get(handlers::version))
        .layer(from_fn_with_state(state.clone(), middleware::seal))
        .layer(from_fn(middleware::cors))
        .layer(from_fn_with_state(state.clone(), middleware::track))
        .with_state(state)
}
