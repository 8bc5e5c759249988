use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::routes::{otp_routes, system_routes};
use crate::state::AppState;

/// Build the complete Axum application:
/// - /otp      (POST from the phone, GET from the extension)
/// - /system   (alive + version + stats)
///
/// CORS is permissive: the extension calls us from its own origin.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        // /otp
        .merge(otp_routes::routes(state.clone()))

        // /system/*
        .nest("/system", system_routes::routes(state))

        .layer(CorsLayer::permissive())

        // Logging middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
