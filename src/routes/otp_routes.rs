use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info};

use crate::errors::RelayError;
use crate::extract::{ChannelKey, PublisherAuth, SubscriberAuth};
use crate::services::broker::{Delivery, RendezvousBroker};
use crate::state::AppState;

lazy_static! {
    // ASCII digits only; `\d` would also accept other Unicode digits.
    static ref OTP_PATTERN: Regex = Regex::new(r"^[0-9]{4,8}$").expect("OTP pattern is valid");
}

#[derive(Debug, Deserialize)]
struct OtpPayload {
    otp: String,
}

/// Build the OTP routes: POST /otp (phone) and GET /otp (extension).
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/otp", post(publish_otp).get(subscribe_otp))
        .with_state(state)
}

/// Parse `{ "otp": "<4-8 digits>" }`. Anything else is a validation error.
pub fn parse_otp(body: &[u8]) -> Result<String, RelayError> {
    let payload: OtpPayload =
        serde_json::from_slice(body).map_err(|_| RelayError::Validation)?;

    if OTP_PATTERN.is_match(&payload.otp) {
        Ok(payload.otp)
    } else {
        Err(RelayError::Validation)
    }
}

//
// ─────────────────────────────────────────────────────────────
// POST /otp
// Give a waiting extension a chance to attach, then hand the code over.
// Always 200 once the payload is valid, even if nobody received it.
// The hand-over runs in its own task: a phone that hangs up early must
// not cancel a code we already accepted.
// ─────────────────────────────────────────────────────────────
//
async fn publish_otp(
    _auth: PublisherAuth,
    ChannelKey(channel): ChannelKey,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<&'static str, RelayError> {
    let otp = parse_otp(&body)?;

    let handover = tokio::spawn(hand_over(
        state.broker.clone(),
        channel.to_string(),
        otp,
        state.publisher_timeout(),
    ));

    if let Err(e) = handover.await {
        error!(%channel, "OTP hand-over task failed: {e}");
    }
    Ok("OTP received")
}

async fn hand_over(
    broker: Arc<RendezvousBroker>,
    channel: String,
    otp: String,
    wait: Duration,
) {
    let attachment = broker.wait_for_subscriber(&channel, wait).await;
    let delivered = broker.publish(&channel, &otp);

    info!(%channel, ?attachment, delivered, "OTP published");
}

//
// ─────────────────────────────────────────────────────────────
// GET /otp
// Wait for the next code on this location's channel.
// 200 with the code, or 204 when the window closes empty.
// ─────────────────────────────────────────────────────────────
//
async fn subscribe_otp(
    _auth: SubscriberAuth,
    ChannelKey(channel): ChannelKey,
    State(state): State<AppState>,
) -> Response {
    match state
        .broker
        .subscribe_once(channel.as_str(), state.subscriber_timeout())
        .await
    {
        Delivery::Delivered(code) => {
            info!(%channel, "OTP handed to subscriber");
            (StatusCode::OK, code).into_response()
        }
        Delivery::Expired => {
            info!(%channel, "no OTP within window");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}
