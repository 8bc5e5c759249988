//! Request extractors standing in front of the OTP handlers: the bearer
//! token gate and the location fingerprinting stage.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use subtle::ConstantTimeEq;

use crate::errors::RelayError;
use crate::services::fingerprint::{client_ip, Fingerprint};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The phone pushing codes.
    Publisher,
    /// The browser extension pulling codes.
    Subscriber,
}

/// Static per-role bearer tokens.
pub struct AuthGate {
    publisher_token: String,
    subscriber_token: String,
}

impl AuthGate {
    pub fn new(publisher_token: String, subscriber_token: String) -> Self {
        Self {
            publisher_token,
            subscriber_token,
        }
    }

    pub fn verify(&self, role: Role, headers: &HeaderMap) -> Result<(), RelayError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(RelayError::Auth("Missing or malformed Authorization header"))?;

        let expected = match role {
            Role::Publisher => &self.publisher_token,
            Role::Subscriber => &self.subscriber_token,
        };

        if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(RelayError::Auth("Invalid Authorization token"))
        }
    }
}

/// Proof that the request carries the publisher token.
#[derive(Debug)]
pub struct PublisherAuth;

/// Proof that the request carries the subscriber token.
#[derive(Debug)]
pub struct SubscriberAuth;

#[async_trait]
impl FromRequestParts<AppState> for PublisherAuth {
    type Rejection = RelayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state.auth.verify(Role::Publisher, &parts.headers)?;
        Ok(PublisherAuth)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for SubscriberAuth {
    type Rejection = RelayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state.auth.verify(Role::Subscriber, &parts.headers)?;
        Ok(SubscriberAuth)
    }
}

/// The channel a request belongs to. Computed once per request and kept
/// in the request extensions.
#[derive(Debug, Clone)]
pub struct ChannelKey(pub Fingerprint);

#[async_trait]
impl FromRequestParts<AppState> for ChannelKey {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(key) = parts.extensions.get::<ChannelKey>() {
            return Ok(key.clone());
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = client_ip(peer, &parts.headers, &state.config.trusted_proxies);

        let key = ChannelKey(state.fingerprinter.fingerprint(ip).await);
        parts.extensions.insert(key.clone());
        Ok(key)
    }
}
