use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a geolocation lookup produced no usable location.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("geolocation service answered {0}")]
    Status(reqwest::StatusCode),

    #[error("geolocation response could not be decoded: {0}")]
    Decode(String),

    #[error("geolocation response has no country, region or city")]
    Incomplete,
}

/// Client-facing failures. Timeouts are not here: an expired wait is an
/// empty 204, not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid OTP payload")]
    Validation,

    #[error("{0}")]
    Auth(&'static str),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Validation => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            RelayError::Auth(reason) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": reason }))).into_response()
            }
        }
    }
}
