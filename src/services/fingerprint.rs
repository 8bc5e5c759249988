use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::GeoError;

/// Channel key used when a request cannot be located.
pub const FALLBACK_CHANNEL: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Coarse, city-level location of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub country: String,
    pub region: String,
    pub city: String,
}

/// Channel key derived from a [`Location`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over `country|region|city`, each part trimmed, lower-cased
    /// and with inner whitespace collapsed.
    pub fn from_location(location: &Location) -> Self {
        let data = [&location.country, &location.region, &location.city]
            .iter()
            .map(|part| normalize(part))
            .collect::<Vec<_>>()
            .join("|");

        Fingerprint(hex::encode(Sha256::digest(data.as_bytes())))
    }

    pub fn fallback() -> Self {
        Fingerprint(FALLBACK_CHANNEL.to_string())
    }

    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_CHANNEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(part: &str) -> String {
    part.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Looks an IP address up in some geolocation source.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Result<Location, GeoError>;
}

/// Response shape of freeipapi.com. Only the fields we hash are kept.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FreeIpApiResponse {
    #[serde(default)]
    country_name: String,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    city_name: String,
}

/// [`GeoResolver`] backed by the freeipapi.com JSON API.
#[derive(Debug, Clone)]
pub struct FreeIpApiResolver {
    client: Client,
    base_url: String,
}

impl FreeIpApiResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoResolver for FreeIpApiResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let url = format!("{}/{}", self.base_url, ip);
        let res = self.client.get(&url).send().await?;

        if !res.status().is_success() {
            return Err(GeoError::Status(res.status()));
        }

        let body: FreeIpApiResponse = res
            .json()
            .await
            .map_err(|e| GeoError::Decode(e.to_string()))?;

        let location = Location {
            country: body.country_name,
            region: body.region_name,
            city: body.city_name,
        };

        if [&location.country, &location.region, &location.city]
            .iter()
            .all(|part| part.trim().is_empty() || part.trim() == "-")
        {
            return Err(GeoError::Incomplete);
        }

        Ok(location)
    }
}

/// Picks the address to locate. The peer address wins unless it is
/// missing or one of our trusted proxies, in which case the first valid
/// `X-Forwarded-For` entry is used.
pub fn client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let behind_proxy = match peer {
        None => true,
        Some(ip) => trusted_proxies.contains(&ip),
    };

    if !behind_proxy {
        return peer;
    }

    forwarded_for(headers).or(peer)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get_all(FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|entry| entry.trim().parse().ok())
}

/// Turns a client address into a channel key. Never fails: anything that
/// goes wrong lands the request on [`FALLBACK_CHANNEL`].
#[derive(Clone)]
pub struct LocationFingerprinter {
    resolver: Arc<dyn GeoResolver>,
}

impl LocationFingerprinter {
    pub fn new(resolver: Arc<dyn GeoResolver>) -> Self {
        Self { resolver }
    }

    pub async fn fingerprint(&self, ip: Option<IpAddr>) -> Fingerprint {
        let Some(ip) = ip else {
            warn!("no client address available, using fallback channel");
            return Fingerprint::fallback();
        };

        match self.resolver.resolve(ip).await {
            Ok(location) => {
                let fingerprint = Fingerprint::from_location(&location);
                debug!(%ip, channel = %fingerprint, "client located");
                fingerprint
            }
            Err(e) => {
                warn!(%ip, "geolocation lookup failed, using fallback channel: {e}");
                Fingerprint::fallback()
            }
        }
    }
}
