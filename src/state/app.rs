use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::extract::AuthGate;
use crate::services::broker::RendezvousBroker;
use crate::services::fingerprint::LocationFingerprinter;

/// Shared state handed to every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<RendezvousBroker>,
    pub fingerprinter: LocationFingerprinter,
    pub auth: Arc<AuthGate>,
    pub config: Arc<AppConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        broker: Arc<RendezvousBroker>,
        fingerprinter: LocationFingerprinter,
    ) -> Self {
        let auth = AuthGate::new(
            config.publisher_token.clone(),
            config.subscriber_token.clone(),
        );

        Self {
            broker,
            fingerprinter,
            auth: Arc::new(auth),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    pub fn publisher_timeout(&self) -> Duration {
        self.config.publisher_timeout()
    }

    pub fn subscriber_timeout(&self) -> Duration {
        self.config.subscriber_timeout()
    }
}
