//! CDN purge integration
//!
//! Edge-tier invalidations fan out to the configured CDN provider for exact
//! and prefix scopes. The provider API itself stays behind this trait; the
//! webhook implementation covers providers with an HTTP purge endpoint.

use async_trait::async_trait;
use serde_json::json;
use tracing::error;

/// Purge hook called after edge-tier invalidations
#[async_trait]
pub trait CdnPurger: Send + Sync {
    /// Purge the given URL paths from the CDN; failures are logged, never
    /// propagated into the invalidation path
    async fn purge(&self, paths: &[String]);

    /// Pre-warm the CDN with the given URLs
    async fn warm(&self, urls: &[String]);
}

/// POSTs `{"files": [...]}` to a provider purge webhook
pub struct WebhookPurger {
    client: reqwest::Client,
    purge_url: String,
}

impl WebhookPurger {
    pub fn new(purge_url: String) -> Self {
        Self { client: reqwest::Client::new(), purge_url }
    }
}

#[async_trait]
impl CdnPurger for WebhookPurger {
    async fn purge(&self, paths: &[String]) {
        let body = json!({ "files": paths });
        if let Err(e) = self.client.post(&self.purge_url).json(&body).send().await {
            error!("cdn purge failed: {e}");
        }
    }

    async fn warm(&self, urls: &[String]) {
        for url in urls {
            if let Err(e) =
                self.client.get(url).header("x-cache-warmup", "1").send().await
            {
                error!(url = %url, "cdn warm-up fetch failed: {e}");
            }
        }
    }
}
