//! Registry client: which brokers a publisher should stream to

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::model::{AssetFilter, BrokerConnectionConfig, BrokerUrl, RegistryErrorResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const UNAUTHORIZED_ERROR: &str = "Unauthorized";

/// Desired broker set for a publisher
#[async_trait]
pub trait BrokerRegistry: Send + Sync {
    async fn get_brokers_for_publisher(
        &self,
        publisher_key: &str,
    ) -> Result<HashMap<BrokerUrl, AssetFilter>, RegistryError>;
}

pub struct RegistryClient {
    client: Client,
    base_url: String,
    auth: String,
}

impl RegistryClient {
    pub fn new(base_url: &str, auth: impl Into<String>) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: auth.into(),
        })
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.base_url)
            .field("auth", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl BrokerRegistry for RegistryClient {
    async fn get_brokers_for_publisher(
        &self,
        publisher_key: &str,
    ) -> Result<HashMap<BrokerUrl, AssetFilter>, RegistryError> {
        let url = format!("{}/v1/registry/brokers", self.base_url);
        debug!(url = %url, publisher_key = %publisher_key, "Fetching brokers from registry");

        let response = self
            .client
            .get(&url)
            .query(&[("publisher_key", publisher_key)])
            .header(AUTHORIZATION, format!("Basic {}", self.auth))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        let configs = parse_brokers_response(&body).map_err(|e| match e {
            RegistryError::Decode(reason) => {
                RegistryError::Decode(format!("status {}: {}", status.as_u16(), reason))
            }
            other => other,
        })?;

        let brokers = merge_broker_configs(configs);
        if brokers.is_empty() {
            warn!(publisher_key = %publisher_key, "Registry returned no brokers for publisher");
        } else {
            info!(broker_count = brokers.len(), "Fetched brokers from registry");
        }
        Ok(brokers)
    }
}

/// A broker list on success, otherwise an `{"error": ...}` body
pub fn parse_brokers_response(body: &str) -> Result<Vec<BrokerConnectionConfig>, RegistryError> {
    if let Ok(configs) = serde_json::from_str::<Vec<BrokerConnectionConfig>>(body) {
        return Ok(configs);
    }
    match serde_json::from_str::<RegistryErrorResponse>(body) {
        Ok(resp) if resp.error == UNAUTHORIZED_ERROR => Err(RegistryError::Unauthorized),
        Ok(resp) => Err(RegistryError::Rejected(resp.error)),
        Err(e) => Err(RegistryError::Decode(e.to_string())),
    }
}

/// Collapse entries sharing a url into one asset set
pub fn merge_broker_configs(
    configs: Vec<BrokerConnectionConfig>,
) -> HashMap<BrokerUrl, AssetFilter> {
    let mut brokers: HashMap<BrokerUrl, AssetFilter> = HashMap::new();
    for config in configs {
        brokers
            .entry(config.publish_url)
            .or_default()
            .extend(config.asset_ids);
    }
    brokers
}
