//! Periodic publisher metadata report to the registry's REST API

use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use publisher_signer::{PublisherKey, SignatureType};

use crate::error::RegistryError;
use crate::model::AuthToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const PUBLIC_IP_URL: &str = "https://api.ipify.org";
pub const AWS_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data";

/// Host lookups are best effort and must not hold up a report
const HOST_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AwsMetadata {
    pub is_aws: bool,
    pub instance_type: String,
    pub availability_zone_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherMetadata {
    pub publisher_key: PublisherKey,
    pub signature_type: SignatureType,
    pub publisher_agent_version: String,
    pub architecture: String,
    pub public_ip: String,
    pub aws_metadata: AwsMetadata,
}

impl PublisherMetadata {
    /// Static fields for this build; host fields are filled in per report
    pub fn current(publisher_key: impl Into<PublisherKey>, signature_type: SignatureType) -> Self {
        Self {
            publisher_key: publisher_key.into(),
            signature_type,
            publisher_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            public_ip: String::new(),
            aws_metadata: AwsMetadata::default(),
        }
    }
}

/// Public IP and cloud instance lookups. Every failure falls back to an
/// empty value.
#[derive(Debug, Clone)]
pub struct HostLookup {
    client: Client,
    public_ip_url: String,
    aws_metadata_url: String,
}

impl HostLookup {
    pub fn new(public_ip_url: &str, aws_metadata_url: &str) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(HOST_LOOKUP_TIMEOUT).build()?;
        Ok(Self {
            client,
            public_ip_url: public_ip_url.to_string(),
            aws_metadata_url: aws_metadata_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn public_ip(&self) -> String {
        self.get_text(&self.public_ip_url).await.unwrap_or_default()
    }

    /// Not on AWS when the metadata root is unreachable
    pub async fn aws_metadata(&self) -> AwsMetadata {
        if self.get_text(&self.aws_metadata_url).await.is_none() {
            return AwsMetadata::default();
        }
        let zone_url = format!("{}/placement/availability-zone-id", self.aws_metadata_url);
        let instance_url = format!("{}/instance-type", self.aws_metadata_url);
        let (zone, instance_type) =
            tokio::join!(self.get_text(&zone_url), self.get_text(&instance_url));
        AwsMetadata {
            is_aws: true,
            instance_type: instance_type.unwrap_or_default(),
            availability_zone_id: zone.unwrap_or_default(),
        }
    }

    async fn get_text(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Host lookup failed");
                return None;
            }
        };
        match response.error_for_status() {
            Ok(response) => response.text().await.ok().map(|body| body.trim().to_string()),
            Err(e) => {
                debug!(url = %url, error = %e, "Host lookup rejected");
                None
            }
        }
    }
}

pub struct PublisherMetadataReporter {
    client: Client,
    endpoint: String,
    auth: AuthToken,
    metadata: PublisherMetadata,
    host: HostLookup,
    period: Duration,
}

impl PublisherMetadataReporter {
    pub fn new(
        base_url: &str,
        auth: impl Into<AuthToken>,
        metadata: PublisherMetadata,
        period: Duration,
    ) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/publisher/metadata", base_url.trim_end_matches('/')),
            auth: auth.into(),
            metadata,
            host: HostLookup::new(PUBLIC_IP_URL, AWS_METADATA_URL)?,
            period,
        })
    }

    pub fn with_host_lookup(mut self, host: HostLookup) -> Self {
        self.host = host;
        self
    }

    /// Static fields plus a fresh host lookup
    pub async fn collect(&self) -> PublisherMetadata {
        let (public_ip, aws_metadata) = tokio::join!(self.host.public_ip(), self.host.aws_metadata());
        PublisherMetadata {
            public_ip,
            aws_metadata,
            ..self.metadata.clone()
        }
    }

    pub async fn report(&self) -> Result<(), RegistryError> {
        let metadata = self.collect().await;
        self.client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Basic {}", self.auth))
            .json(&metadata)
            .send()
            .await?
            .error_for_status()?;
        info!(
            publisher_key = %metadata.publisher_key,
            signature_type = %metadata.signature_type,
            version = %metadata.publisher_agent_version,
            public_ip = %metadata.public_ip,
            is_aws = metadata.aws_metadata.is_aws,
            "Reported publisher metadata"
        );
        Ok(())
    }

    /// Report now and then every period. Failures are only logged.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        warn!(error = %e, "Failed to report publisher metadata");
                    }
                }
            }
        }
        debug!("Metadata reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // nothing listens on port 1
    fn offline_lookup() -> HostLookup {
        HostLookup::new("http://127.0.0.1:1/ip", "http://127.0.0.1:1/latest/meta-data").unwrap()
    }

    async fn mount_text(server: &MockServer, at: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_current_metadata() {
        let metadata = PublisherMetadata::current("0xabc", SignatureType::Evm);
        assert_eq!(metadata.publisher_agent_version, env!("CARGO_PKG_VERSION"));
        assert!(!metadata.architecture.is_empty());

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["signature_type"], "evm");
        assert_eq!(json["publisher_key"], "0xabc");
        assert_eq!(json["public_ip"], "");
        assert_eq!(json["aws_metadata"]["is_aws"], false);
    }

    #[tokio::test]
    async fn test_report_posts_full_metadata() {
        let server = MockServer::start().await;
        mount_text(&server, "/ip", "203.0.113.7").await;
        mount_text(&server, "/latest/meta-data", "ami-id\ninstance-type\n").await;
        mount_text(&server, "/latest/meta-data/placement/availability-zone-id", "use1-az4").await;
        mount_text(&server, "/latest/meta-data/instance-type", "c6i.large").await;

        Mock::given(method("POST"))
            .and(path("/v1/publisher/metadata"))
            .and(header("Authorization", "Basic secret"))
            .and(body_json(serde_json::json!({
                "publisher_key": "0xabc",
                "signature_type": "stark",
                "publisher_agent_version": "1.2.3",
                "architecture": "x86_64",
                "public_ip": "203.0.113.7",
                "aws_metadata": {
                    "is_aws": true,
                    "instance_type": "c6i.large",
                    "availability_zone_id": "use1-az4"
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = PublisherMetadata {
            publisher_key: "0xabc".into(),
            signature_type: SignatureType::Stark,
            publisher_agent_version: "1.2.3".into(),
            architecture: "x86_64".into(),
            public_ip: String::new(),
            aws_metadata: AwsMetadata::default(),
        };
        let host = HostLookup::new(
            &format!("{}/ip", server.uri()),
            &format!("{}/latest/meta-data", server.uri()),
        )
        .unwrap();
        let reporter =
            PublisherMetadataReporter::new(&server.uri(), "secret", metadata, Duration::from_secs(3600))
                .unwrap()
                .with_host_lookup(host);
        reporter.report().await.unwrap();
    }

    #[tokio::test]
    async fn test_host_lookup_falls_back_when_unreachable() {
        let host = offline_lookup();
        assert_eq!(host.public_ip().await, "");
        assert_eq!(host.aws_metadata().await, AwsMetadata::default());
    }

    #[tokio::test]
    async fn test_not_aws_when_metadata_root_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_text(&server, "/latest/meta-data/instance-type", "c6i.large").await;

        let host = HostLookup::new(
            &format!("{}/ip", server.uri()),
            &format!("{}/latest/meta-data/", server.uri()),
        )
        .unwrap();
        assert_eq!(host.aws_metadata().await, AwsMetadata::default());
        // unmatched path answers 404
        assert_eq!(host.public_ip().await, "");
    }

    #[tokio::test]
    async fn test_report_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reporter = PublisherMetadataReporter::new(
            &server.uri(),
            "secret",
            PublisherMetadata::current("0xabc", SignatureType::Evm),
            Duration::from_secs(3600),
        )
        .unwrap()
        .with_host_lookup(offline_lookup());
        assert!(reporter.report().await.is_err());
    }

    #[tokio::test]
    async fn test_run_reports_immediately_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = PublisherMetadataReporter::new(
            &server.uri(),
            "secret",
            PublisherMetadata::current("0xabc", SignatureType::Evm),
            Duration::from_secs(3600),
        )
        .unwrap()
        .with_host_lookup(offline_lookup());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { reporter.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
