//! Detection of the machine's hosting environment.
//!
//! The installer runs on GCP VMs, AWS instances, and plain bare metal. Cloud
//! metadata servers are queried with short timeouts; when neither answers the
//! host is treated as bare metal and its primary address comes from the
//! local routing table.

use std::fmt;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

const GCP_METADATA_URL: &str = "http://metadata.google.internal";
const AWS_METADATA_URL: &str = "http://169.254.169.254";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the installer is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Gcp,
    Aws,
    BareMetal,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gcp => "gcp",
            Self::Aws => "aws",
            Self::BareMetal => "bare-metal",
        })
    }
}

/// Detected environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    /// Hosting platform.
    pub platform: Platform,
    /// Primary internal address of the node, if known.
    pub internal_ip: Option<IpAddr>,
}

impl Environment {
    /// MetalLB range covering only the node's own address (`ip-ip`).
    #[must_use]
    pub fn single_address_range(&self) -> Option<String> {
        self.internal_ip.map(|ip| format!("{ip}-{ip}"))
    }
}

/// Queries cloud metadata endpoints.
#[derive(Debug, Clone)]
pub struct EnvironmentDetector {
    client: reqwest::Client,
    gcp_url: String,
    aws_url: String,
}

impl EnvironmentDetector {
    /// Detector using the real metadata endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_endpoints(GCP_METADATA_URL, AWS_METADATA_URL)
    }

    /// Detector using custom metadata base URLs.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_endpoints(gcp_url: impl Into<String>, aws_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .connect_timeout(METADATA_TIMEOUT)
            .build()
            .context("Failed to build metadata HTTP client")?;
        Ok(Self {
            client,
            gcp_url: gcp_url.into().trim_end_matches('/').to_string(),
            aws_url: aws_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Detect the platform, falling back to bare metal.
    pub async fn detect(&self) -> Environment {
        if let Some(ip) = self.query_gcp().await {
            info!(platform = "gcp", %ip, "Detected environment");
            return Environment {
                platform: Platform::Gcp,
                internal_ip: Some(ip),
            };
        }
        if let Some(ip) = self.query_aws().await {
            info!(platform = "aws", %ip, "Detected environment");
            return Environment {
                platform: Platform::Aws,
                internal_ip: Some(ip),
            };
        }

        let internal_ip = primary_local_ip();
        info!(platform = "bare-metal", ip = ?internal_ip, "Detected environment");
        Environment {
            platform: Platform::BareMetal,
            internal_ip,
        }
    }

    async fn query_gcp(&self) -> Option<IpAddr> {
        let url = format!(
            "{}/computeMetadata/v1/instance/network-interfaces/0/ip",
            self.gcp_url
        );
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .inspect_err(|e| debug!(error = %e, "GCP metadata lookup failed"))
            .ok()?;

        // Anything answering without the flavor header is not GCP.
        let flavor_ok = response
            .headers()
            .get("Metadata-Flavor")
            .is_some_and(|v| v == "Google");
        if !response.status().is_success() || !flavor_ok {
            return None;
        }
        response.text().await.ok()?.trim().parse().ok()
    }

    async fn query_aws(&self) -> Option<IpAddr> {
        // IMDSv2: a session token first, then the metadata read.
        let token = self
            .client
            .put(format!("{}/latest/api/token", self.aws_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
            .send()
            .await
            .inspect_err(|e| debug!(error = %e, "AWS metadata lookup failed"))
            .ok()?
            .error_for_status()
            .ok()?
            .text()
            .await
            .ok()?;

        let response = self
            .client
            .get(format!("{}/latest/meta-data/local-ipv4", self.aws_url))
            .header("X-aws-ec2-metadata-token", token.trim())
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        response.text().await.ok()?.trim().parse().ok()
    }
}

/// Address of the interface holding the default route.
///
/// Connecting a UDP socket sends no packets; it only selects a source address.
#[must_use]
pub fn primary_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UNROUTABLE: &str = "http://127.0.0.1:9";

    #[tokio::test]
    async fn test_detects_gcp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/computeMetadata/v1/instance/network-interfaces/0/ip"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Metadata-Flavor", "Google")
                    .set_body_string("10.128.0.7\n"),
            )
            .mount(&server)
            .await;

        let env = EnvironmentDetector::with_endpoints(server.uri(), UNROUTABLE)
            .unwrap()
            .detect()
            .await;

        assert_eq!(env.platform, Platform::Gcp);
        assert_eq!(env.internal_ip, Some("10.128.0.7".parse().unwrap()));
        assert_eq!(env.single_address_range().as_deref(), Some("10.128.0.7-10.128.0.7"));
    }

    #[tokio::test]
    async fn test_gcp_response_without_flavor_header_is_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("10.0.0.1"))
            .mount(&server)
            .await;

        let env = EnvironmentDetector::with_endpoints(server.uri(), UNROUTABLE)
            .unwrap()
            .detect()
            .await;

        assert_eq!(env.platform, Platform::BareMetal);
    }

    #[tokio::test]
    async fn test_detects_aws_with_session_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("session-token"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/local-ipv4"))
            .and(header("X-aws-ec2-metadata-token", "session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("172.31.5.20"))
            .mount(&server)
            .await;

        let env = EnvironmentDetector::with_endpoints(UNROUTABLE, server.uri())
            .unwrap()
            .detect()
            .await;

        assert_eq!(env.platform, Platform::Aws);
        assert_eq!(env.internal_ip, Some("172.31.5.20".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_falls_back_to_bare_metal() {
        let env = EnvironmentDetector::with_endpoints(UNROUTABLE, UNROUTABLE)
            .unwrap()
            .detect()
            .await;
        assert_eq!(env.platform, Platform::BareMetal);
    }
}
