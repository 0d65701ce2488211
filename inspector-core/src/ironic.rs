//! Control-plane client for the Ironic bare metal API.
//!
//! Provides a `ControlPlane` trait, so the orchestrator can be driven by a mock in
//! tests, and `IronicClient`, which talks to the Ironic v1 REST API over HTTP.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::IronicConfig;
use crate::models::{BootDevice, Node, NodeValidation, Port, PowerState};

// ============================================================================
// ControlPlane trait
// ============================================================================

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<Node, IronicError>;

    async fn validate(&self, id: &str) -> Result<NodeValidation, IronicError>;

    async fn set_boot_device(
        &self,
        id: &str,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), IronicError>;

    async fn set_power_state(&self, id: &str, state: PowerState) -> Result<(), IronicError>;

    async fn list_ports(&self, id: &str) -> Result<Vec<Port>, IronicError>;

    /// Fails with `IronicError::Conflict` if a port with this address already exists.
    async fn create_port(&self, id: &str, address: &str) -> Result<Port, IronicError>;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum IronicError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid Ironic URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl IronicError {
    /// Optimistic-lock rejection, safe to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, IronicError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IronicError::NotFound(_))
    }
}

// ============================================================================
// Ironic API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct BootDeviceRequest<'a> {
    boot_device: &'a str,
    persistent: bool,
}

#[derive(Debug, Serialize)]
struct PowerStateRequest<'a> {
    target: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePortRequest<'a> {
    node_uuid: &'a str,
    address: &'a str,
}

#[derive(Debug, Deserialize)]
struct PortList {
    ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
struct IronicErrorBody {
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IronicFault {
    faultstring: Option<String>,
}

/// Ironic wraps errors as `{"error_message": "<json with faultstring>"}`.
fn extract_fault(body: &str) -> String {
    let message = serde_json::from_str::<IronicErrorBody>(body)
        .ok()
        .and_then(|b| b.error_message);

    match message {
        Some(inner) => serde_json::from_str::<IronicFault>(&inner)
            .ok()
            .and_then(|f| f.faultstring)
            .unwrap_or(inner),
        None => body.to_string(),
    }
}

// ============================================================================
// IronicClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct IronicClient {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
    api_version: String,
}

impl IronicClient {
    pub fn new(config: &IronicConfig) -> Result<Self, IronicError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.url)?,
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
            api_version: config.api_version.clone(),
        })
    }

    /// Create a client with a custom base URL (for testing)
    pub fn with_base_url(base_url: String) -> Result<Self, IronicError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: parse_base_url(&base_url)?,
            auth_token: None,
            api_version: "1.6".to_string(),
        })
    }

    /// Each segment is percent-encoded on its own, so ids cannot alter the path.
    fn request(&self, method: reqwest::Method, segments: &[&str]) -> RequestBuilder {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        let mut builder = self
            .client
            .request(method, url)
            .header("X-OpenStack-Ironic-API-Version", &self.api_version);
        if let Some(token) = &self.auth_token {
            builder = builder.header("X-Auth-Token", token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, IronicError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = extract_fault(&body);

        match status {
            StatusCode::NOT_FOUND => Err(IronicError::NotFound(message)),
            StatusCode::CONFLICT => Err(IronicError::Conflict(message)),
            _ => {
                tracing::debug!(code = status.as_u16(), message = %message, "Ironic API error");
                Err(IronicError::Api {
                    code: status.as_u16(),
                    message,
                })
            }
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, IronicError> {
    let invalid = |reason: String| IronicError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("not a base URL".to_string()));
    }
    Ok(url)
}

#[async_trait]
impl ControlPlane for IronicClient {
    async fn get_node(&self, id: &str) -> Result<Node, IronicError> {
        let response = self
            .send(self.request(reqwest::Method::GET, &["nodes", id]))
            .await?;
        Ok(response.json().await?)
    }

    async fn validate(&self, id: &str) -> Result<NodeValidation, IronicError> {
        let response = self
            .send(self.request(reqwest::Method::GET, &["nodes", id, "validate"]))
            .await?;
        Ok(response.json().await?)
    }

    async fn set_boot_device(
        &self,
        id: &str,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), IronicError> {
        let body = BootDeviceRequest {
            boot_device: device.as_str(),
            persistent,
        };
        self.send(
            self.request(
                reqwest::Method::PUT,
                &["nodes", id, "management", "boot_device"],
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn set_power_state(&self, id: &str, state: PowerState) -> Result<(), IronicError> {
        let body = PowerStateRequest {
            target: state.as_str(),
        };
        self.send(
            self.request(reqwest::Method::PUT, &["nodes", id, "states", "power"])
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_ports(&self, id: &str) -> Result<Vec<Port>, IronicError> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, &["nodes", id, "ports"])
                    .query(&[("limit", "0")]),
            )
            .await?;
        let list: PortList = response.json().await?;
        Ok(list.ports)
    }

    async fn create_port(&self, id: &str, address: &str) -> Result<Port, IronicError> {
        let body = CreatePortRequest {
            node_uuid: id,
            address,
        };
        let response = self
            .send(self.request(reqwest::Method::POST, &["ports"]).json(&body))
            .await?;
        Ok(response.json().await?)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fault(message: &str) -> serde_json::Value {
        serde_json::json!({
            "error_message": serde_json::json!({"faultstring": message}).to_string()
        })
    }

    #[tokio::test]
    async fn test_get_node_parses_record() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/n1"))
            .and(header("X-OpenStack-Ironic-API-Version", "1.6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uuid": "n1",
                "provision_state": "manageable",
                "maintenance": true,
                "driver_info": {"ipmi_address": "10.1.1.1"}
            })))
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        let node = client.get_node("n1").await.unwrap();

        assert_eq!(node.uuid, "n1");
        assert_eq!(node.provision_state.as_deref(), Some("manageable"));
        assert!(node.maintenance);
        assert_eq!(node.driver_info_str("ipmi_address"), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_get_node_404_is_not_found() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(fault("Node n2 could not be found.")))
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        match client.get_node("n2").await {
            Err(IronicError::NotFound(msg)) => assert_eq!(msg, "Node n2 could not be found."),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_power_state_409_is_conflict() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/nodes/n1/states/power"))
            .and(body_json(serde_json::json!({"target": "reboot"})))
            .respond_with(ResponseTemplate::new(409).set_body_json(fault("Node n1 is locked")))
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        let err = client
            .set_power_state("n1", PowerState::Reboot)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_set_boot_device_sends_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/nodes/n1/management/boot_device"))
            .and(body_json(serde_json::json!({"boot_device": "pxe", "persistent": false})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        client
            .set_boot_device("n1", BootDevice::Pxe, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_ports_and_validate() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/n1/ports"))
            .and(query_param("limit", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ports": [
                    {"uuid": "p1", "address": "11:22:33:44:55:66"},
                    {"uuid": "p2", "address": "66:55:44:33:22:11"}
                ]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/n1/validate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "power": {"result": false, "reason": "no ipmi_address"},
                "deploy": {"result": true}
            })))
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        let ports = client.list_ports("n1").await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].address, "66:55:44:33:22:11");

        let validation = client.validate("n1").await.unwrap();
        assert!(!validation.power.passed());
        assert_eq!(validation.power.reason.as_deref(), Some("no ipmi_address"));
    }

    #[tokio::test]
    async fn test_create_port_and_api_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ports"))
            .and(body_json(serde_json::json!({"node_uuid": "n1", "address": "aa:bb"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "uuid": "p9", "address": "aa:bb", "node_uuid": "n1"
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/ports"))
            .and(body_json(serde_json::json!({"node_uuid": "n1", "address": "cc:dd"})))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal failure"))
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(mock_server.uri()).unwrap();
        let port = client.create_port("n1", "aa:bb").await.unwrap();
        assert_eq!(port.uuid, "p9");
        assert_eq!(port.node_uuid.as_deref(), Some("n1"));

        match client.create_port("n1", "cc:dd").await {
            Err(IronicError::Api { code, message }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "internal failure");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_id_is_a_single_path_segment() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/x%2Fvalidate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uuid": "x/validate",
                "maintenance": false
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/nodes/x/validate"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = IronicClient::with_base_url(format!("{}/", mock_server.uri())).unwrap();
        let node = client.get_node("x/validate").await.unwrap();
        assert_eq!(node.uuid, "x/validate");

        let err = client.list_ports("../ports").await.unwrap_err();
        assert!(err.is_not_found());
        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.last().unwrap().url.path(), "/v1/nodes/..%2Fports/ports");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(matches!(
            IronicClient::with_base_url("not a url".to_string()),
            Err(IronicError::InvalidUrl { .. })
        ));
        assert!(matches!(
            IronicClient::with_base_url("mailto:ironic@example.com".to_string()),
            Err(IronicError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_extract_fault_falls_back_to_raw_message() {
        let body = serde_json::json!({"error_message": "plain text"}).to_string();
        assert_eq!(extract_fault(&body), "plain text");
        assert_eq!(extract_fault("not json"), "not json");
    }
}
