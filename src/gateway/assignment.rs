//! Gateway endpoint assignment.
//!
//! Before every connect attempt the hub asks the backend which gateway node
//! it should use. The answer is never cached across attempts.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::constants;

/// Assigned gateway node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayAssignment {
    /// Host name of the gateway node (no scheme, no path).
    #[serde(rename = "fqdn")]
    pub endpoint_host: String,
    /// ISO country code of the node, when the backend reports one.
    #[serde(default)]
    pub country: Option<String>,
}

/// Outcome of an assignment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// A node was assigned.
    Assigned(GatewayAssignment),
    /// HTTP 403: the device token was rejected.
    Unauthorized,
    /// HTTP 503: no node is available right now.
    Unavailable,
}

/// Backend response envelope.
#[derive(Debug, Deserialize)]
struct BaseResponse<T> {
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// HTTP client for the assignment endpoint.
#[derive(Debug, Clone)]
pub struct AssignmentClient {
    client: Client,
    backend: String,
    device_token: String,
}

impl AssignmentClient {
    /// Create a client for `backend` authenticating with `device_token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(backend: &str, device_token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .user_agent(constants::user_agent())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            backend: backend.trim_end_matches('/').to_string(),
            device_token: device_token.to_string(),
        })
    }

    /// Backend base URL.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Request a gateway node.
    ///
    /// 403 and 503 are expected outcomes and come back as
    /// [`Assignment::Unauthorized`] and [`Assignment::Unavailable`].
    ///
    /// # Errors
    ///
    /// Network failures, any other non-success status, and bodies without
    /// an assigned host.
    pub async fn request(&self) -> Result<Assignment> {
        let url = format!("{}{}", self.backend, constants::ASSIGNMENT_PATH);

        let response = self
            .client
            .get(&url)
            .header(constants::DEVICE_TOKEN_HEADER, &self.device_token)
            .send()
            .await
            .with_context(|| format!("Assignment request to {url} failed"))?;

        match response.status() {
            StatusCode::FORBIDDEN => return Ok(Assignment::Unauthorized),
            StatusCode::SERVICE_UNAVAILABLE => return Ok(Assignment::Unavailable),
            status if !status.is_success() => {
                anyhow::bail!("Assignment request failed: {status}");
            }
            _ => {}
        }

        let body: BaseResponse<GatewayAssignment> = response
            .json()
            .await
            .context("Failed to parse assignment response")?;

        match body.data {
            Some(assignment) if !assignment.endpoint_host.is_empty() => {
                Ok(Assignment::Assigned(assignment))
            }
            _ => anyhow::bail!(
                "Assignment response carried no host{}",
                body.message.map(|m| format!(": {m}")).unwrap_or_default()
            ),
        }
    }
}
