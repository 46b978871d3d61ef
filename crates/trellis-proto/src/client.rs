//! HTTP client for the Trellis control-plane RPC surface
//!
//! Provides a simple async client with one method per operation. Uses
//! reqwest for HTTP operations; protocol errors surface as typed
//! [`ClientError::Api`] values carrying the stable error code.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::rpc::*;
use crate::types::Route;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when calling a Trellis node
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Node returned a protocol error
    #[error("API error ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Invalid client configuration
    #[error("client configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Stable protocol code of the error, if it is an API error
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Whether the node reported an absent primary (retryable)
    pub fn is_no_primary(&self) -> bool {
        self.code() == Some(codes::NO_PRIMARY)
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Builder for [`Client`]
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    timeout: Option<Duration>,
    skip_verify: bool,
    identity_pem: Option<Vec<u8>>,
}

impl ClientBuilder {
    /// Per-request timeout (default 10s)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable TLS certificate verification
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// PEM-encoded client certificate and key for mutual TLS
    pub fn identity_pem(mut self, pem: Vec<u8>) -> Self {
        self.identity_pem = Some(pem);
        self
    }

    /// Build a client for the given node address
    ///
    /// `addr` is either `host:port` (plain HTTP is assumed) or a full
    /// `http://` / `https://` base URL.
    pub fn build(self, addr: &str) -> Result<Client> {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };

        let mut builder =
            reqwest::Client::builder().timeout(self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT));
        if self.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = self.identity_pem {
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ClientError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        Ok(Client {
            base,
            http: builder.build()?,
        })
    }
}

/// Client for the control-plane RPC surface of a single node
#[derive(Debug, Clone)]
pub struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a client with default options
    pub fn new(addr: &str) -> Result<Self> {
        ClientBuilder::default().build(addr)
    }

    /// Start building a client with custom options
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn post<Req, Resp>(&self, op: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/api/v1/{}", self.base, op);
        let resp = self.http.post(url).json(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        Err(error_from_response(status, resp).await)
    }

    /// Join the cluster through this node
    pub async fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        self.post("join", req).await
    }

    /// Connect as a client peer
    pub async fn connect(&self, id: &str, name: &str) -> Result<ConnectResponse> {
        self.post(
            "connect",
            &ConnectRequest {
                id: id.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    /// Add a peer ID to the authorised set
    pub async fn authorize_peer(&self, id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post("peers/authorize", &AuthorizePeerRequest { id: id.to_string() })
            .await?;
        Ok(())
    }

    /// Remove a peer ID from the authorised set and evict it
    pub async fn deauthorize_peer(&self, id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "peers/deauthorize",
                &DeauthorizePeerRequest { id: id.to_string() },
            )
            .await?;
        Ok(())
    }

    /// List authorised peer IDs
    pub async fn authorized_peers(&self) -> Result<Vec<String>> {
        let resp: AuthorizedPeersResponse = self.post("peers/authorized", &()).await?;
        Ok(resp.ids)
    }

    /// List cluster nodes
    pub async fn nodes(&self) -> Result<Vec<crate::types::Node>> {
        let resp: NodesResponse = self.post("nodes", &()).await?;
        Ok(resp.nodes)
    }

    /// List peers
    pub async fn peers(&self) -> Result<Vec<crate::types::Peer>> {
        let resp: PeersResponse = self.post("peers", &()).await?;
        Ok(resp.peers)
    }

    /// List routes
    pub async fn routes(&self) -> Result<Vec<Route>> {
        let resp: RoutesResponse = self.post("routes", &()).await?;
        Ok(resp.routes)
    }

    /// Reserve a route through the given node
    pub async fn create_route(&self, node_id: &str, network: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "routes/create",
                &CreateRouteRequest {
                    node_id: node_id.to_string(),
                    network: network.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Delete a route
    pub async fn delete_route(&self, network: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "routes/delete",
                &DeleteRouteRequest {
                    network: network.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

async fn error_from_response(status: StatusCode, resp: reqwest::Response) -> ClientError {
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            code: body.code,
            message: body.message,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            code: "internal".to_string(),
            message: text,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let c = Client::new("10.0.0.1:9000").unwrap();
        assert_eq!(c.base_url(), "http://10.0.0.1:9000");

        let c = Client::new("https://node.example:9000/").unwrap();
        assert_eq!(c.base_url(), "https://node.example:9000");
    }

    #[test]
    fn test_error_code_helpers() {
        let err = ClientError::Api {
            status: 503,
            code: codes::NO_PRIMARY.to_string(),
            message: "no configured master".to_string(),
        };
        assert!(err.is_no_primary());
        assert_eq!(err.code(), Some("no-primary"));
    }
}
