//! Client-side sync transports.
//!
//! The engine is generic over [`SyncTransport`] so tests and embedded
//! deployments can exchange messages in-process while production clients
//! speak HTTP.

use crate::models::{SyncRequest, SyncResponse};
use crate::sync::SyncService;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// The three phases of an Inbetweenies exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Send local changes, receive the delta.
    Request,
    /// Send a follow-up batch of local changes.
    Push,
    /// Confirm the delta was applied.
    Ack,
}

impl SyncPhase {
    /// Returns the phase's endpoint segment.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Push => "push",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One round-trip per phase.
pub trait SyncTransport: Send + Sync {
    /// Performs one phase of an exchange.
    fn exchange(
        &self,
        phase: SyncPhase,
        request: &SyncRequest,
    ) -> impl std::future::Future<Output = Result<SyncResponse>> + Send;
}

/// HTTP transport: one POST endpoint per phase under `/api/sync/`.
pub struct HttpSyncTransport {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpSyncTransport {
    /// Creates a transport against `base_url` (scheme + host + port).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer_token: None,
        }
    }

    /// Attaches a bearer token to every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

impl SyncTransport for HttpSyncTransport {
    async fn exchange(&self, phase: SyncPhase, request: &SyncRequest) -> Result<SyncResponse> {
        let url = format!(
            "{}/api/sync/{phase}",
            self.base_url.trim_end_matches('/')
        );

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| Error::StoreUnavailable {
            operation: format!("sync_{phase}"),
            cause: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| Error::OperationFailed {
                operation: format!("sync_{phase}_decode"),
                cause: e.to_string(),
            });
        }

        match status {
            reqwest::StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized("sync token rejected".to_string()))
            },
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Err(Error::TooManyRequests { retry_after_secs })
            },
            reqwest::StatusCode::UPGRADE_REQUIRED => Err(Error::ProtocolMismatch {
                expected: crate::models::PROTOCOL_VERSION.to_string(),
                got: "unknown".to_string(),
            }),
            s if s.is_server_error() => Err(Error::StoreUnavailable {
                operation: format!("sync_{phase}"),
                cause: format!("server returned {s}"),
            }),
            s => Err(Error::OperationFailed {
                operation: format!("sync_{phase}"),
                cause: format!("server returned {s}"),
            }),
        }
    }
}

/// In-process transport wired straight into a server [`SyncService`].
///
/// Used by tests and by deployments where client and server replicas live
/// in one process.
pub struct LoopbackTransport {
    service: Arc<SyncService>,
}

impl LoopbackTransport {
    /// Creates a loopback transport over `service`.
    #[must_use]
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

impl SyncTransport for LoopbackTransport {
    async fn exchange(&self, phase: SyncPhase, request: &SyncRequest) -> Result<SyncResponse> {
        match phase {
            SyncPhase::Request => self.service.handle_request(request),
            SyncPhase::Push => self.service.handle_push(request),
            SyncPhase::Ack => self.service.handle_ack(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_endpoint_segments() {
        assert_eq!(SyncPhase::Request.as_str(), "request");
        assert_eq!(SyncPhase::Push.as_str(), "push");
        assert_eq!(SyncPhase::Ack.as_str(), "ack");
    }
}
