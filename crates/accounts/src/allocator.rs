//! Client for the per-run index allocator service.
//!
//! The allocator is a loopback-only HTTP service started by the run
//! coordinator; `GET /next` hands out a globally unique index per call.
//! Requests are bounded by a timeout so a hung allocator fails the calling
//! VU's step instead of stalling it indefinitely.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::selector::SelectError;

#[derive(Debug, Deserialize)]
struct NextIndexBody {
    index: i64,
}

/// Thin HTTP client for the allocator wire protocol.
#[derive(Clone, Debug)]
pub struct AllocatorClient {
    base: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl AllocatorClient {
    /// Builds a client for the allocator at `base`.
    pub fn new(base: Url, timeout: Duration) -> Self {
        Self {
            base,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// The allocator base URL.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Checks that the allocator is up.
    ///
    /// # Errors
    /// [`SelectError::AllocatorUnavailable`] if the service is unreachable or
    /// answers with a non-success status.
    pub async fn health(&self) -> Result<(), SelectError> {
        let url = self.endpoint("/health")?;
        self.client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(SelectError::AllocatorUnavailable)?;
        Ok(())
    }

    /// Fetches the next globally unique index.
    ///
    /// # Errors
    /// - [`SelectError::AllocatorUnavailable`] on connect/timeout failures.
    /// - [`SelectError::AllocatorProtocolError`] on a non-success status or a
    ///   body that is not a usable non-negative index.
    pub async fn next_index(&self) -> Result<u32, SelectError> {
        let url = self.endpoint("/next")?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(SelectError::AllocatorUnavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SelectError::AllocatorProtocolError {
                reason: format!("allocator /next failed: HTTP {}", status.as_u16()),
            });
        }

        let body: NextIndexBody =
            response
                .json()
                .await
                .map_err(|e| SelectError::AllocatorProtocolError {
                    reason: format!("allocator response is not an index object: {e}"),
                })?;

        u32::try_from(body.index).map_err(|_| SelectError::AllocatorProtocolError {
            reason: format!("allocator returned invalid index: {}", body.index),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SelectError> {
        self.base
            .join(path)
            .map_err(|e| SelectError::AllocatorProtocolError {
                reason: format!("invalid allocator endpoint {path}: {e}"),
            })
    }
}
