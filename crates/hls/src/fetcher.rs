//! URI fetcher (C2): single-flight, cancellable byte download. Grounded on
//! `mesio::hls::fetcher::SegmentFetcher`'s cancellation idiom
//! (`tokio::select!` racing a `CancellationToken` against the in-flight
//! `reqwest` future), stripped of the caching/metrics/progress-bar layers
//! that belong to `mesio`'s broader download pipeline.

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::HlsError;

/// Downloads one URI at a time; a second caller blocks on the same
/// in-flight-request lock rather than racing a parallel request.
pub struct Fetcher {
    client: reqwest::Client,
    token: CancellationToken,
    inflight: Mutex<()>,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, token: CancellationToken) -> Self {
        Self {
            client,
            token,
            inflight: Mutex::new(()),
        }
    }

    /// Fetches `uri`, returning its full body. Single-flight: concurrent
    /// callers serialise on the internal lock. Cancellable: returns
    /// `HlsError::Cancelled` promptly if the token fires while a request is
    /// outstanding or queued.
    pub async fn fetch(&self, uri: &str) -> Result<Bytes, HlsError> {
        let url = Url::parse(uri).map_err(|_| HlsError::not_found(uri))?;

        let _guard = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(HlsError::Cancelled),
            guard = self.inflight.lock() => guard,
        };

        trace!(uri = %url, "fetching");
        let request = self.client.get(url.clone()).send();
        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(HlsError::Cancelled),
            result = request => result,
        }
        .map_err(|e| HlsError::transport_error(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(uri = %url, %status, "fetch returned non-success status");
            return Err(HlsError::http_status(url.as_str(), status.as_u16()));
        }

        let bytes = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(HlsError::Cancelled),
            result = response.bytes() => result,
        }
        .map_err(|e| HlsError::transport_error(url.as_str(), e))?;

        debug!(uri = %url, bytes = bytes.len(), "fetch complete");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_returns_cancelled_when_token_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let fetcher = Fetcher::new(reqwest::Client::new(), token);

        let result = fetcher.fetch("https://example.com/seg0.ts").await;
        assert!(matches!(result, Err(HlsError::Cancelled)));
    }

    #[tokio::test]
    async fn fetch_rejects_unparseable_uri() {
        let fetcher = Fetcher::new(reqwest::Client::new(), CancellationToken::new());
        let result = fetcher.fetch("not a uri").await;
        assert!(matches!(result, Err(HlsError::NotFoundUri { .. })));
    }
}
