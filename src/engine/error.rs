use std::time::Duration;

use thiserror::Error;

/// Failures while pulling bytes through the proxy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("no data from {url} within {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("read from {url} failed: {source}")]
    Read {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The collaborator could not answer a cache or length query.
    #[error("cache proxy query failed: {0:#}")]
    Proxy(anyhow::Error),
}
