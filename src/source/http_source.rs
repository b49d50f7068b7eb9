use std::collections::HashMap;

use anyhow::{anyhow, Result};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

/// What a probe learned about an origin resource.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub content_length: u64,
    pub content_type: String,
    pub supports_range: bool,
}

/// Origin-side view of a media URL, used to learn its total length.
pub struct HttpSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
}

impl HttpSource {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self::with_client(Client::new(), url, headers)
    }

    /// Reuse an existing client (and its connection pool).
    pub fn with_client(client: Client, url: String, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build a GET request with custom headers and an optional Range header.
    fn build_request(&self, range_header: Option<&str>) -> RequestBuilder {
        let mut req = self.client.get(&self.url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = range_header {
            req = req.header("Range", range);
        }
        req
    }

    /// Ask the origin for a single byte to discover the total length.
    pub async fn probe(&self) -> Result<SourceInfo> {
        let resp = self.build_request(Some("bytes=0-0")).send().await?;

        let status = resp.status();
        debug!("http probe url={} status={}", self.url, status.as_u16());
        if !status.is_success() {
            warn!("http probe failed url={} status={}", self.url, status.as_u16());
            return Err(anyhow!("probe failed: HTTP {}", status.as_u16()));
        }

        // Content-Range: bytes 0-0/<total>
        let supports_range = status.as_u16() == 206;
        let content_length = if supports_range {
            resp.headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(0)
        } else {
            resp.content_length().unwrap_or(0)
        };

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(SourceInfo {
            content_length,
            content_type,
            supports_range,
        })
    }
}

/// Extract `<total>` from `bytes <start>-<end>/<total>`. Unknown totals (`*`) yield `None`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse::<u64>().ok()
}
