//! HTTP (Streamable HTTP) transport construction.
//!
//! Grounded on the teacher's `server/http.rs` for the overall connect/handshake
//! shape, and on the custom-header `reqwest::Client` + `StreamableHttpClientTransportConfig`
//! pattern used to reach the MCP wire layer with non-default headers — the teacher's
//! own `from_uri` shortcut has no hook for the Accept-header normalization this
//! catalog format requires.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;

use crate::catalog::ensure_http_accept_header;
use crate::error::{HubError, Result};

/// Build a Streamable HTTP client transport with a normalized `Accept` header
/// (and any caller-supplied headers) set as defaults on the underlying HTTP client.
pub fn build_transport(
    url: &str,
    headers: &HashMap<String, String>,
    name: &str,
) -> Result<StreamableHttpClientTransport<reqwest::Client>> {
    let mut normalized = headers.clone();
    ensure_http_accept_header(&mut normalized);

    let mut header_map = HeaderMap::new();
    for (key, value) in &normalized {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(val)) => {
                header_map.insert(name, val);
            }
            _ => tracing::warn!(server = %name, header = %key, "skipping invalid header value"),
        }
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .default_headers(header_map)
        .build()
        .map_err(|e| HubError::RuntimeError(format!("failed to build HTTP client: {e}")))?;

    let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
    Ok(StreamableHttpClientTransport::with_client(client, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normalizes_accept_even_when_caller_omitted_it() {
        let headers = HashMap::new();
        let transport = build_transport("https://example.com/mcp", &headers, "test");
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn preserves_authorization_header_alongside_accept() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer xyz".to_string());
        let transport = build_transport("https://example.com/mcp", &headers, "test");
        assert!(transport.is_ok());
    }
}
