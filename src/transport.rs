//! Outbound HTTP plumbing shared by shippers and the log shipper

use crate::error::{AgentError, Result};
use base64::prelude::*;
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client with the agent's default timeout
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AgentError::transport(format!("failed to create HTTP client: {}", e)))
}

/// `Authorization` header value for basic auth
pub fn basic_auth_header(username: &str, password: &str) -> String {
    let credentials = BASE64_STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", credentials)
}

pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| AgentError::config(format!("invalid HTTP method: {}", method)))
}

/// Send a JSON body and fail on any non-2xx status
pub async fn send_json(request: RequestBuilder, body: Vec<u8>) -> Result<u16> {
    let response = request
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AgentError::transport(format!(
            "HTTP {}: {}",
            status.as_u16(),
            text.trim()
        )));
    }
    Ok(status.as_u16())
}
