// src/utils/http.rs
//! Single-attempt HTTP helpers shared by the vendor, relayer and backup clients.
//!
//! Requests are sent exactly once. There is no retry and no timeout; a
//! non-200 response becomes a [`TransportError`] carrying the body text.

use log::{debug, warn};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;

/// Sends `request` and fails on anything but HTTP 200.
pub(crate) async fn execute(request: RequestBuilder, url: &str) -> Result<Response, TransportError> {
    debug!("Sending request to {}", url);
    let response = request
        .send()
        .await
        .map_err(|e| TransportError::from_reqwest(url, e))?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        warn!("Request to {} returned status {}: {}", url, status, body);
        return Err(TransportError::new(url, Some(status), body));
    }
    Ok(response)
}

/// Reads a 200 response body as JSON, surfacing an `{ "error": ... }` body as
/// a [`TransportError`].
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, TransportError> {
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::from_reqwest(url, e))?;
    let value: Value =
        serde_json::from_str(&body).map_err(|e| TransportError::new(url, Some(200), format!("{}: {}", e, body)))?;
    if let Some(error) = error_field(&value) {
        warn!("Request to {} returned an error body: {}", url, error);
        return Err(TransportError::new(url, Some(200), error));
    }
    serde_json::from_value(value).map_err(|e| TransportError::new(url, Some(200), format!("{}: {}", e, body)))
}

fn error_field(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}
