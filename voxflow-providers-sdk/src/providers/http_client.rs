//! Shared HTTP plumbing for the remote providers: client construction,
//! default headers, multipart upload, and status-class error mapping.

use crate::error::{ErrorCode, TranscriptionError};
use reqwest::{header::HeaderMap, Client, Response};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// How a provider authenticates its requests.
#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

/// Thin wrapper around a configured reqwest client.
#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
    provider: String,
}

impl HttpProviderClient {
    pub fn new(
        provider: &str,
        timeout: Duration,
        base_url: Option<String>,
        default_base: &str,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, TranscriptionError> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            TranscriptionError::invalid_input(provider, format!("failed to create HTTP client: {e}"))
        })?;

        let mut default_headers = HeaderMap::new();
        match auth {
            AuthStrategy::Bearer { token } => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    default_headers.insert("Authorization", value);
                }
            }
            AuthStrategy::Header { name, value } => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<reqwest::header::HeaderName>(), value.parse())
                {
                    default_headers.insert(name, value);
                }
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        let base_url = base_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url,
            default_headers,
            provider: provider.to_string(),
        })
    }

    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.base_url.trim_end_matches('/'), path)
        }
    }

    /// Read the input file into a multipart part.
    pub async fn file_part(&self, path: &Path) -> Result<reqwest::multipart::Part, TranscriptionError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            TranscriptionError::new(
                ErrorCode::FileOpenError,
                &self.provider,
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        Ok(reqwest::multipart::Part::bytes(bytes).file_name(file_name))
    }

    /// POST a multipart form, mapping transport failures to network errors.
    pub async fn post_multipart(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Response, TranscriptionError> {
        let url = self.build_url(path);
        self.http
            .post(url)
            .headers(self.default_headers.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.provider, e))
    }

    pub async fn get(&self, path: &str) -> Result<Response, TranscriptionError> {
        let url = self.build_url(path);
        self.http
            .get(url)
            .headers(self.default_headers.clone())
            .send()
            .await
            .map_err(|e| map_transport_error(&self.provider, e))
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.build_url(path))
            .headers(self.default_headers.clone())
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// Map a reqwest transport failure into the error taxonomy.
pub fn map_transport_error(provider: &str, err: reqwest::Error) -> TranscriptionError {
    if err.is_timeout() {
        TranscriptionError::network(provider, format!("request timed out: {err}"))
    } else if err.is_connect() {
        TranscriptionError::network(provider, format!("connection failed: {err}"))
    } else {
        TranscriptionError::network(provider, err.to_string())
    }
}

/// Map a non-2xx response into the error taxonomy. Pulls a message out of
/// common JSON error envelopes when one is present.
pub async fn map_error_response(provider: &str, resp: Response) -> TranscriptionError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").cloned().or_else(|| Some(e.clone())))
        })
        .and_then(|m| m.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.to_string()
            } else {
                body.clone()
            }
        });

    match status.as_u16() {
        401 | 403 => TranscriptionError::authentication(provider, message)
            .with_suggestion("check the configured api_key"),
        429 => TranscriptionError::new(ErrorCode::RateLimitExceeded, provider, message),
        code if code >= 500 => TranscriptionError::server(provider, format!("HTTP {code}: {message}")),
        code => TranscriptionError::invalid_input(provider, format!("HTTP {code}: {message}")),
    }
}
