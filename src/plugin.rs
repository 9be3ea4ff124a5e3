use std::fmt;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::debug;

use crate::error::{RbError, Result};

pub mod definition;
pub mod instance;

pub use definition::{ContentTarget, CreateOutcome, RbApiClient};
pub use instance::{HealthCheckApi, InstanceClient, InstanceStatus, InstanceStatusApi};

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

/// Base URL and HTTP Basic credentials of the orchestration plugin.
#[derive(Clone, PartialEq, Eq)]
pub struct PluginAccess {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl PluginAccess {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(credentials))
    }

    /// Headers sent with every plugin request.
    pub fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON));
        let auth = HeaderValue::from_str(&self.basic_auth())
            .map_err(|err| RbError::Config(format!("invalid plugin credentials: {err}")))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }
}

impl fmt::Debug for PluginAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginAccess")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Status and body of a plugin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

impl RestResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Synchronous request seam used by [`RbApiClient`].
///
/// Paths are relative to the plugin base URL. Implementations only fail on
/// transport problems; HTTP status codes are returned to the caller.
pub trait RbTransport: Send + Sync {
    fn get(&self, path: &str) -> Result<RestResponse>;
    fn post_json(&self, path: &str, body: String) -> Result<RestResponse>;
    fn post_binary(&self, path: &str, bytes: Vec<u8>) -> Result<RestResponse>;

    /// Absolute URL for `path`, used in error messages.
    fn url(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Blocking reqwest transport with Basic auth baked into the default headers.
pub struct HttpTransport {
    client: Client,
    access: PluginAccess,
}

impl HttpTransport {
    pub fn new(access: PluginAccess) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(access.default_headers()?)
            .build()
            .map_err(|err| RbError::Transport(err.to_string()))?;
        Ok(Self { client, access })
    }

    fn send(&self, method: &str, request: reqwest::blocking::RequestBuilder) -> Result<RestResponse> {
        let response = request
            .send()
            .map_err(|err| RbError::Transport(format!("{method} request failed: {err}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| RbError::Transport(format!("failed to read response body: {err}")))?;
        Ok(RestResponse { status, body })
    }
}

impl RbTransport for HttpTransport {
    fn get(&self, path: &str) -> Result<RestResponse> {
        let url = self.url(path);
        debug!("GET {url}");
        self.send("GET", self.client.get(&url))
    }

    fn post_json(&self, path: &str, body: String) -> Result<RestResponse> {
        let url = self.url(path);
        debug!("POST {url}");
        self.send(
            "POST",
            self.client.post(&url).header(CONTENT_TYPE, JSON).body(body),
        )
    }

    fn post_binary(&self, path: &str, bytes: Vec<u8>) -> Result<RestResponse> {
        let url = self.url(path);
        debug!("POST {url} ({} bytes)", bytes.len());
        self.send(
            "POST",
            self.client
                .post(&url)
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(bytes),
        )
    }

    fn url(&self, path: &str) -> String {
        self.access.endpoint(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_trims_trailing_slash() {
        let access = PluginAccess::new("http://plugin:9015/v1/", "admin", "secret");
        assert_eq!(
            access.endpoint("/rb/definition/a/b"),
            "http://plugin:9015/v1/rb/definition/a/b"
        );
    }

    #[test]
    fn basic_auth_header_is_base64_encoded() {
        let access = PluginAccess::new("http://plugin", "admin", "admin");
        let headers = access.default_headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Basic YWRtaW46YWRtaW4=");
        assert_eq!(headers[ACCEPT], JSON);
    }

    #[test]
    fn debug_output_redacts_password() {
        let access = PluginAccess::new("http://plugin", "admin", "hunter2");
        let rendered = format!("{access:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn success_range_is_2xx() {
        assert!(RestResponse::new(201, "").is_success());
        assert!(!RestResponse::new(404, "").is_success());
        assert!(!RestResponse::new(199, "").is_success());
    }
}
