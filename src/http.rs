//! Blocking HTTP transport used by the REST sinks.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use crate::sink::SinkError;

/// A request as the REST sinks describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// JSON body, only sent with [`Method::Post`].
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl HttpRequest {
    pub fn get<U: Into<String>>(url: U, timeout: Duration) -> Self {
        HttpRequest {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn post_json<U: Into<String>>(url: U, body: String, timeout: Duration) -> Self {
        HttpRequest {
            method: Method::Post,
            url: url.into(),
            query: Vec::new(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
            timeout,
        }
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Value of the first query parameter named `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new<B: Into<String>>(status: u16, body: B) -> Self {
        HttpResponse {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Sends one request and waits for the answer.
///
/// Any status code is a successful exchange; only transport problems are
/// errors.
pub trait HttpClient: Send {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, Error>;
}

/// [`HttpClient`] backed by a shared `ureq` agent.
#[derive(Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new() -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();

        UreqClient {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for UreqClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UreqClient").finish()
    }
}

impl HttpClient for UreqClient {
    #[tracing::instrument(skip_all, fields(method = ?request.method, url = %request.url), err)]
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let mut response = match request.method {
            Method::Get => {
                let mut builder = self.agent.get(request.url.as_str());
                for (key, value) in &request.query {
                    builder = builder.query(key, value);
                }
                for (key, value) in &request.headers {
                    builder = builder.header(key.as_str(), value.as_str());
                }
                builder
                    .config()
                    .timeout_global(Some(request.timeout))
                    .build()
                    .call()?
            }
            Method::Post => {
                let mut builder = self.agent.post(request.url.as_str());
                for (key, value) in &request.query {
                    builder = builder.query(key, value);
                }
                for (key, value) in &request.headers {
                    builder = builder.header(key.as_str(), value.as_str());
                }
                builder
                    .config()
                    .timeout_global(Some(request.timeout))
                    .build()
                    .send(request.body.as_deref().unwrap_or_default())?
            }
        };

        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string().unwrap_or_default();
        tracing::debug!(status, "response received");

        Ok(HttpResponse { status, body })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request timed out")]
    Timeout,

    #[error("transport: {0}")]
    Transport(String),
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Timeout(_) => Error::Timeout,
            other => Error::Transport(other.to_string()),
        }
    }
}

impl From<Error> for SinkError {
    fn from(e: Error) -> Self {
        match e {
            Error::Timeout => SinkError::NetworkTimeout,
            Error::Transport(reason) => SinkError::NetworkUnreachable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = HttpRequest::get("https://example.invalid/update", Duration::from_secs(15))
            .query("token", "abc")
            .query("V0", "22.5")
            .header("Accept", "application/json");

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.query_value("V0"), Some("22.5"));
        assert_eq!(request.query_value("V1"), None);
        assert!(request.body.is_none());

        let post = HttpRequest::post_json("https://example.invalid", "{}".into(), Duration::from_secs(10));
        assert_eq!(post.method, Method::Post);
        assert_eq!(
            post.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_transport_error_maps_to_sink_error() {
        assert_eq!(SinkError::from(Error::Timeout), SinkError::NetworkTimeout);
        assert_eq!(
            SinkError::from(Error::Transport("dns".into())),
            SinkError::NetworkUnreachable("dns".into())
        );
    }

    #[test]
    fn test_unreachable_host_is_transport_error() {
        let client = UreqClient::new();
        let request = HttpRequest::get("http://127.0.0.1:1/", Duration::from_secs(2));

        let err = client.send(&request).unwrap_err();
        assert!(matches!(err, Error::Transport(_) | Error::Timeout));
    }
}
