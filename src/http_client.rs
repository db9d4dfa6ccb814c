use crate::error::{Error, Result};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{
    blocking::Client,
    header::{ACCEPT, AUTHORIZATION},
};
use serde::de::DeserializeOwned;
use std::{fmt, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
        }
    }
}

/// A single JSON request against the device API
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub session_id: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl Request {
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::Get,
            path: path.to_string(),
            session_id: None,
            body: None,
        }
    }

    pub fn post(path: &str, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            path: path.to_string(),
            session_id: None,
            body: Some(body),
        }
    }

    pub fn post_empty(path: &str) -> Self {
        Self {
            method: Method::Post,
            path: path.to_string(),
            session_id: None,
            body: None,
        }
    }

    pub fn put(path: &str, body: serde_json::Value) -> Self {
        Self {
            method: Method::Put,
            path: path.to_string(),
            session_id: None,
            body: Some(body),
        }
    }

    /// Attach the `authorization: Session <id>` credential
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Ensure the response status is successful
    ///
    /// # Arguments
    /// * `context_msg` - Context message describing the request (e.g., "auth start")
    pub fn ensure_success(self, context_msg: &str) -> Result<Self> {
        if !self.is_success() {
            return Err(Error::transport(format!(
                "{context_msg} failed with status {} and body: {}",
                self.status, self.body
            )));
        }
        Ok(self)
    }

    /// Parse the response body, any missing field is a protocol error
    pub fn json<T: DeserializeOwned>(&self, context_msg: &str) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| Error::protocol(format!("failed to parse {context_msg} response: {e}")))
    }
}

/// Sends requests to the device
///
/// Implementations block until the response has been received completely.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait Transport {
    fn send(&self, request: Request) -> Result<Response>;
}

/// Transport over HTTP(S) with a per-request timeout
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a client for the device API
    ///
    /// # Arguments
    /// * `base_url` - API root of the device, e.g. `http://192.168.178.40/api/v1`
    /// * `timeout` - Upper bound for every single request
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_url(&self, path: &str) -> String {
        // Normalize path to always start with a single "/"
        let normalized_path = path.trim_start_matches('/');
        format!("{}/{normalized_path}", self.base_url)
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: Request) -> Result<Response> {
        let url = self.build_url(&request.path);
        debug!("{} {url}", request.method);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        }
        .header(ACCEPT, "application/json");

        if let Some(session_id) = &request.session_id {
            builder = builder.header(AUTHORIZATION, format!("Session {session_id}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let res = builder.send().map_err(|e| {
            Error::transport(format!(
                "failed to send {} request to {url}: {e}",
                request.method
            ))
        })?;

        let status = res.status().as_u16();
        let body = res
            .text()
            .map_err(|e| Error::transport(format!("failed to read response body: {e}")))?;

        Ok(Response { status, body })
    }
}
