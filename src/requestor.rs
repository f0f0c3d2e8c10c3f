//! Requests against the ProKnow API.
//!
//! [Transport] is the seam between this library and the network: the library only ever builds
//! [ApiRequest] values and reads [ApiResponse] values, so tests can swap the reqwest-backed
//! [HttpTransport](crate::HttpTransport) for an in-memory server. [Requestor] layers the typed
//! helpers (JSON bodies, query parameters, status checks) on top of any transport.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{ProKnowError, Result};

/// Body of an [ApiRequest].
#[derive(Clone, Debug)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// A multipart form made of text fields and one file part named `file`.
    ///
    /// The file is read by the transport when the request is sent.
    File {
        fields: Vec<(String, String)>,
        path: PathBuf,
    },
}

#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Route relative to the API root, e.g. `/workspaces`.
    pub route: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        ApiRequest {
            method,
            route: route.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names are stored lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        ApiResponse {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn json_value(status: u16, value: &Value) -> Self {
        ApiResponse::new(status, value.to_string())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Issues requests to the API.
///
/// `send` returns the response whatever its status; [Requestor] turns statuses of 400 and above
/// into [ProKnowError::Http]. `stream` must fail with [ProKnowError::Http] itself since the body
/// never reaches the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Writes the body of a `GET` on `route` to the file at `path`.
    async fn stream(&self, request: ApiRequest, path: &Path) -> Result<()>;
}

/// Typed request helpers shared by every resource of the client.
#[derive(Clone)]
pub struct Requestor {
    transport: Arc<dyn Transport>,
}

impl Requestor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Requestor { transport }
    }

    pub fn request(&self, method: Method, route: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            transport: Arc::clone(&self.transport),
            request: ApiRequest::new(method, route),
            error: None,
        }
    }

    pub fn get(&self, route: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, route)
    }

    pub fn post(&self, route: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, route)
    }

    pub fn put(&self, route: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, route)
    }

    pub fn patch(&self, route: impl Into<String>) -> RequestBuilder {
        self.request(Method::PATCH, route)
    }

    pub fn delete(&self, route: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, route)
    }
}

#[must_use = "requests do nothing until sent"]
pub struct RequestBuilder {
    transport: Arc<dyn Transport>,
    request: ApiRequest,
    error: Option<ProKnowError>,
}

impl RequestBuilder {
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.request.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_pairs(mut self, pairs: &[(String, String)]) -> Self {
        self.request.query.extend_from_slice(pairs);
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.request.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => self.request.body = RequestBody::Json(value),
            Err(e) => self.error = Some(e.into()),
        }
        self
    }

    pub fn file(mut self, fields: Vec<(String, String)>, path: impl Into<PathBuf>) -> Self {
        self.request.body = RequestBody::File {
            fields,
            path: path.into(),
        };
        self
    }

    /// Sends the request, failing with [ProKnowError::Http] on a status of 400 or above.
    pub async fn send(self) -> Result<ApiResponse> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let method = self.request.method.clone();
        let route = self.request.route.clone();
        let start = std::time::Instant::now();

        let response = self.transport.send(self.request).await?;

        debug!("{} {} -> {} in {:?}", method, route, response.status, start.elapsed());
        if response.status >= 400 {
            error!("Error {} while calling {} {}", response.status, method, route);
            return Err(ProKnowError::Http {
                status: response.status,
                body: response.text(),
            });
        }
        Ok(response)
    }

    /// Sends the request and decodes the JSON body.
    pub async fn fetch<T: DeserializeOwned>(self) -> Result<T> {
        self.send().await?.json()
    }

    /// Sends the request and returns the raw body.
    pub async fn bytes(self) -> Result<Bytes> {
        Ok(self.send().await?.body)
    }

    /// Streams the response body of a `GET` to `path`.
    pub async fn stream_to(self, path: &Path) -> Result<()> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let route = self.request.route.clone();
        let start = std::time::Instant::now();
        self.transport.stream(self.request, path).await?;
        debug!("Streamed {} to {} in {:?}", route, path.display(), start.elapsed());
        Ok(())
    }
}

/// Builds `/a/b/c` style routes.
macro_rules! route {
    ($($segment:expr),+ $(,)?) => {{
        let mut route = String::new();
        $(
            route.push('/');
            route.push_str(AsRef::<str>::as_ref(&$segment));
        )+
        route
    }};
}

pub(crate) use route;
