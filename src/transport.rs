use std::{path::Path, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, multipart, Body, Client};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, warn};

use crate::{
    config::{Config, Credentials},
    error::{ProKnowError, Result},
    requestor::{ApiRequest, ApiResponse, RequestBody, Transport},
};

/// [Transport] backed by reqwest, authenticating every request with the API key credentials.
pub struct HttpTransport {
    client: Client,
    api_url: String,
    credentials: Credentials,
    max_retries: u32,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(HttpTransport {
            client,
            api_url: config.api_url(),
            credentials: config.credentials.clone(),
            max_retries: config.max_retries,
            request_timeout: config.request_timeout,
        })
    }

    async fn build(&self, request: &ApiRequest, bounded: bool) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .client
            .request(request.method.clone(), format!("{}{}", self.api_url, request.route))
            .basic_auth(&self.credentials.id, Some(&self.credentials.secret));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            let mut value = header::HeaderValue::from_str(value).map_err(|e| {
                ProKnowError::InvalidArgument(format!("invalid value for header {}: {}", name, e))
            })?;
            if name.starts_with("ProKnow-") {
                value.set_sensitive(true);
            }
            builder = builder.header(name.as_str(), value);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::File { fields, path } => {
                return Ok(builder.multipart(file_form(fields, path).await?));
            }
        };
        // File transmissions and downloads are bounded by their size, not by the request timeout.
        if bounded {
            builder = builder.timeout(self.request_timeout);
        }
        Ok(builder)
    }

    /// Sends the request, retrying when the connection itself could not be established.
    async fn execute(&self, request: &ApiRequest, bounded: bool) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let builder = self.build(request, bounded).await?;
            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Connection failed for {} {} (attempt {}/{}): {}",
                        request.method, request.route, attempt, self.max_retries, e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Builds the multipart form for a file transmission.
///
/// The file is streamed from disk instead of being loaded in memory.
async fn file_form(fields: &[(String, String)], path: &Path) -> Result<multipart::Form> {
    let mut form = multipart::Form::new();
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }

    let file = File::open(path).await?;
    let length = file.metadata().await?.len();
    let stream = FramedRead::new(file, BytesCodec::new());
    let body = Body::wrap_stream(stream);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let part = multipart::Part::stream_with_length(body, length)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;
    Ok(form.part("file", part))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self.execute(&request, true).await?;

        let status = response.status().as_u16();
        let mut api_response = ApiResponse::new(status, bytes::Bytes::new());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                api_response = api_response.with_header(name.as_str(), value);
            }
        }
        api_response.body = response.bytes().await?;
        Ok(api_response)
    }

    async fn stream(&self, request: ApiRequest, path: &Path) -> Result<()> {
        let response = self.execute(&request, false).await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await?;
            return Err(ProKnowError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut file = File::create(path).await?;
        let mut written = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!("Wrote {} bytes to {}", written, path.display());
        Ok(())
    }
}
