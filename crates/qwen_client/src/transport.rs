//! HTTP seam between the client core and the network.
//!
//! The core only needs a status code and a body, either buffered (auth
//! endpoints) or read incrementally (chat endpoint).

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::error;
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::{Client, Proxy};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{QwenError, Result};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const CLIENT_USER_AGENT: &str = concat!("qwen-client/", env!("CARGO_PKG_VERSION"));

/// Fully buffered response from a form-encoded POST.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// How the access token is presented to the chat service.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// A complete `Cookie` header value, e.g. `token=<jwt>; ssxmod_itna=...`.
    Cookie(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
            Credential::Cookie(_) => f.write_str("Cookie(***)"),
        }
    }
}

/// Authenticated JSON POST.
#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub url: String,
    pub credential: Credential,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Response whose body is read as it arrives.
pub struct StreamingResponse {
    pub status: u16,
    pub body: Option<ByteStream>,
}

impl StreamingResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body into memory. A missing body reads as empty.
    pub async fn collect(self) -> Result<Bytes> {
        let Some(mut body) = self.body else {
            return Ok(Bytes::new());
        };
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub async fn collect_text(self) -> Result<String> {
        let body = self.collect().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse>;

    async fn post_json(&self, request: JsonRequest) -> Result<StreamingResponse>;
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = Client::builder().user_agent(CLIENT_USER_AGENT);
        if let Some(http_proxy) = config.http_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(Proxy::http(http_proxy)?);
        }
        if let Some(https_proxy) = config.https_proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(Proxy::https(https_proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse> {
        let response = self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send form request to {}: {}", url, e);
                QwenError::Http(e)
            })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }

    async fn post_json(&self, request: JsonRequest) -> Result<StreamingResponse> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        builder = match &request.credential {
            Credential::Bearer(token) => builder.bearer_auth(token),
            Credential::Cookie(cookie) => builder.header(COOKIE, cookie.as_str()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            error!("Failed to send chat request to {}: {}", request.url, e);
            QwenError::Http(e)
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(QwenError::from));
        Ok(StreamingResponse {
            status,
            body: Some(Box::pin(body)),
        })
    }
}
