//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use qwen_client::config::{ClientConfig, ProfileKind};
use qwen_client::error::{QwenError, Result};
use qwen_client::transport::{
    ByteStream, HttpResponse, JsonRequest, ReqwestTransport, StreamingResponse, Transport,
};
use serde_json::Value;

/// Transport for a local mock server, bypassing any proxy settings.
pub fn http_transport() -> Arc<ReqwestTransport> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("Failed to build HTTP client");
    Arc::new(ReqwestTransport::with_client(client))
}

/// Every endpoint pointed at `base`.
pub fn config_for(base: &str, profile: ProfileKind) -> ClientConfig {
    ClientConfig {
        profile,
        oauth_base: base.to_string(),
        api_base: format!("{base}/v1"),
        web_base: base.to_string(),
        ..ClientConfig::default()
    }
}

/// `data: <frame>\n\n` for each frame.
pub fn sse_body(frames: &[Value]) -> String {
    frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n"))
        .collect()
}

pub fn text_frame(content: &str) -> Value {
    serde_json::json!({"choices": [{"delta": {"content": content}}]})
}

/// Decode a form-encoded request body into pairs.
pub fn form_pairs(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

pub fn form_value(body: &[u8], key: &str) -> Option<String> {
    form_pairs(body)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

pub enum ScriptedReply {
    Form(HttpResponse),
    Chunks { status: u16, chunks: Vec<Vec<u8>> },
    /// Chunks followed by a body that never ends; `dropped` flips once the
    /// body is released.
    Hanging {
        chunks: Vec<Vec<u8>>,
        dropped: Arc<AtomicBool>,
    },
    NoBody { status: u16 },
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// In-memory transport replaying queued replies and recording requests.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    form_calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    json_calls: Mutex<Vec<JsonRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    pub fn form_calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.form_calls.lock().unwrap().clone()
    }

    pub fn json_calls(&self) -> Vec<JsonRequest> {
        self.json_calls.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<ScriptedReply> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| QwenError::Transport("no scripted reply left".to_string()))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse> {
        self.form_calls.lock().unwrap().push((
            url.to_string(),
            form.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        match self.next_reply()? {
            ScriptedReply::Form(response) => Ok(response),
            _ => Err(QwenError::Transport("expected a form reply".to_string())),
        }
    }

    async fn post_json(&self, request: JsonRequest) -> Result<StreamingResponse> {
        self.json_calls.lock().unwrap().push(request);
        match self.next_reply()? {
            ScriptedReply::Chunks { status, chunks } => {
                let body: ByteStream = Box::pin(futures::stream::iter(
                    chunks.into_iter().map(|c| Ok(Bytes::from(c))),
                ));
                Ok(StreamingResponse {
                    status,
                    body: Some(body),
                })
            }
            ScriptedReply::Hanging { chunks, dropped } => {
                let flag = DropFlag(dropped);
                let body: ByteStream = Box::pin(
                    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
                        .chain(futures::stream::pending())
                        .map(move |chunk| {
                            let _held = &flag;
                            chunk
                        }),
                );
                Ok(StreamingResponse {
                    status: 200,
                    body: Some(body),
                })
            }
            ScriptedReply::NoBody { status } => Ok(StreamingResponse { status, body: None }),
            ScriptedReply::Form(_) => Err(QwenError::Transport("expected a JSON reply".to_string())),
        }
    }
}

pub fn form_reply(status: u16, body: &str) -> ScriptedReply {
    ScriptedReply::Form(HttpResponse {
        status,
        body: Bytes::from(body.to_string()),
    })
}
