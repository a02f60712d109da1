//! Threaded web chat API (`/api/v2`).
//!
//! Threads live on the server. Each exchange names the message it follows
//! with `parent_id`; the server reports the new message id in a
//! `response.created` frame, and ends the stream with `delta.status ==
//! "finished"`. History is kept server-side, so `SendOptions::messages` and
//! `SendOptions::system` are not sent. The session JWT travels as the
//! `token` cookie rather than a bearer header.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::auth::build_cookie_string;
use crate::config::ProfileKind;
use crate::error::{QwenError, Result};
use crate::stream::{DecoderOptions, FrameClassifier};
use crate::transport::Credential;

use super::{unix_millis, ChunkClassifier, ProtocolProfile, RequestSpec, Turn};

pub const DEFAULT_WEB_MODEL: &str = "qwen3-max";

const CONTINUITY_KEY: &str = "response.created";
const FINISHED_STATUS: &str = "finished";
const CHAT_TYPE: &str = "t2t";
const CHAT_MODE: &str = "normal";

#[derive(Debug, Deserialize)]
struct NewChatResponse {
    #[serde(default)]
    success: Option<bool>,
    data: Option<NewChatData>,
}

#[derive(Debug, Deserialize)]
struct NewChatData {
    id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebChatProfile {
    web_base: String,
    legacy_duplicate_first_chunk: bool,
    cookie_extras: Vec<(String, String)>,
}

impl WebChatProfile {
    pub fn new(web_base: impl Into<String>) -> Self {
        Self {
            web_base: web_base.into(),
            legacy_duplicate_first_chunk: false,
            cookie_extras: Vec::new(),
        }
    }

    /// Cookies sent alongside `token`, in order.
    pub fn with_cookie_extras(mut self, extras: Vec<(String, String)>) -> Self {
        self.cookie_extras = extras;
        self
    }

    /// Drop a replayed first text delta, as older deployments of this API
    /// sent the opening chunk twice.
    pub fn with_legacy_duplicate_first_chunk(mut self, enabled: bool) -> Self {
        self.legacy_duplicate_first_chunk = enabled;
        self
    }

    fn base(&self) -> &str {
        self.web_base.trim_end_matches('/')
    }

    pub fn new_chat_url(&self) -> String {
        format!("{}/api/v2/chats/new", self.base())
    }

    pub fn chat_url(&self, thread_id: &str) -> String {
        let raw = format!("{}/api/v2/chat/completions", self.base());
        match Url::parse_with_params(&raw, &[("chat_id", thread_id)]) {
            Ok(url) => url.to_string(),
            Err(e) => {
                debug!("Could not build chat URL from {}: {}", raw, e);
                format!("{}?chat_id={}", raw, thread_id)
            }
        }
    }
}

/// Body for one user message in an existing thread.
pub fn build_chat_body(turn: &Turn<'_>) -> Value {
    let timestamp = unix_millis(turn.now);
    let parent_id = turn.parent_message_id;
    let thinking = turn.options.thinking.unwrap_or(false);

    let message = json!({
        "fid": Uuid::new_v4().to_string(),
        "parentId": parent_id,
        "childrenIds": [],
        "role": "user",
        "content": turn.content,
        "user_action": "chat",
        "files": [],
        "timestamp": timestamp,
        "models": [turn.model],
        "chat_type": CHAT_TYPE,
        "feature_config": {
            "thinking_enabled": thinking,
            "output_schema": "phase",
        },
        "extra": {"meta": {"subChatType": CHAT_TYPE}},
        "sub_chat_type": CHAT_TYPE,
        "parent_id": parent_id,
    });

    let mut body = json!({
        "stream": true,
        "incremental_output": true,
        "chat_id": turn.thread_id,
        "chat_mode": CHAT_MODE,
        "model": turn.model,
        "parent_id": parent_id,
        "messages": [message],
        "timestamp": timestamp,
    });

    if !turn.options.tools.is_empty() {
        body["tools"] = Value::Array(turn.options.tools.iter().map(|t| t.to_json()).collect());
    }
    if let Some(tool_choice) = &turn.options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }

    body
}

impl ProtocolProfile for WebChatProfile {
    fn kind(&self) -> ProfileKind {
        ProfileKind::WebChat
    }

    fn default_model(&self) -> &str {
        DEFAULT_WEB_MODEL
    }

    fn thread_request(&self, model: &str, now: DateTime<Utc>) -> Option<RequestSpec> {
        Some(RequestSpec {
            url: self.new_chat_url(),
            headers: Vec::new(),
            body: json!({
                "title": "New Chat",
                "models": [model],
                "chat_mode": CHAT_MODE,
                "chat_type": CHAT_TYPE,
                "timestamp": unix_millis(now),
            }),
        })
    }

    fn thread_id(&self, created: Option<&[u8]>) -> Result<String> {
        let body = created.unwrap_or_default();
        let malformed = || QwenError::ThreadCreationFailed {
            status: 200,
            body: String::from_utf8_lossy(body).into_owned(),
        };

        let response: NewChatResponse = serde_json::from_slice(body).map_err(|_| malformed())?;
        if response.success == Some(false) {
            return Err(malformed());
        }
        response
            .data
            .and_then(|data| data.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(malformed)
    }

    fn credential(&self, access_token: &str) -> Credential {
        Credential::Cookie(build_cookie_string(access_token, &self.cookie_extras))
    }

    fn chat_request(&self, turn: &Turn<'_>) -> RequestSpec {
        RequestSpec {
            url: self.chat_url(turn.thread_id),
            headers: vec![
                ("Accept".to_string(), "text/event-stream".to_string()),
                ("x-accel-buffering".to_string(), "no".to_string()),
            ],
            body: build_chat_body(turn),
        }
    }

    fn classifier(&self) -> Arc<dyn FrameClassifier> {
        Arc::new(ChunkClassifier {
            continuity_key: Some(CONTINUITY_KEY),
            terminal_status: Some(FINISHED_STATUS),
        })
    }

    fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            suppress_duplicate_first_delta: self.legacy_duplicate_first_chunk,
        }
    }
}
