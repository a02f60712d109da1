//! Wire dialects the chat controller can speak.
//!
//! A profile builds the outbound requests and supplies the frame classifier
//! for the response stream. Both profiles share the classification order in
//! [`ChunkClassifier`]; they differ in field names and terminal markers.

pub mod openai_compat;
pub mod web_chat;

pub use openai_compat::OpenAiCompatProfile;
pub use web_chat::WebChatProfile;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{ClientConfig, ProfileKind};
use crate::error::Result;
use crate::events::{StreamEvent, ToolCallDelta};
use crate::message::SendOptions;
use crate::stream::{DecoderOptions, FrameClassifier};
use crate::transport::{Credential, JsonRequest};

/// Unauthenticated request description produced by a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl RequestSpec {
    pub fn authorized(self, credential: Credential) -> JsonRequest {
        JsonRequest {
            url: self.url,
            credential,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Everything a profile needs to compose one chat request.
#[derive(Debug, Clone, Copy)]
pub struct Turn<'a> {
    pub content: &'a str,
    pub model: &'a str,
    pub thread_id: &'a str,
    pub parent_message_id: Option<&'a str>,
    pub options: &'a SendOptions,
    pub now: DateTime<Utc>,
}

pub trait ProtocolProfile: Send + Sync {
    fn kind(&self) -> ProfileKind;

    fn default_model(&self) -> &str;

    /// Request that opens a server-side thread, or `None` when threads are
    /// identified locally.
    fn thread_request(&self, model: &str, now: DateTime<Utc>) -> Option<RequestSpec>;

    /// Id for a new session. `created` is the successful thread-creation
    /// body when [`ProtocolProfile::thread_request`] produced a request.
    fn thread_id(&self, created: Option<&[u8]>) -> Result<String>;

    /// How the access token is attached to thread and chat requests.
    fn credential(&self, access_token: &str) -> Credential {
        Credential::Bearer(access_token.to_string())
    }

    fn chat_request(&self, turn: &Turn<'_>) -> RequestSpec;

    /// Non-streaming completion for one turn, when the dialect has one.
    fn completion_request(&self, _turn: &Turn<'_>) -> Option<RequestSpec> {
        None
    }

    fn classifier(&self) -> Arc<dyn FrameClassifier>;

    fn decoder_options(&self) -> DecoderOptions;
}

/// Profile selected by `config.profile`.
pub fn profile_for(config: &ClientConfig) -> Arc<dyn ProtocolProfile> {
    match config.profile {
        ProfileKind::Portal => Arc::new(OpenAiCompatProfile::new(config.api_base.clone())),
        ProfileKind::WebChat => Arc::new(
            WebChatProfile::new(config.web_base.clone())
                .with_legacy_duplicate_first_chunk(config.legacy_duplicate_first_chunk)
                .with_cookie_extras(
                    config
                        .web_cookie_extras
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                ),
        ),
    }
}

pub(crate) fn unix_millis(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}

// --- Stream frame shapes ---

#[derive(Debug, Default, Deserialize)]
struct ChunkFrame {
    #[serde(default)]
    choices: Vec<ChoiceFrame>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceFrame {
    #[serde(default)]
    delta: DeltaFrame,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaFrame {
    content: Option<String>,
    status: Option<String>,
    tool_calls: Option<Vec<ToolCallFrame>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFrame {
    index: Option<u32>,
    id: Option<String>,
    function: Option<FunctionFrame>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFrame {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContinuityFrame {
    chat_id: Option<String>,
    parent_id: Option<String>,
    response_id: Option<String>,
}

/// Shared classification: continuity payload first, then the first choice's
/// delta (terminal status, tool-call fragments, text).
#[derive(Debug, Clone, Default)]
pub struct ChunkClassifier {
    /// Top-level key carrying thread continuity metadata.
    pub continuity_key: Option<&'static str>,
    /// `delta.status` value that ends the stream.
    pub terminal_status: Option<&'static str>,
}

impl ChunkClassifier {
    fn continuity(&self, frame: &Value) -> Option<StreamEvent> {
        let payload = frame.get(self.continuity_key?)?;
        let continuity: ContinuityFrame = match serde_json::from_value(payload.clone()) {
            Ok(continuity) => continuity,
            Err(e) => {
                debug!("Ignoring malformed continuity frame: {}", e);
                return None;
            }
        };
        Some(StreamEvent::ThreadCreated {
            thread_id: continuity.chat_id,
            parent_message_id: continuity.response_id.or(continuity.parent_id),
        })
    }
}

impl FrameClassifier for ChunkClassifier {
    fn classify(&self, frame: Value) -> Vec<StreamEvent> {
        if let Some(event) = self.continuity(&frame) {
            return vec![event];
        }

        let chunk: ChunkFrame = match serde_json::from_value(frame) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Ignoring unrecognized stream frame: {}", e);
                return Vec::new();
            }
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Vec::new();
        };
        let delta = choice.delta;

        if let (Some(terminal), Some(status)) = (self.terminal_status, delta.status.as_deref()) {
            if status == terminal {
                return vec![StreamEvent::Terminal];
            }
        }

        if let Some(tool_calls) = delta.tool_calls.filter(|calls| !calls.is_empty()) {
            return tool_calls
                .into_iter()
                .enumerate()
                .map(|(position, call)| {
                    let function = call.function.unwrap_or_default();
                    StreamEvent::ToolCallDelta(ToolCallDelta {
                        index: call.index.unwrap_or(position as u32),
                        id: call.id,
                        name: function.name,
                        arguments: function.arguments.unwrap_or_default(),
                    })
                })
                .collect();
        }

        match delta.content {
            Some(content) if !content.is_empty() => vec![StreamEvent::TextDelta { content }],
            _ => Vec::new(),
        }
    }
}
