//! OpenAI-compatible `/chat/completions` on the portal API.
//!
//! There are no server-side threads: the controller mints a local id and the
//! caller carries history in `SendOptions::messages`. The stream ends only on
//! `data: [DONE]`. The same endpoint also answers buffered (`stream: false`)
//! completions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::ProfileKind;
use crate::error::Result;
use crate::message::ChatMessage;
use crate::stream::{DecoderOptions, FrameClassifier};

use super::{ChunkClassifier, ProtocolProfile, RequestSpec, Turn};

pub const DEFAULT_PORTAL_MODEL: &str = "coder-model";

#[derive(Debug, Clone)]
pub struct OpenAiCompatProfile {
    api_base: String,
}

impl OpenAiCompatProfile {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// Streaming chat-completions body for one turn.
pub fn build_chat_body(turn: &Turn<'_>) -> Value {
    let options = turn.options;

    let mut messages: Vec<Value> = Vec::with_capacity(options.messages.len() + 2);
    if let Some(system) = options.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(system).to_openai_json());
    }
    messages.extend(options.messages.iter().map(ChatMessage::to_openai_json));
    messages.push(ChatMessage::user(turn.content).to_openai_json());

    let mut body = json!({
        "model": turn.model,
        "messages": messages,
        "stream": true,
    });

    if !options.tools.is_empty() {
        body["tools"] = Value::Array(options.tools.iter().map(|t| t.to_json()).collect());
    }
    if let Some(tool_choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(thinking) = options.thinking {
        body["enable_thinking"] = json!(thinking);
    }

    body
}

/// Same body as [`build_chat_body`] with `stream: false`.
pub fn build_completion_body(turn: &Turn<'_>) -> Value {
    let mut body = build_chat_body(turn);
    body["stream"] = json!(false);
    body
}

impl ProtocolProfile for OpenAiCompatProfile {
    fn kind(&self) -> ProfileKind {
        ProfileKind::Portal
    }

    fn default_model(&self) -> &str {
        DEFAULT_PORTAL_MODEL
    }

    fn thread_request(&self, _model: &str, _now: DateTime<Utc>) -> Option<RequestSpec> {
        None
    }

    fn thread_id(&self, _created: Option<&[u8]>) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    fn chat_request(&self, turn: &Turn<'_>) -> RequestSpec {
        RequestSpec {
            url: self.chat_url(),
            headers: vec![("Accept".to_string(), "text/event-stream".to_string())],
            body: build_chat_body(turn),
        }
    }

    fn completion_request(&self, turn: &Turn<'_>) -> Option<RequestSpec> {
        Some(RequestSpec {
            url: self.chat_url(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: build_completion_body(turn),
        })
    }

    fn classifier(&self) -> Arc<dyn FrameClassifier> {
        Arc::new(ChunkClassifier::default())
    }

    fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SendOptions, ToolDefinition};

    fn turn<'a>(options: &'a SendOptions) -> Turn<'a> {
        Turn {
            content: "What's the weather?",
            model: "coder-model",
            thread_id: "local-thread",
            parent_message_id: None,
            options,
            now: Utc::now(),
        }
    }

    #[test]
    fn minimal_body() {
        let options = SendOptions::default();
        let body = build_chat_body(&turn(&options));

        assert_eq!(body["model"], "coder-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("tools").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body.get("enable_thinking").is_none());
    }

    #[test]
    fn full_body_orders_system_history_then_user() {
        let options = SendOptions {
            system: Some("Be brief.".to_string()),
            messages: vec![
                ChatMessage::user("Earlier question"),
                ChatMessage::assistant("Earlier answer"),
            ],
            tools: vec![ToolDefinition::new(
                "get_weather",
                "Current weather",
                json!({"type": "object"}),
            )],
            tool_choice: Some(json!("auto")),
            thinking: Some(false),
            temperature: Some(0.5),
            ..SendOptions::default()
        };
        let body = build_chat_body(&turn(&options));

        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(body["messages"][3]["content"], "What's the weather?");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["enable_thinking"], false);
    }

    #[test]
    fn portal_has_no_server_threads() {
        let profile = OpenAiCompatProfile::new("https://portal.qwen.ai/v1/");
        assert!(profile.thread_request("coder-model", Utc::now()).is_none());
        assert_eq!(profile.chat_url(), "https://portal.qwen.ai/v1/chat/completions");
        assert!(!profile.decoder_options().suppress_duplicate_first_delta);
    }

    #[test]
    fn bearer_credential_and_buffered_completion() {
        let profile = OpenAiCompatProfile::new("https://portal.qwen.ai/v1");
        assert_eq!(
            profile.credential("tok"),
            crate::transport::Credential::Bearer("tok".to_string())
        );

        let options = SendOptions {
            temperature: Some(0.5),
            ..SendOptions::default()
        };
        let request = profile.completion_request(&turn(&options)).unwrap();
        assert_eq!(request.url, "https://portal.qwen.ai/v1/chat/completions");
        assert_eq!(request.body["stream"], false);
        assert_eq!(request.body["temperature"], 0.5);
        assert_eq!(request.body["messages"][0]["content"], "What's the weather?");
    }
}
