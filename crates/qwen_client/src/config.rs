use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_OAUTH_BASE: &str = "https://chat.qwen.ai";
pub const DEFAULT_API_BASE: &str = "https://portal.qwen.ai/v1";
pub const DEFAULT_WEB_BASE: &str = "https://chat.qwen.ai";
pub const DEFAULT_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
pub const DEFAULT_SCOPE: &str = "openid profile email model.completion";

/// Which wire dialect the chat controller speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// OpenAI-compatible `/chat/completions` on the portal API.
    #[default]
    Portal,
    /// Threaded web chat API with parent-message chaining.
    WebChat,
}

impl ProfileKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "portal" | "openai" | "openai_compat" => Some(ProfileKind::Portal),
            "web" | "web_chat" | "webchat" => Some(ProfileKind::WebChat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub profile: ProfileKind,
    pub oauth_base: String,
    pub api_base: String,
    pub web_base: String,
    pub client_id: String,
    pub scope: String,
    pub model: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Upper bound on device-code token polls; unbounded when `None`.
    pub max_poll_attempts: Option<u32>,
    /// Drop a replayed first text delta (web chat profile only).
    pub legacy_duplicate_first_chunk: bool,
    /// Cookies sent next to `token` on web chat requests.
    pub web_cookie_extras: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: ProfileKind::Portal,
            oauth_base: DEFAULT_OAUTH_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            web_base: DEFAULT_WEB_BASE.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            model: None,
            http_proxy: None,
            https_proxy: None,
            max_poll_attempts: None,
            legacy_duplicate_first_chunk: false,
            web_cookie_extras: BTreeMap::new(),
        }
    }
}

pub(crate) fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl ClientConfig {
    /// Built-in defaults overridden by process environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(profile) = lookup("QWEN_PROFILE") {
            match ProfileKind::parse(&profile) {
                Some(kind) => self.profile = kind,
                None => log::warn!("Ignoring unknown QWEN_PROFILE value: {}", profile),
            }
        }
        if let Some(model) = lookup("QWEN_MODEL") {
            self.model = Some(model);
        }
        if let Some(api_base) = lookup("QWEN_API_BASE") {
            self.api_base = api_base;
        }
        if let Some(web_base) = lookup("QWEN_WEB_BASE") {
            self.web_base = web_base;
        }
        if let Some(oauth_base) = lookup("QWEN_OAUTH_BASE") {
            self.oauth_base = oauth_base;
        }
        if let Some(client_id) = lookup("QWEN_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(attempts) = lookup("QWEN_MAX_POLL_ATTEMPTS") {
            match attempts.trim().parse::<u32>() {
                Ok(value) => self.max_poll_attempts = Some(value),
                Err(_) => log::warn!("Ignoring invalid QWEN_MAX_POLL_ATTEMPTS: {}", attempts),
            }
        }
        if let Some(quirk) = lookup("QWEN_LEGACY_DUPLICATE_CHUNK") {
            self.legacy_duplicate_first_chunk = parse_bool_env(&quirk);
        }
        if let Some(http_proxy) = lookup("HTTP_PROXY") {
            self.http_proxy = Some(http_proxy);
        }
        if let Some(https_proxy) = lookup("HTTPS_PROXY") {
            self.https_proxy = Some(https_proxy);
        }
    }

    pub fn device_code_url(&self) -> String {
        format!(
            "{}/api/v1/oauth2/device/code",
            self.oauth_base.trim_end_matches('/')
        )
    }

    pub fn token_url(&self) -> String {
        format!("{}/api/v1/oauth2/token", self.oauth_base.trim_end_matches('/'))
    }
}
