use thiserror::Error;

use crate::config::ProfileKind;

#[derive(Error, Debug)]
pub enum QwenError {
    #[error("Secure random source unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Device code request failed: HTTP {status} - {body}")]
    DeviceCodeRequestFailed { status: u16, body: String },

    #[error("Authorization denied: {description}")]
    AuthorizationDenied { description: String },

    #[error("Device code expired before authorization completed")]
    DeviceCodeExpired,

    #[error("Unexpected authorization response: {raw}")]
    AuthorizationProtocolError { raw: String },

    #[error("Authorization not completed after {attempts} polling attempts")]
    AuthorizationTimeout { attempts: u32 },

    #[error("Device authorization not started, call login() first")]
    NotStarted,

    #[error("Not authenticated, log in or set tokens first")]
    Unauthenticated,

    #[error("Token refresh failed: HTTP {status} - {body}")]
    TokenRefreshFailed { status: u16, body: String },

    #[error("Thread creation failed: HTTP {status} - {body}")]
    ThreadCreationFailed { status: u16, body: String },

    #[error("Chat request failed: HTTP {status} - {body}")]
    ChatRequestFailed { status: u16, body: String },

    #[error("The {0:?} profile has no non-streaming completion endpoint")]
    CompletionUnsupported(ProfileKind),

    #[error("Chat response has no body")]
    NoResponseBody,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl QwenError {
    /// True for failures a caller should answer by re-authenticating.
    ///
    /// An expired lease without a refresh token is not caught locally; it
    /// surfaces as the service's own 401 on the chat request.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            QwenError::Unauthenticated | QwenError::ChatRequestFailed { status: 401, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QwenError>;
