use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::clock::Clock;
use crate::error::{QwenError, Result};
use crate::transport::Transport;

use super::pkce::{PkcePair, CHALLENGE_METHOD};
use super::token::{TokenLease, TokenResponse};
use super::OAuthEndpoints;

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;
const SLOW_DOWN_INCREMENT_SECS: f64 = 1.0;
/// Longest wait between polls, whatever the server asks for.
pub const MAX_POLL_INTERVAL_SECS: f64 = 300.0;

fn clamp_interval(secs: f64) -> f64 {
    secs.min(MAX_POLL_INTERVAL_SECS)
}

/// Device code response from the authorization server
#[derive(Debug, Deserialize)]
pub(crate) struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub interval: Option<f64>,
}

/// Token endpoint reply while polling; either a token or an OAuth error code.
#[derive(Debug, Deserialize)]
pub(crate) struct PollResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub token_type: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

enum PollOutcome {
    Issued(TokenResponse),
    Pending,
    SlowDown,
    Denied(String),
    Expired,
    Unrecognized(String),
}

impl PollOutcome {
    fn from_body(body: &[u8]) -> Self {
        let raw = || String::from_utf8_lossy(body).into_owned();
        let Ok(response) = serde_json::from_slice::<PollResponse>(body) else {
            return PollOutcome::Unrecognized(raw());
        };

        if let Some(access_token) = response.access_token.filter(|t| !t.is_empty()) {
            return PollOutcome::Issued(TokenResponse {
                access_token,
                refresh_token: response.refresh_token,
                expires_in: response.expires_in,
                token_type: response.token_type,
            });
        }

        match response.error.as_deref() {
            Some("authorization_pending") => PollOutcome::Pending,
            Some("slow_down") => PollOutcome::SlowDown,
            Some("access_denied") => PollOutcome::Denied(
                response
                    .error_description
                    .unwrap_or_else(|| "access_denied".to_string()),
            ),
            Some("expired_token") => PollOutcome::Expired,
            _ => PollOutcome::Unrecognized(raw()),
        }
    }
}

/// What the user needs in order to approve the login on another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserVerification {
    pub verification_url: String,
    pub user_code: String,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationPhase {
    Idle,
    AwaitingUserAction,
    Polling,
    Authorized,
    Denied,
    Expired,
    TimedOut,
    Failed,
}

#[derive(Debug)]
struct PendingAuthorization {
    device_code: String,
    verifier: String,
    poll_interval_secs: f64,
}

/// Drives device-code request, token polling and the resulting phase.
pub struct DeviceAuthorizer {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    endpoints: OAuthEndpoints,
    max_attempts: Option<u32>,
    phase: AuthorizationPhase,
    pending: Option<PendingAuthorization>,
}

impl DeviceAuthorizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            transport,
            clock,
            endpoints,
            max_attempts: None,
            phase: AuthorizationPhase::Idle,
            pending: None,
        }
    }

    /// Cap the number of token polls; unbounded by default.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn phase(&self) -> AuthorizationPhase {
        self.phase
    }

    /// Drop any pending authorization and return to `Idle`.
    pub fn abandon(&mut self) {
        if self.pending.take().is_some() {
            debug!("Abandoned pending device authorization");
        }
        self.phase = AuthorizationPhase::Idle;
    }

    /// Request a device code and remember what polling will need.
    pub async fn login(&mut self) -> Result<UserVerification> {
        let pkce = PkcePair::generate()?;
        let form = [
            ("client_id", self.endpoints.client_id.as_str()),
            ("scope", self.endpoints.scope.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", CHALLENGE_METHOD),
        ];

        let response = self
            .transport
            .post_form(&self.endpoints.device_code_url, &form)
            .await?;
        if !response.is_success() {
            return Err(QwenError::DeviceCodeRequestFailed {
                status: response.status,
                body: response.text(),
            });
        }

        let device: DeviceCodeResponse = serde_json::from_slice(&response.body)?;
        let poll_interval_secs = device
            .interval
            .filter(|i| i.is_finite() && *i >= 0.0)
            .map(clamp_interval)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        info!(
            "Device code issued, user code {} (poll every {}s)",
            device.user_code, poll_interval_secs
        );

        self.pending = Some(PendingAuthorization {
            device_code: device.device_code,
            verifier: pkce.verifier,
            poll_interval_secs,
        });
        self.phase = AuthorizationPhase::AwaitingUserAction;

        Ok(UserVerification {
            verification_url: device
                .verification_uri_complete
                .filter(|u| !u.is_empty())
                .unwrap_or(device.verification_uri),
            user_code: device.user_code,
            expires_in: device.expires_in,
        })
    }

    /// Poll the token endpoint until the user approves, denies, or the code
    /// expires.
    pub async fn wait_for_authorization(&mut self) -> Result<TokenLease> {
        let Some(pending) = self.pending.take() else {
            return Err(QwenError::NotStarted);
        };
        self.phase = AuthorizationPhase::Polling;

        let result = self.poll(pending).await;
        self.phase = match &result {
            Ok(_) => AuthorizationPhase::Authorized,
            Err(QwenError::AuthorizationDenied { .. }) => AuthorizationPhase::Denied,
            Err(QwenError::DeviceCodeExpired) => AuthorizationPhase::Expired,
            Err(QwenError::AuthorizationTimeout { .. }) => AuthorizationPhase::TimedOut,
            Err(_) => AuthorizationPhase::Failed,
        };
        result
    }

    async fn poll(&self, mut pending: PendingAuthorization) -> Result<TokenLease> {
        let mut attempts: u32 = 0;
        if self.max_attempts == Some(0) {
            return Err(QwenError::AuthorizationTimeout { attempts });
        }

        loop {
            attempts += 1;

            let form = [
                ("grant_type", DEVICE_CODE_GRANT_TYPE),
                ("client_id", self.endpoints.client_id.as_str()),
                ("device_code", pending.device_code.as_str()),
                ("code_verifier", pending.verifier.as_str()),
            ];
            let response = self
                .transport
                .post_form(&self.endpoints.token_url, &form)
                .await?;

            match PollOutcome::from_body(&response.body) {
                PollOutcome::Issued(token) => {
                    info!("Device authorization granted after {} polls", attempts);
                    return Ok(TokenLease::from_response(token, self.clock.now()));
                }
                PollOutcome::Pending => {
                    debug!("Authorization pending (poll {})", attempts);
                }
                PollOutcome::SlowDown => {
                    pending.poll_interval_secs =
                        clamp_interval(pending.poll_interval_secs + SLOW_DOWN_INCREMENT_SECS);
                    debug!(
                        "Server requested slower polling, interval now {}s",
                        pending.poll_interval_secs
                    );
                }
                PollOutcome::Denied(description) => {
                    return Err(QwenError::AuthorizationDenied { description });
                }
                PollOutcome::Expired => return Err(QwenError::DeviceCodeExpired),
                PollOutcome::Unrecognized(raw) => {
                    return Err(QwenError::AuthorizationProtocolError { raw });
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                warn!("Device authorization gave up after {} polls", attempts);
                return Err(QwenError::AuthorizationTimeout { attempts });
            }

            self.clock
                .sleep(Duration::from_secs_f64(pending.poll_interval_secs))
                .await;
        }
    }
}

impl std::fmt::Debug for DeviceAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorizer")
            .field("endpoints", &self.endpoints)
            .field("max_attempts", &self.max_attempts)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
