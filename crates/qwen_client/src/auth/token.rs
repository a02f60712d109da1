use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{QwenError, Result};
use crate::transport::Transport;

use super::OAuthEndpoints;

/// Lifetime assumed for tokens supplied out-of-band, where the issuer's
/// `expires_in` is unknown.
pub const DEFAULT_LEASE_LIFETIME: Duration = Duration::from_secs(6 * 60 * 60);

/// A lease is treated as expired this long before `expires_at`.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Token endpoint success payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLease {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// `at + duration`, saturating at the latest representable instant.
fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl TokenLease {
    /// Build a lease from an issuance response received at `now`.
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LEASE_LIFETIME);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            expires_at: saturating_add(now, lifetime),
        }
    }

    pub fn with_default_lifetime(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at: saturating_add(now, DEFAULT_LEASE_LIFETIME),
        }
    }

    /// `now >= expires_at - 60s`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(EXPIRY_MARGIN)
            .ok()
            .and_then(|margin| self.expires_at.checked_sub_signed(margin))
            .map_or(true, |threshold| now >= threshold)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Owns the current [`TokenLease`] and renews it on demand.
pub struct TokenLeaseManager {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    endpoints: OAuthEndpoints,
    lease: Mutex<Option<TokenLease>>,
}

impl TokenLeaseManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            transport,
            clock,
            endpoints,
            lease: Mutex::new(None),
        }
    }

    pub async fn lease(&self) -> Option<TokenLease> {
        self.lease.lock().await.clone()
    }

    pub async fn set_lease(&self, lease: Option<TokenLease>) {
        *self.lease.lock().await = lease;
    }

    /// Install tokens obtained out-of-band with [`DEFAULT_LEASE_LIFETIME`].
    pub async fn set_tokens(&self, access_token: impl Into<String>, refresh_token: Option<String>) {
        let lease =
            TokenLease::with_default_lifetime(access_token, refresh_token, self.clock.now());
        self.set_lease(Some(lease)).await;
    }

    pub async fn clear(&self) {
        self.set_lease(None).await;
    }

    /// Return a usable access token, refreshing first when the lease is inside
    /// the expiry margin and a refresh token exists.
    ///
    /// The lease lock is held across the refresh so concurrent callers on the
    /// same manager observe a single renewal.
    pub async fn ensure_valid(&self) -> Result<String> {
        let mut guard = self.lease.lock().await;
        let lease = guard.as_mut().ok_or(QwenError::Unauthenticated)?;

        let now = self.clock.now();
        if !lease.is_expired(now) {
            return Ok(lease.access_token.clone());
        }

        let Some(refresh_token) = lease.refresh_token.clone() else {
            warn!("Access token expired and no refresh token is available");
            return Ok(lease.access_token.clone());
        };

        debug!("Access token expires at {}, refreshing", lease.expires_at);
        let response = self.refresh(&refresh_token).await?;
        let mut renewed = TokenLease::from_response(response, self.clock.now());
        if renewed.refresh_token.is_none() {
            renewed.refresh_token = Some(refresh_token);
        }
        info!("Access token refreshed, valid until {}", renewed.expires_at);

        let access_token = renewed.access_token.clone();
        *lease = renewed;
        Ok(access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.endpoints.client_id.as_str()),
        ];
        let response = self
            .transport
            .post_form(&self.endpoints.token_url, &form)
            .await?;

        if !response.is_success() {
            return Err(QwenError::TokenRefreshFailed {
                status: response.status,
                body: response.text(),
            });
        }

        Ok(serde_json::from_slice::<TokenResponse>(&response.body)?)
    }
}

impl std::fmt::Debug for TokenLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLeaseManager")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}
