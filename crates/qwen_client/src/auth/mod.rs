//! OAuth2 device-code authorization and token lease management.

pub mod cookie;
pub mod device_code;
pub mod pkce;
pub mod token;

pub use cookie::{build_cookie_string, extract_token};
pub use device_code::{AuthorizationPhase, DeviceAuthorizer, UserVerification};
pub use pkce::PkcePair;
pub use token::{TokenLease, TokenLeaseManager, TokenResponse};

use crate::config::ClientConfig;

/// Where and as whom the OAuth endpoints are called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub device_code_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scope: String,
}

impl OAuthEndpoints {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            device_code_url: config.device_code_url(),
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
        }
    }
}
