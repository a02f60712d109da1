//! Client for the Qwen chat service.
//!
//! Authenticates with the OAuth2 device-code flow (PKCE), keeps a refreshable
//! token lease, and streams chat replies decoded from `data: ` event frames.
//!
//! ```no_run
//! use qwen_client::{ClientConfig, QwenClient};
//!
//! # async fn run() -> qwen_client::Result<()> {
//! let client = QwenClient::new(ClientConfig::from_env())?;
//! client
//!     .authenticate(|code| {
//!         println!("Open {} and enter {}", code.verification_url, code.user_code);
//!     })
//!     .await?;
//! let answer = client.ask("Hello").await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use auth::{
    build_cookie_string, extract_token, AuthorizationPhase, PkcePair, TokenLease, UserVerification,
};
pub use client::{ChatReply, ChatSession, ChatStream, QwenClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{ChatCompletion, Usage};
pub use config::{ClientConfig, ProfileKind};
pub use error::{QwenError, Result};
pub use events::{ChatOutput, StreamEvent, ToolCall, ToolCallAccumulator, ToolCallDelta};
pub use message::{ChatMessage, ContentPart, MessageContent, Role, SendOptions, ToolDefinition};
pub use protocol::{OpenAiCompatProfile, ProtocolProfile, WebChatProfile};
pub use stream::{DecoderOptions, FrameClassifier, StreamDecoder};
pub use transport::{Credential, ReqwestTransport, Transport};
