use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures::{Stream, StreamExt};
use log::{debug, info};
use tokio::sync::Mutex;

use crate::auth::{
    AuthorizationPhase, DeviceAuthorizer, OAuthEndpoints, TokenLease, TokenLeaseManager,
    UserVerification,
};
use crate::clock::{Clock, SystemClock};
use crate::completion::ChatCompletion;
use crate::config::ClientConfig;
use crate::error::{QwenError, Result};
use crate::events::{ChatOutput, StreamEvent, ToolCall, ToolCallAccumulator};
use crate::message::SendOptions;
use crate::protocol::{profile_for, ProtocolProfile, Turn};
use crate::stream::{decode_stream, StreamDecoder};
use crate::transport::{ReqwestTransport, Transport};

/// Lazily decoded reply to one [`QwenClient::send`] call.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatOutput>> + Send>>;

/// Server-side (or locally minted) thread the client is talking in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub thread_id: String,
    pub last_parent_message_id: Option<String>,
    pub model: String,
}

/// A fully drained exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// One conversation with the Qwen service.
///
/// Callers serialize `send` per instance; overlapping exchanges would race
/// on the session's parent message id.
pub struct QwenClient {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    profile: Arc<dyn ProtocolProfile>,
    tokens: TokenLeaseManager,
    authorizer: Mutex<DeviceAuthorizer>,
    session: Arc<Mutex<Option<ChatSession>>>,
    model: RwLock<String>,
}

impl QwenClient {
    /// Client over the network with the system clock.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::from_parts(&config, transport, Arc::new(SystemClock)))
    }

    pub fn from_parts(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let profile = profile_for(config);
        Self::with_profile(config, transport, clock, profile)
    }

    pub fn with_profile(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        profile: Arc<dyn ProtocolProfile>,
    ) -> Self {
        let endpoints = OAuthEndpoints::from_config(config);
        let model = config
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| profile.default_model().to_string());

        Self {
            tokens: TokenLeaseManager::new(
                Arc::clone(&transport),
                Arc::clone(&clock),
                endpoints.clone(),
            ),
            authorizer: Mutex::new(
                DeviceAuthorizer::new(Arc::clone(&transport), Arc::clone(&clock), endpoints)
                    .with_max_attempts(config.max_poll_attempts),
            ),
            transport,
            clock,
            profile,
            session: Arc::new(Mutex::new(None)),
            model: RwLock::new(model),
        }
    }

    // --- Authentication ---

    /// Start a device authorization and return what the user must enter.
    pub async fn login(&self) -> Result<UserVerification> {
        self.authorizer.lock().await.login().await
    }

    /// Poll until the pending authorization resolves; installs the issued lease.
    pub async fn wait_for_authorization(&self) -> Result<TokenLease> {
        let lease = self.authorizer.lock().await.wait_for_authorization().await?;
        self.tokens.set_lease(Some(lease.clone())).await;
        Ok(lease)
    }

    /// `login`, hand the code to `on_code` for display, then wait.
    pub async fn authenticate<F>(&self, on_code: F) -> Result<TokenLease>
    where
        F: FnOnce(&UserVerification) + Send,
    {
        let verification = self.login().await?;
        on_code(&verification);
        self.wait_for_authorization().await
    }

    pub async fn authorization_phase(&self) -> AuthorizationPhase {
        self.authorizer.lock().await.phase()
    }

    /// Forget the lease, the current thread and any pending authorization.
    pub async fn logout(&self) {
        self.authorizer.lock().await.abandon();
        self.tokens.clear().await;
        self.session.lock().await.take();
        info!("Logged out");
    }

    // --- Lease persistence hooks ---

    pub async fn token_lease(&self) -> Option<TokenLease> {
        self.tokens.lease().await
    }

    pub async fn set_token_lease(&self, lease: Option<TokenLease>) {
        self.tokens.set_lease(lease).await;
    }

    /// Install tokens obtained elsewhere, assuming the default lifetime.
    pub async fn set_tokens(&self, access_token: impl Into<String>, refresh_token: Option<String>) {
        self.tokens.set_tokens(access_token, refresh_token).await;
    }

    // --- Model & session ---

    pub fn model(&self) -> String {
        self.model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = model.into();
    }

    pub fn profile(&self) -> &dyn ProtocolProfile {
        self.profile.as_ref()
    }

    pub async fn session(&self) -> Option<ChatSession> {
        self.session.lock().await.clone()
    }

    /// Drop the current thread; the next `send` opens a new one.
    pub async fn new_thread(&self) {
        if let Some(previous) = self.session.lock().await.take() {
            debug!("Discarded chat thread {}", previous.thread_id);
        }
    }

    // --- Chat ---

    /// Send one user message and stream the reply.
    ///
    /// HTTP failures are returned here, before any output. The stream ends at
    /// the terminal frame or when the body ends; dropping it closes the body.
    pub async fn send(&self, content: &str, options: SendOptions) -> Result<ChatStream> {
        let access_token = self.tokens.ensure_valid().await?;
        let model = options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model());

        let (thread_id, parent_message_id) = {
            let mut session = self.session.lock().await;
            let current = match session.take() {
                Some(current) => current,
                None => self.open_session(&access_token, &model).await?,
            };
            let ids = (
                current.thread_id.clone(),
                current.last_parent_message_id.clone(),
            );
            *session = Some(current);
            ids
        };

        let turn = Turn {
            content,
            model: &model,
            thread_id: &thread_id,
            parent_message_id: parent_message_id.as_deref(),
            options: &options,
            now: self.clock.now(),
        };
        let request = self
            .profile
            .chat_request(&turn)
            .authorized(self.profile.credential(&access_token));
        let response = self.transport.post_json(request).await?;

        if !response.is_success() {
            let status = response.status;
            let body = response.collect_text().await.unwrap_or_default();
            return Err(QwenError::ChatRequestFailed { status, body });
        }
        let Some(body) = response.body else {
            return Err(QwenError::NoResponseBody);
        };

        let decoder = StreamDecoder::new(self.profile.classifier(), self.profile.decoder_options());
        let mut events = decode_stream(body, decoder);
        let session = Arc::clone(&self.session);

        Ok(Box::pin(async_stream::stream! {
            let mut continuity_seen = false;
            while let Some(event) = events.next().await {
                match event {
                    Ok(StreamEvent::TextDelta { content }) => {
                        yield Ok(ChatOutput::Text(content));
                    }
                    Ok(StreamEvent::ToolCallDelta(delta)) => {
                        yield Ok(ChatOutput::ToolCall(delta));
                    }
                    Ok(StreamEvent::ThreadCreated { parent_message_id, .. }) => {
                        if continuity_seen {
                            continue;
                        }
                        continuity_seen = true;
                        let Some(parent_message_id) = parent_message_id else {
                            continue;
                        };
                        if let Some(current) = session.lock().await.as_mut() {
                            if current.thread_id == thread_id {
                                debug!("Thread {} continues from {}", thread_id, parent_message_id);
                                current.last_parent_message_id = Some(parent_message_id);
                            }
                        }
                    }
                    Ok(StreamEvent::Terminal) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    /// Send and concatenate the text of the reply.
    pub async fn ask(&self, content: &str) -> Result<String> {
        let mut stream = self.send(content, SendOptions::default()).await?;
        let mut text = String::new();
        while let Some(output) = stream.next().await {
            if let ChatOutput::Text(delta) = output? {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }

    /// Send and drain the reply, merging tool-call fragments.
    pub async fn chat(&self, content: &str, options: SendOptions) -> Result<ChatReply> {
        let mut stream = self.send(content, options).await?;
        let mut text = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        while let Some(output) = stream.next().await {
            match output? {
                ChatOutput::Text(delta) => text.push_str(&delta),
                ChatOutput::ToolCall(delta) => accumulator.push(&delta),
            }
        }
        Ok(ChatReply {
            text,
            tool_calls: accumulator.into_tool_calls(),
        })
    }

    /// One buffered completion, outside the chat session.
    ///
    /// History comes only from `options.messages`; the session's thread and
    /// parent message are neither used nor updated.
    pub async fn complete(&self, content: &str, options: SendOptions) -> Result<ChatCompletion> {
        let model = options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model());
        let turn = Turn {
            content,
            model: &model,
            thread_id: "",
            parent_message_id: None,
            options: &options,
            now: self.clock.now(),
        };
        let Some(spec) = self.profile.completion_request(&turn) else {
            return Err(QwenError::CompletionUnsupported(self.profile.kind()));
        };

        let access_token = self.tokens.ensure_valid().await?;
        let response = self
            .transport
            .post_json(spec.authorized(self.profile.credential(&access_token)))
            .await?;
        let status = response.status;
        let success = response.is_success();
        let body = response.collect().await?;
        if !success {
            return Err(QwenError::ChatRequestFailed {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let completion: ChatCompletion = serde_json::from_slice(&body)?;
        debug!(
            "Completion {} finished with {:?}",
            completion.id,
            completion.finish_reason()
        );
        Ok(completion)
    }

    async fn open_session(&self, access_token: &str, model: &str) -> Result<ChatSession> {
        let created = match self.profile.thread_request(model, self.clock.now()) {
            Some(spec) => {
                let response = self
                    .transport
                    .post_json(spec.authorized(self.profile.credential(access_token)))
                    .await?;
                let status = response.status;
                let success = response.is_success();
                let body = response.collect().await?;
                if !success {
                    return Err(QwenError::ThreadCreationFailed {
                        status,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                }
                Some(body)
            }
            None => None,
        };

        let thread_id = self.profile.thread_id(created.as_deref())?;
        info!("Opened chat thread {} with model {}", thread_id, model);
        Ok(ChatSession {
            thread_id,
            last_parent_message_id: None,
            model: model.to_string(),
        })
    }
}

impl std::fmt::Debug for QwenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenClient")
            .field("profile", &self.profile.kind())
            .field("model", &self.model())
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}
