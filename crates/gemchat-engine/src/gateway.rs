use std::collections::BTreeMap;
use std::sync::Arc;

use gemchat_contracts::session::{AttachmentKind, AttachmentRef, SessionConfig, Turn};
use gemchat_contracts::{ChatResult, ProviderError};

use crate::cancel::CancelToken;

/// Everything one provider call sees: the prior history, the settings in
/// force and the new user turn. `model` may differ from the configured model
/// when the turn needs a capability the configured one lacks.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub history: Vec<Turn>,
    pub config: SessionConfig,
    pub new_turn: Turn,
    pub model: String,
}

impl ChatRequest {
    pub fn new(history: &[Turn], config: &SessionConfig, new_turn: Turn) -> Self {
        Self {
            history: history.to_vec(),
            config: config.clone(),
            model: config.model_name.as_str().to_string(),
            new_turn,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// History plus the new turn, in order.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter().chain(std::iter::once(&self.new_turn))
    }

    pub fn context_len(&self) -> usize {
        self.history.len() + 1
    }
}

/// Steps reported while an attachment is handed over to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Uploading { total_bytes: u64 },
    Uploaded,
    Processing { check: usize },
    Ready,
}

impl UploadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading { .. } => "uploading",
            Self::Uploaded => "uploaded",
            Self::Processing { .. } => "processing",
            Self::Ready => "ready",
        }
    }
}

/// Adapter to a hosted model. Implementations block until the provider
/// answers; callers run them off the interaction thread.
pub trait ModelGateway: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, request: &ChatRequest) -> Result<Turn, ProviderError>;

    /// Runs once per attachment when it is staged. Gateways that host media
    /// themselves upload here and return a `Remote` reference; the default
    /// keeps the attachment inline.
    fn prepare(
        &self,
        attachment: AttachmentRef,
        _cancel: &CancelToken,
        _on_stage: &mut dyn FnMut(UploadStage),
    ) -> ChatResult<AttachmentRef> {
        Ok(attachment)
    }
}

#[derive(Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, Arc<dyn ModelGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ModelGateway + 'static>(&mut self, gateway: G) {
        self.gateways
            .insert(gateway.name().to_string(), Arc::new(gateway));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelGateway>> {
        self.gateways.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.gateways.keys().cloned().collect()
    }
}

/// Text actually sent for a turn. An attachment-only user turn gets a
/// describe instruction instead of an empty prompt.
pub fn effective_prompt(turn: &Turn) -> String {
    let trimmed = turn.text().trim();
    if !trimmed.is_empty() {
        return turn.text().to_string();
    }
    if turn.has_attachment_kind(AttachmentKind::Video) {
        return "Describe this video.".to_string();
    }
    if turn.has_attachment_kind(AttachmentKind::Image) {
        return "Describe this image.".to_string();
    }
    String::new()
}

/// Answers locally and deterministically; used for offline runs and tests.
pub struct DryrunGateway;

impl ModelGateway for DryrunGateway {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn send(&self, request: &ChatRequest) -> Result<Turn, ProviderError> {
        let attachments = request
            .new_turn
            .attachments()
            .iter()
            .map(|attachment| format!("{} ({})", attachment.kind(), attachment.mime_type()))
            .collect::<Vec<String>>();
        let mut reply = format!(
            "[dryrun {} t={:.1}] {} turns of context. You said: {}",
            request.model,
            request.config.temperature,
            request.context_len(),
            effective_prompt(&request.new_turn)
        );
        if !attachments.is_empty() {
            reply.push_str(&format!(" [attachments: {}]", attachments.join(", ")));
        }
        Ok(Turn::assistant(reply))
    }
}
