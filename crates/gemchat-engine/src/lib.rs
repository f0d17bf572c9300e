pub mod attachments;
pub mod cancel;
pub mod gateway;
pub mod gemini;

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use gemchat_contracts::events::{EventPayload, EventWriter};
use gemchat_contracts::models::{ModelSelection, ModelSelector, ModelSpec};
use gemchat_contracts::session::{
    AttachmentKind, AttachmentPayload, AttachmentRef, ConfigUpdate, Role, SessionConfig,
    SessionState, Turn,
};
use gemchat_contracts::{ChatError, ChatResult, ProviderError};
use serde_json::{json, Map, Value};

pub use attachments::{AttachmentStore, NormalizeEvent, NormalizeJob, Progress, RawUpload};
pub use cancel::CancelToken;
pub use gateway::{ChatRequest, DryrunGateway, GatewayRegistry, ModelGateway, UploadStage};
pub use gemini::GeminiGateway;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const FALLBACK_CONTEXT_WINDOW: u64 = 32_768;

#[derive(Debug, Clone)]
pub struct ContextUsage {
    pub used_tokens: u64,
    pub max_tokens: u64,
    pub pct: f64,
    pub alert_level: String,
}

/// What `ChatEngine::attach` reports while an attachment is being staged:
/// local read progress first, then any provider upload stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachProgress {
    Reading(Progress),
    Upload(UploadStage),
}

/// Result of one successful submit: the committed reply and how it was routed.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub reply: Turn,
    pub model: String,
    pub fallback_reason: Option<String>,
    pub context: ContextUsage,
}

/// Orchestrates one interactive session. Every operation goes through the
/// single `SessionState` owned here; a failed or cancelled operation leaves
/// it as it was.
pub struct ChatEngine {
    session_dir: PathBuf,
    session_id: String,
    events: EventWriter,
    session: SessionState,
    gateways: GatewayRegistry,
    gateway_name: String,
    store: AttachmentStore,
    model_selector: ModelSelector,
    staged: Vec<AttachmentRef>,
    last_failed: Option<String>,
    last_fallback_reason: Option<String>,
    poll_interval: Duration,
}

impl ChatEngine {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: Option<PathBuf>,
        config: SessionConfig,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir).with_context(|| {
            format!("failed to create session dir {}", session_dir.display())
        })?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let events = match events_path {
            Some(path) => EventWriter::new(path, session_id.clone()),
            None => EventWriter::disabled(session_id.clone()),
        };

        events
            .emit(
                "session_started",
                map_object(json!({
                    "out_dir": session_dir.to_string_lossy().to_string(),
                    "model": config.model_name.as_str(),
                    "temperature": config.temperature,
                })),
            )
            .context("failed to record session start")?;

        Ok(Self {
            session_dir,
            session_id,
            events,
            session: SessionState::with_config(config),
            gateways: default_gateway_registry(),
            gateway_name: "gemini".to_string(),
            store: AttachmentStore::new(),
            model_selector: ModelSelector::new(None),
            staged: Vec::new(),
            last_failed: None,
            last_fallback_reason: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Registers `gateway` and routes subsequent sends through it.
    pub fn with_gateway<G: ModelGateway + 'static>(mut self, gateway: G) -> Self {
        self.gateway_name = gateway.name().to_string();
        self.gateways.register(gateway);
        self
    }

    pub fn with_attachment_store(mut self, store: AttachmentStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn select_gateway(&mut self, name: &str) -> ChatResult<()> {
        if self.gateways.get(name).is_none() {
            return Err(ChatError::InvalidConfig(format!(
                "unknown gateway '{name}' (available: {})",
                self.gateways.names().join(", ")
            )));
        }
        self.gateway_name = name.to_string();
        Ok(())
    }

    pub fn gateway_name(&self) -> &str {
        &self.gateway_name
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn config(&self) -> &SessionConfig {
        self.session.config()
    }

    pub fn turns(&self) -> &[Turn] {
        self.session.turns()
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn staged(&self) -> &[AttachmentRef] {
        &self.staged
    }

    pub fn last_failed_input(&self) -> Option<&str> {
        self.last_failed.as_deref()
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    pub fn models(&self) -> Vec<ModelSpec> {
        self.model_selector.registry.list().cloned().collect()
    }

    pub fn set_config(&mut self, update: &ConfigUpdate) -> ChatResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.session.set_config(update)?;
        let config = self.session.config();
        self.emit(
            "config_updated",
            map_object(json!({
                "model": config.model_name.as_str(),
                "temperature": config.temperature,
                "system_prompt": config.system_prompt,
            })),
        );
        Ok(())
    }

    /// Normalizes an upload on a worker, hands it to the active gateway's
    /// `prepare` (video upload for Gemini) and stages the result for the next
    /// turn. `expected` rejects e.g. a video handed to `/image`.
    pub fn attach(
        &mut self,
        upload: RawUpload,
        expected: Option<AttachmentKind>,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(AttachProgress),
    ) -> ChatResult<AttachmentRef> {
        let gateway = self.active_gateway()?;
        let file_name = upload.file_name.clone();
        let (kind, _) = self.store.resolve_kind(&upload)?;
        if let Some(expected) = expected.filter(|expected| *expected != kind) {
            return Err(ChatError::unsupported_media(
                file_name,
                format!("expected {expected}, got {kind}"),
            ));
        }

        let job = self.store.spawn_normalize(upload, cancel.clone());
        let mut last_bucket = None;
        let events = self.events.clone();
        let outcome = job.wait(|progress| {
            let bucket = (progress.percent() / 10.0).floor() as u64;
            if last_bucket != Some(bucket) {
                last_bucket = Some(bucket);
                let emitted = events.emit(
                    "attachment_progress",
                    map_object(json!({
                        "file_name": file_name,
                        "stage": "reading",
                        "processed_bytes": progress.processed_bytes,
                        "total_bytes": progress.total_bytes,
                        "pct": progress.percent(),
                    })),
                );
                if let Err(err) = emitted {
                    tracing::warn!(error = %err, "failed to record attachment progress");
                }
            }
            on_progress(AttachProgress::Reading(progress));
        });

        let prepared = outcome.and_then(|attachment| {
            gateway.prepare(attachment, cancel, &mut |stage| {
                let emitted = events.emit(
                    "attachment_progress",
                    map_object(json!({
                        "file_name": file_name,
                        "stage": stage.as_str(),
                        "gateway": gateway.name(),
                    })),
                );
                if let Err(err) = emitted {
                    tracing::warn!(error = %err, "failed to record upload stage");
                }
                on_progress(AttachProgress::Upload(stage));
            })
        });
        let attachment = match prepared {
            Ok(attachment) => attachment,
            Err(err) => {
                tracing::info!(file_name = %file_name, code = err.code(), "attachment rejected");
                return Err(err);
            }
        };
        self.staged.push(attachment.clone());
        self.emit(
            "attachment_ready",
            map_object(json!({
                "file_name": file_name,
                "kind": attachment.kind().as_str(),
                "mime_type": attachment.mime_type(),
                "size_bytes": attachment.size_bytes(),
                "remote": matches!(attachment.payload(), AttachmentPayload::Remote { .. }),
                "staged": self.staged.len(),
            })),
        );
        Ok(attachment)
    }

    /// Drops every staged attachment, returning how many were dropped.
    pub fn detach(&mut self) -> usize {
        let dropped = self.staged.len();
        self.staged.clear();
        dropped
    }

    /// Sends `text` plus staged attachments and commits the user turn and the
    /// reply together. On failure or cancellation nothing is appended and the
    /// staged attachments stay staged.
    pub fn submit(&mut self, text: &str, cancel: &CancelToken) -> ChatResult<Exchange> {
        let attachments = std::mem::take(&mut self.staged);
        match self.submit_with(text, attachments.clone(), cancel) {
            Ok(exchange) => {
                self.last_failed = None;
                Ok(exchange)
            }
            Err(err) => {
                self.staged = attachments;
                if !matches!(err, ChatError::InvalidTurn(_) | ChatError::InvalidConfig(_)) {
                    self.last_failed = Some(text.to_string());
                }
                Err(err)
            }
        }
    }

    /// Resubmits the last input whose send failed or was cancelled.
    pub fn retry(&mut self, cancel: &CancelToken) -> ChatResult<Exchange> {
        let Some(text) = self.last_failed.clone() else {
            return Err(ChatError::InvalidTurn("nothing to retry".to_string()));
        };
        self.submit(&text, cancel)
    }

    fn submit_with(
        &mut self,
        text: &str,
        attachments: Vec<AttachmentRef>,
        cancel: &CancelToken,
    ) -> ChatResult<Exchange> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::InvalidTurn(
                "a turn needs text or an attachment".to_string(),
            ));
        }
        let user_turn = Turn::user(text, attachments);
        let selection = self.select_model(&user_turn)?;
        let gateway = self.active_gateway()?;
        let model = selection.model.name.clone();
        let request =
            ChatRequest::new(self.session.turns(), self.session.config(), user_turn.clone())
                .with_model(model.clone());

        let reply = match self.await_reply(gateway, request, cancel) {
            Ok(reply) => reply,
            Err(ChatError::Cancelled) => {
                self.emit(
                    "submit_cancelled",
                    map_object(json!({ "model": model })),
                );
                return Err(ChatError::Cancelled);
            }
            Err(ChatError::Provider(err)) => {
                tracing::warn!(model = %model, kind = %err.kind, "provider call failed");
                self.emit(
                    "provider_error",
                    map_object(json!({
                        "model": model,
                        "kind": err.kind.as_str(),
                        "status": err.status,
                        "message": err.message,
                    })),
                );
                return Err(ChatError::Provider(err));
            }
            Err(other) => return Err(other),
        };
        if reply.role() != Role::Assistant {
            return Err(ChatError::Provider(ProviderError::permanent(format!(
                "gateway returned a {} turn instead of an assistant turn",
                reply.role()
            ))));
        }

        let attachment_count = user_turn.attachments().len();
        self.session.append_exchange(user_turn, reply.clone())?;
        self.emit(
            "turn_appended",
            map_object(json!({
                "model": model,
                "turns": self.session.turns().len(),
                "attachments": attachment_count,
                "fallback_reason": selection.fallback_reason,
            })),
        );
        let context = self.context_usage();
        Ok(Exchange {
            reply,
            model,
            fallback_reason: selection.fallback_reason,
            context,
        })
    }

    fn active_gateway(&self) -> ChatResult<Arc<dyn ModelGateway>> {
        self.gateways.get(&self.gateway_name).ok_or_else(|| {
            ChatError::InvalidConfig(format!("unknown gateway '{}'", self.gateway_name))
        })
    }

    /// Every call resends the whole history, so the chosen model must cover
    /// the media of earlier turns as well as the new one.
    fn select_model(&mut self, turn: &Turn) -> ChatResult<ModelSelection> {
        let capabilities =
            required_capabilities(self.session.turns().iter().chain(std::iter::once(turn)));
        let requested = self.session.config().model_name.as_str();
        let selection = self
            .model_selector
            .select(Some(requested), &capabilities)
            .map_err(ChatError::InvalidConfig)?;
        self.last_fallback_reason = selection.fallback_reason.clone();
        if selection.is_fallback() {
            self.emit(
                "model_fallback",
                map_object(json!({
                    "requested": requested,
                    "model": selection.model.name,
                    "required": capabilities,
                    "reason": selection.fallback_reason,
                })),
            );
        }
        Ok(selection)
    }

    /// Runs the gateway on a worker and waits for it, checking `cancel`
    /// between polls. A cancelled call is abandoned; its late reply is dropped.
    fn await_reply(
        &self,
        gateway: Arc<dyn ModelGateway>,
        request: ChatRequest,
        cancel: &CancelToken,
    ) -> ChatResult<Turn> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("gemchat-send".to_string())
            .spawn(move || {
                let _ = tx.send(gateway.send(&request));
            })
            .map_err(|err| ChatError::io("gateway worker", err))?;

        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            match rx.recv_timeout(self.poll_interval) {
                Ok(result) => return result.map_err(ChatError::Provider),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(ChatError::Provider(ProviderError::permanent(
                        "gateway worker exited without a reply",
                    )));
                }
            }
        }
    }

    /// Writes the conversation to `destination`, or to a timestamped file in
    /// the session directory.
    pub fn save(&self, destination: Option<&Path>) -> ChatResult<PathBuf> {
        let path = match destination {
            Some(path) => path.to_path_buf(),
            None => self.session_dir.join(default_save_name()),
        };
        self.session.save(&path)?;
        self.emit(
            "history_saved",
            map_object(json!({
                "path": path.to_string_lossy().to_string(),
                "turns": self.session.turns().len(),
            })),
        );
        Ok(path)
    }

    pub fn load(&mut self, source: &Path) -> ChatResult<()> {
        self.session.load(source)?;
        self.last_failed = None;
        self.emit(
            "history_loaded",
            map_object(json!({
                "path": source.to_string_lossy().to_string(),
                "turns": self.session.turns().len(),
                "model": self.session.config().model_name.as_str(),
            })),
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        let dropped = self.session.turns().len();
        self.session.clear();
        self.last_failed = None;
        self.emit(
            "history_cleared",
            map_object(json!({ "dropped_turns": dropped })),
        );
    }

    /// Rough token estimate of everything the next call would resend.
    pub fn context_usage(&self) -> ContextUsage {
        let config = self.session.config();
        let used_tokens = estimate_tokens(&config.system_prompt)
            + self
                .session
                .turns()
                .iter()
                .map(|turn| estimate_tokens(turn.text()))
                .sum::<u64>();
        let max_tokens = self
            .model_selector
            .registry
            .get(config.model_name.as_str())
            .and_then(|spec| spec.context_window)
            .unwrap_or(FALLBACK_CONTEXT_WINDOW);
        let pct = if max_tokens == 0 {
            0.0
        } else {
            used_tokens as f64 / max_tokens as f64
        }
        .clamp(0.0, 1.0);
        let alert_level = alert_level(pct).to_string();

        self.emit(
            "context_usage",
            map_object(json!({
                "model": config.model_name.as_str(),
                "used_tokens": used_tokens,
                "max_tokens": max_tokens,
                "pct": pct,
                "alert_level": alert_level,
            })),
        );
        ContextUsage {
            used_tokens,
            max_tokens,
            pct,
            alert_level,
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        self.events.emit(
            "session_finished",
            map_object(json!({
                "turns": self.session.turns().len(),
                "out_dir": self.session_dir.to_string_lossy().to_string(),
            })),
        )?;
        Ok(())
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "failed to record event");
        }
    }
}

pub fn default_gateway_registry() -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();
    registry.register(DryrunGateway);
    registry.register(GeminiGateway::from_env());
    registry
}

/// `conversation_YYYYmmdd_HHMMSS.json` in local time.
pub fn default_save_name() -> String {
    chrono::Local::now()
        .format("conversation_%Y%m%d_%H%M%S.json")
        .to_string()
}

/// Detached attachments go out as text placeholders and need no media
/// support.
fn required_capabilities<'a>(turns: impl Iterator<Item = &'a Turn>) -> Vec<&'static str> {
    let mut image = false;
    let mut video = false;
    for attachment in turns
        .flat_map(|turn| turn.attachments())
        .filter(|attachment| attachment.is_materialized())
    {
        match attachment.kind() {
            AttachmentKind::Image => image = true,
            AttachmentKind::Video => video = true,
        }
    }
    let mut capabilities = vec!["text"];
    if image {
        capabilities.push("image");
    }
    if video {
        capabilities.push("video");
    }
    capabilities
}

fn alert_level(pct: f64) -> &'static str {
    if pct >= 0.95 {
        "critical"
    } else if pct >= 0.9 {
        "high"
    } else if pct >= 0.75 {
        "medium"
    } else {
        "ok"
    }
}

fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
