use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gemchat_contracts::session::{AttachmentKind, AttachmentPayload, AttachmentRef, Role, Turn};
use gemchat_contracts::{ChatError, ChatResult, ProviderError};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;
use crate::gateway::{effective_prompt, ChatRequest, ModelGateway, UploadStage};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_POLLS: usize = 60;
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Gemini `generateContent` transport. Videos go through the resumable
/// Files API first; everything else is sent inline.
pub struct GeminiGateway {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    request_timeout: Duration,
    poll_interval: Duration,
    max_polls: usize,
    uploads: Mutex<HashMap<String, String>>,
}

impl GeminiGateway {
    pub fn from_env() -> Self {
        let api_base = env::var("GEMINI_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"));
        Self::with_settings(api_base, api_key)
    }

    pub fn with_settings(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: HttpClient::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// `https://host/v1beta` becomes `https://host/upload/v1beta/files`.
    fn upload_endpoint(&self) -> String {
        match self.api_base.rsplit_once('/') {
            Some((root, version)) if !root.ends_with('/') && !root.ends_with(':') => {
                format!("{root}/upload/{version}/files")
            }
            _ => format!("{}/upload/files", self.api_base),
        }
    }

    /// Videos that were never prepared (e.g. staged under another gateway)
    /// are uploaded on the send path without stage reporting.
    fn part_for(&self, attachment: &AttachmentRef, api_key: &str) -> Result<Value, ProviderError> {
        match (attachment.kind(), attachment.payload()) {
            (AttachmentKind::Video, AttachmentPayload::Inline(bytes)) => {
                let uri = self
                    .ensure_uploaded(
                        bytes,
                        attachment.mime_type(),
                        api_key,
                        &CancelToken::new(),
                        &mut |stage| tracing::debug!(stage = stage.as_str(), "video upload"),
                    )
                    .map_err(into_provider_error)?;
                Ok(file_data_part(attachment.mime_type(), &uri))
            }
            _ => Ok(inline_part(attachment)),
        }
    }

    fn ensure_uploaded(
        &self,
        bytes: &[u8],
        mime_type: &str,
        api_key: &str,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(UploadStage),
    ) -> ChatResult<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        if let Some(uri) = self.cached_upload(&digest)? {
            tracing::debug!(%digest, "reusing uploaded video");
            on_stage(UploadStage::Ready);
            return Ok(uri);
        }
        let uri = self.upload_video(bytes, mime_type, api_key, &digest, cancel, on_stage)?;
        self.uploads
            .lock()
            .map_err(|_| ProviderError::permanent("upload cache lock poisoned"))?
            .insert(digest, uri.clone());
        Ok(uri)
    }

    fn cached_upload(&self, digest: &str) -> Result<Option<String>, ProviderError> {
        let uploads = self
            .uploads
            .lock()
            .map_err(|_| ProviderError::permanent("upload cache lock poisoned"))?;
        Ok(uploads.get(digest).cloned())
    }

    fn upload_video(
        &self,
        bytes: &[u8],
        mime_type: &str,
        api_key: &str,
        digest: &str,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(UploadStage),
    ) -> ChatResult<String> {
        let endpoint = self.upload_endpoint();
        tracing::info!(bytes = bytes.len(), mime_type, "starting video upload");
        on_stage(UploadStage::Uploading {
            total_bytes: bytes.len() as u64,
        });
        let start = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.request_timeout)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "file": { "display_name": format!("video-{}", &digest[..12]) } }))
            .send()
            .map_err(|err| transport_error("Gemini upload start", err))?;
        let status = start.status().as_u16();
        if !start.status().is_success() {
            let body = start.text().unwrap_or_default();
            return Err(classify_status("Gemini upload start", status, &body).into());
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::permanent("Gemini upload start returned no upload URL"))?;
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let finished = self
            .http
            .post(&upload_url)
            .timeout(self.request_timeout)
            .header(CONTENT_LENGTH, bytes.len().to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes.to_vec())
            .send()
            .map_err(|err| transport_error("Gemini upload", err))?;
        let payload = response_json_or_error("Gemini upload", finished)?;
        on_stage(UploadStage::Uploaded);
        let file = payload.get("file").cloned().unwrap_or(Value::Null);
        self.wait_until_active(&file, api_key, cancel, on_stage)
    }

    fn wait_until_active(
        &self,
        file: &Value,
        api_key: &str,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(UploadStage),
    ) -> ChatResult<String> {
        let name = file
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::permanent("Gemini upload returned no file name"))?
            .to_string();
        let mut current = file.clone();
        for attempt in 0..self.max_polls {
            match file_state(&current) {
                "ACTIVE" => {
                    let uri = current
                        .get("uri")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| ProviderError::permanent("Gemini file has no URI"))?;
                    on_stage(UploadStage::Ready);
                    return Ok(uri);
                }
                "FAILED" => {
                    return Err(ProviderError::permanent(format!(
                        "Gemini failed to process uploaded video {name}"
                    ))
                    .into());
                }
                state => {
                    tracing::debug!(%name, state, attempt, "video still processing");
                    on_stage(UploadStage::Processing { check: attempt + 1 });
                }
            }
            self.pause(cancel)?;
            let response = self
                .http
                .get(format!("{}/{}", self.api_base, name))
                .query(&[("key", api_key)])
                .timeout(self.request_timeout)
                .send()
                .map_err(|err| transport_error("Gemini file status", err))?;
            current = response_json_or_error("Gemini file status", response)?;
        }
        Err(ProviderError::transient(format!(
            "Gemini video {name} still processing after {} checks",
            self.max_polls
        ))
        .into())
    }

    /// Sleeps one poll interval in short slices so a cancel lands quickly.
    fn pause(&self, cancel: &CancelToken) -> ChatResult<()> {
        let mut remaining = self.poll_interval;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            if remaining.is_zero() {
                return Ok(());
            }
            let slice = remaining.min(CANCEL_CHECK_INTERVAL);
            thread::sleep(slice);
            remaining -= slice;
        }
    }
}

impl ModelGateway for GeminiGateway {
    fn name(&self) -> &str {
        "gemini"
    }

    fn send(&self, request: &ChatRequest) -> Result<Turn, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::permanent(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set",
            ));
        };
        let payload = build_payload(request, |attachment| self.part_for(attachment, api_key))?;
        let endpoint = self.endpoint_for_model(&request.model);
        tracing::debug!(
            model = %request.model,
            turns = request.context_len(),
            "sending generateContent"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .map_err(|err| transport_error("Gemini request", err))?;
        let parsed = response_json_or_error("Gemini", response)?;
        let text = extract_reply_text(&parsed)?;
        Ok(Turn::assistant(text))
    }

    /// Uploads inline videos through the Files API and waits for them to
    /// become `ACTIVE`. Without a key the video stays inline and `send`
    /// reports the missing key.
    fn prepare(
        &self,
        attachment: AttachmentRef,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(UploadStage),
    ) -> ChatResult<AttachmentRef> {
        let AttachmentPayload::Inline(bytes) = attachment.payload() else {
            return Ok(attachment);
        };
        if attachment.kind() != AttachmentKind::Video {
            return Ok(attachment);
        }
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(attachment);
        };
        let uri = self.ensure_uploaded(bytes, attachment.mime_type(), api_key, cancel, on_stage)?;
        Ok(AttachmentRef::remote(
            attachment.kind(),
            attachment.mime_type(),
            attachment.size_bytes(),
            uri,
        ))
    }
}

/// Builds the `generateContent` body: one content entry per turn, history
/// first, the new turn last.
pub fn build_payload(
    request: &ChatRequest,
    mut part_for: impl FnMut(&AttachmentRef) -> Result<Value, ProviderError>,
) -> Result<Value, ProviderError> {
    let mut contents = Vec::with_capacity(request.context_len());
    for turn in request.turns() {
        let mut parts = Vec::new();
        for attachment in turn.attachments() {
            parts.push(part_for(attachment)?);
        }
        let text = match turn.role() {
            Role::System => format!("System: {}", turn.text()),
            Role::User => effective_prompt(turn),
            Role::Assistant => turn.text().to_string(),
        };
        if !text.is_empty() || parts.is_empty() {
            parts.push(json!({ "text": text }));
        }
        contents.push(json!({
            "role": wire_role(turn.role()),
            "parts": parts,
        }));
    }

    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    payload.insert(
        "generationConfig".to_string(),
        json!({ "temperature": request.config.temperature }),
    );
    let system_prompt = request.config.system_prompt.trim();
    if !system_prompt.is_empty() {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": request.config.system_prompt }] }),
        );
    }
    Ok(Value::Object(payload))
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    }
}

/// Part for attachments that need no upload.
pub fn inline_part(attachment: &AttachmentRef) -> Value {
    match attachment.payload() {
        AttachmentPayload::Inline(bytes) => json!({
            "inlineData": {
                "mimeType": attachment.mime_type(),
                "data": BASE64.encode(bytes),
            }
        }),
        AttachmentPayload::Remote { uri } => file_data_part(attachment.mime_type(), uri),
        AttachmentPayload::Detached => json!({
            "text": format!(
                "[{} attachment ({}, {} bytes) not available]",
                attachment.kind(),
                attachment.mime_type(),
                attachment.size_bytes()
            )
        }),
    }
}

fn file_data_part(mime_type: &str, uri: &str) -> Value {
    json!({
        "fileData": {
            "mimeType": mime_type,
            "fileUri": uri,
        }
    })
}

fn file_state(file: &Value) -> &str {
    file.get("state")
        .and_then(|state| {
            state
                .as_str()
                .or_else(|| state.get("name").and_then(Value::as_str))
        })
        .unwrap_or("PROCESSING")
}

/// 408, 429 and 5xx are worth retrying; every other failure status is not.
pub fn classify_status(provider: &str, status: u16, body: &str) -> ProviderError {
    let message = format!(
        "{provider} request failed ({status}): {}",
        truncate_text(body.trim(), 512)
    );
    let err = if status == 408 || status == 429 || (500..=599).contains(&status) {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    };
    err.with_status(status)
}

fn into_provider_error(err: ChatError) -> ProviderError {
    match err {
        ChatError::Provider(err) => err,
        other => ProviderError::permanent(other.to_string()),
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> ProviderError {
    let message = format!("{context} failed: {err}");
    if err.is_timeout() || err.is_connect() || err.is_request() {
        tracing::warn!(%message, "transient transport failure");
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| transport_error(&format!("{provider} response body read"), err))?;
    if !status.is_success() {
        return Err(classify_status(provider, status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        ProviderError::permanent(format!("{provider} returned invalid JSON payload: {err}"))
    })
}

/// Joins the text parts of the first candidate.
pub fn extract_reply_text(payload: &Value) -> Result<String, ProviderError> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(ProviderError::permanent(format!(
            "Gemini blocked the prompt ({reason})"
        )));
    }
    let candidate = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .ok_or_else(|| ProviderError::permanent("Gemini returned no candidates"))?;
    let text = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(ProviderError::permanent(format!(
            "Gemini returned an empty reply (finishReason {finish})"
        )));
    }
    Ok(text)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use gemchat_contracts::session::{
        AttachmentKind, AttachmentMeta, AttachmentRef, SessionConfig, Turn,
    };
    use std::time::Duration;

    use gemchat_contracts::session::AttachmentPayload;
    use gemchat_contracts::{ChatError, ProviderErrorKind};
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};

    use super::{build_payload, classify_status, extract_reply_text, inline_part, GeminiGateway};
    use crate::cancel::CancelToken;
    use crate::gateway::{ChatRequest, ModelGateway, UploadStage};

    /// Points at a closed port so any request that slips through fails.
    fn offline_gateway() -> GeminiGateway {
        GeminiGateway::with_settings("http://127.0.0.1:9/v1beta", Some("test-key".to_string()))
    }

    fn seed_upload(gateway: &GeminiGateway, bytes: &[u8], uri: &str) -> anyhow::Result<()> {
        gateway
            .uploads
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .insert(hex::encode(Sha256::digest(bytes)), uri.to_string());
        Ok(())
    }

    fn request_with(history: Vec<Turn>, new_turn: Turn, system_prompt: &str) -> ChatRequest {
        let config = SessionConfig {
            system_prompt: system_prompt.to_string(),
            ..SessionConfig::default()
        };
        ChatRequest::new(&history, &config, new_turn)
    }

    #[test]
    fn payload_has_one_content_per_turn_in_order() -> anyhow::Result<()> {
        let request = request_with(
            vec![
                Turn::user("hi", Vec::new()),
                Turn::assistant("hello"),
                Turn::system("be brief"),
            ],
            Turn::user("next", Vec::new()),
            "You are a helpful AI assistant.",
        );
        let payload = build_payload(&request, |attachment| Ok(inline_part(attachment)))?;
        let contents = payload["contents"].as_array().cloned().unwrap_or_default();
        assert_eq!(contents.len(), 4);
        let roles: Vec<&str> = contents
            .iter()
            .filter_map(|content| content["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user", "user"]);
        assert_eq!(contents[2]["parts"][0]["text"], json!("System: be brief"));
        assert_eq!(contents[3]["parts"][0]["text"], json!("next"));
        assert_eq!(payload["generationConfig"]["temperature"], json!(0.7));
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!("You are a helpful AI assistant.")
        );
        Ok(())
    }

    #[test]
    fn blank_system_prompt_is_omitted() -> anyhow::Result<()> {
        let request = request_with(Vec::new(), Turn::user("hi", Vec::new()), "   ");
        let payload = build_payload(&request, |attachment| Ok(inline_part(attachment)))?;
        assert!(payload.get("systemInstruction").is_none());
        Ok(())
    }

    #[test]
    fn image_only_turn_sends_inline_data_and_describe_prompt() -> anyhow::Result<()> {
        let request = request_with(
            Vec::new(),
            Turn::user(
                "",
                vec![AttachmentRef::inline(AttachmentKind::Image, "image/png", vec![1, 2, 3])],
            ),
            "",
        );
        let payload = build_payload(&request, |attachment| Ok(inline_part(attachment)))?;
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[0]["inlineData"]["data"], json!("AQID"));
        assert_eq!(parts[1]["text"], json!("Describe this image."));
        Ok(())
    }

    #[test]
    fn detached_attachments_become_text_placeholders() {
        let part = inline_part(&AttachmentRef::detached(AttachmentMeta {
            kind: AttachmentKind::Video,
            mime_type: "video/mp4".to_string(),
            size_bytes: 2048,
        }));
        let text = part["text"].as_str().unwrap_or("");
        assert!(text.contains("video"));
        assert!(text.contains("2048 bytes"));
    }

    #[test]
    fn attachment_part_failures_propagate() {
        let request = request_with(
            Vec::new(),
            Turn::user(
                "clip",
                vec![AttachmentRef::inline(AttachmentKind::Video, "video/mp4", vec![0; 8])],
            ),
            "",
        );
        let err = build_payload(&request, |_| {
            Err(gemchat_contracts::ProviderError::transient("upload stalled"))
        })
        .err();
        assert!(matches!(err, Some(ref e) if e.is_transient()));
    }

    #[test]
    fn status_codes_are_classified() {
        for status in [408_u16, 429, 500, 503] {
            assert_eq!(
                classify_status("Gemini", status, "busy").kind,
                ProviderErrorKind::Transient
            );
        }
        for status in [400_u16, 401, 403, 404] {
            let err = classify_status("Gemini", status, "nope");
            assert_eq!(err.kind, ProviderErrorKind::Permanent);
            assert_eq!(err.status, Some(status));
        }
    }

    #[test]
    fn reply_text_joins_candidate_parts() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello"}, {"text": ", world"}]},
                "finishReason": "STOP"
            }]
        });
        assert_eq!(extract_reply_text(&payload)?, "Hello, world");
        Ok(())
    }

    #[test]
    fn blocked_or_empty_replies_are_permanent() {
        let blocked = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let empty = json!({"candidates": []});
        let no_text = json!({"candidates": [{"content": {"parts": []}, "finishReason": "MAX_TOKENS"}]});
        for payload in [blocked, empty, no_text] {
            let err = extract_reply_text(&payload).err();
            assert!(matches!(err, Some(ref e) if !e.is_transient()), "{payload}");
        }
    }

    #[test]
    fn missing_key_is_permanent() {
        let gateway = GeminiGateway::with_settings("http://127.0.0.1:9/v1beta", None);
        let request = request_with(Vec::new(), Turn::user("hi", Vec::new()), "");
        let err = gateway.send(&request).err();
        assert!(matches!(err, Some(ref e) if !e.is_transient()));
    }

    #[test]
    fn refused_connection_is_transient() {
        let mut gateway = offline_gateway();
        gateway.request_timeout = Duration::from_secs(5);
        let request = request_with(Vec::new(), Turn::user("hi", Vec::new()), "");
        let err = gateway.send(&request).err();
        assert!(matches!(err, Some(ref e) if e.is_transient()), "{err:?}");
    }

    #[test]
    fn endpoints_follow_api_base() {
        let gateway = GeminiGateway::with_settings(
            "https://generativelanguage.googleapis.com/v1beta/",
            None,
        );
        assert_eq!(
            gateway.endpoint_for_model("models/gemini-exp-1206"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-exp-1206:generateContent"
        );
        assert_eq!(
            gateway.upload_endpoint(),
            "https://generativelanguage.googleapis.com/upload/v1beta/files"
        );
    }

    #[test]
    fn file_state_accepts_string_or_object() {
        assert_eq!(super::file_state(&json!({"state": "ACTIVE"})), "ACTIVE");
        assert_eq!(super::file_state(&json!({"state": {"name": "FAILED"}})), "FAILED");
        assert_eq!(super::file_state(&Value::Null), "PROCESSING");
    }

    #[test]
    fn cached_video_is_sent_as_file_data_without_uploading() -> anyhow::Result<()> {
        let gateway = offline_gateway();
        let bytes = vec![3_u8; 64];
        seed_upload(&gateway, &bytes, "https://files.test/v1beta/files/abc")?;

        let video = AttachmentRef::inline(AttachmentKind::Video, "video/mp4", bytes);
        let part = gateway.part_for(&video, "test-key")?;
        assert_eq!(part["fileData"]["fileUri"], json!("https://files.test/v1beta/files/abc"));
        assert_eq!(part["fileData"]["mimeType"], json!("video/mp4"));

        let again = gateway.part_for(&video, "test-key")?;
        assert_eq!(again, part);
        Ok(())
    }

    #[test]
    fn prepare_turns_cached_video_into_remote_reference() -> anyhow::Result<()> {
        let gateway = offline_gateway();
        let bytes = vec![5_u8; 32];
        seed_upload(&gateway, &bytes, "https://files.test/v1beta/files/xyz")?;

        let mut stages = Vec::new();
        let prepared = gateway.prepare(
            AttachmentRef::inline(AttachmentKind::Video, "video/webm", bytes),
            &CancelToken::new(),
            &mut |stage| stages.push(stage),
        )?;
        assert_eq!(
            prepared.payload(),
            &AttachmentPayload::Remote {
                uri: "https://files.test/v1beta/files/xyz".to_string()
            }
        );
        assert_eq!(prepared.size_bytes(), 32);
        assert_eq!(stages, vec![UploadStage::Ready]);
        Ok(())
    }

    #[test]
    fn prepare_leaves_images_and_keyless_videos_inline() -> anyhow::Result<()> {
        let image = AttachmentRef::inline(AttachmentKind::Image, "image/png", vec![1, 2]);
        let prepared = offline_gateway().prepare(image.clone(), &CancelToken::new(), &mut |_| {})?;
        assert_eq!(prepared, image);

        let video = AttachmentRef::inline(AttachmentKind::Video, "video/mp4", vec![1, 2]);
        let keyless = GeminiGateway::with_settings("http://127.0.0.1:9/v1beta", None);
        assert_eq!(keyless.prepare(video.clone(), &CancelToken::new(), &mut |_| {})?, video);
        Ok(())
    }

    #[test]
    fn active_file_reports_ready_and_returns_uri() -> anyhow::Result<()> {
        let file = json!({"name": "files/abc", "state": "ACTIVE", "uri": "https://files.test/abc"});
        let mut stages = Vec::new();
        let uri = offline_gateway().wait_until_active(
            &file,
            "test-key",
            &CancelToken::new(),
            &mut |stage| stages.push(stage),
        )?;
        assert_eq!(uri, "https://files.test/abc");
        assert_eq!(stages, vec![UploadStage::Ready]);
        Ok(())
    }

    #[test]
    fn failed_processing_is_permanent() {
        let file = json!({"name": "files/abc", "state": "FAILED"});
        let err = offline_gateway()
            .wait_until_active(&file, "test-key", &CancelToken::new(), &mut |_| {})
            .err();
        assert_eq!(
            err.as_ref().and_then(ChatError::provider_kind),
            Some(ProviderErrorKind::Permanent)
        );
    }

    #[test]
    fn cancel_while_processing_stops_polling() {
        let mut gateway = offline_gateway();
        gateway.poll_interval = Duration::from_secs(30);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut stages = Vec::new();

        let file = json!({"name": "files/abc", "state": "PROCESSING"});
        let err = gateway
            .wait_until_active(&file, "test-key", &cancel, &mut |stage| stages.push(stage))
            .err();
        assert!(matches!(err, Some(ChatError::Cancelled)));
        assert_eq!(stages, vec![UploadStage::Processing { check: 1 }]);
    }
}
