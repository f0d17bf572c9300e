use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use gemchat_contracts::session::{AttachmentKind, AttachmentRef};
use gemchat_contracts::{ChatError, ChatResult};

use crate::cancel::CancelToken;

pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];

/// Where the raw bytes of an upload come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RawUpload {
    pub file_name: String,
    pub declared_mime: Option<String>,
    pub source: UploadSource,
}

impl RawUpload {
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            declared_mime: None,
            source: UploadSource::Bytes(bytes),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            file_name,
            declared_mime: None,
            source: UploadSource::Path(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.processed_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug)]
pub enum NormalizeEvent {
    Progress(Progress),
    Completed(AttachmentRef),
    Failed(ChatError),
}

/// Turns raw uploads into canonical `AttachmentRef`s.
///
/// Images are sniffed and the detected MIME type wins over the declared one.
/// Videos are typed from the declared MIME type or the file extension.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    chunk_bytes: usize,
    max_image_bytes: u64,
    max_video_bytes: u64,
}

impl Default for AttachmentStore {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_image_bytes: MAX_IMAGE_BYTES,
            max_video_bytes: MAX_VIDEO_BYTES,
        }
    }
}

impl AttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    pub fn with_limits(mut self, max_image_bytes: u64, max_video_bytes: u64) -> Self {
        self.max_image_bytes = max_image_bytes;
        self.max_video_bytes = max_video_bytes;
        self
    }

    /// Kind and provisional MIME type, before any bytes are read.
    pub fn resolve_kind(&self, upload: &RawUpload) -> ChatResult<(AttachmentKind, String)> {
        let mime_type = upload
            .declared_mime
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty() && value != "application/octet-stream")
            .or_else(|| {
                mime_guess::from_path(&upload.file_name)
                    .first_raw()
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                ChatError::unsupported_media(&upload.file_name, "unknown media type")
            })?;

        let Some(kind) = AttachmentKind::from_mime(&mime_type) else {
            return Err(ChatError::unsupported_media(
                &upload.file_name,
                format!("'{mime_type}' is not an image or video"),
            ));
        };
        match kind {
            AttachmentKind::Image => Ok((kind, mime_type)),
            AttachmentKind::Video => canonical_video_mime(&mime_type)
                .map(|canonical| (kind, canonical.to_string()))
                .ok_or_else(|| {
                    ChatError::unsupported_media(
                        &upload.file_name,
                        format!("video format '{mime_type}' is not supported"),
                    )
                }),
        }
    }

    pub fn normalize(&self, upload: RawUpload) -> ChatResult<AttachmentRef> {
        self.normalize_with(upload, &CancelToken::new(), |_| {})
    }

    /// Reads and validates the upload, reporting monotonically increasing
    /// progress. The token is checked between chunks.
    pub fn normalize_with(
        &self,
        upload: RawUpload,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(Progress),
    ) -> ChatResult<AttachmentRef> {
        let (kind, declared_mime) = self.resolve_kind(&upload)?;
        let limit = match kind {
            AttachmentKind::Image => self.max_image_bytes,
            AttachmentKind::Video => self.max_video_bytes,
        };
        let file_name = upload.file_name.clone();

        let bytes = match upload.source {
            UploadSource::Bytes(bytes) => {
                check_size(&file_name, bytes.len() as u64, limit)?;
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                let total = bytes.len() as u64;
                on_progress(Progress {
                    processed_bytes: total,
                    total_bytes: total,
                });
                bytes
            }
            UploadSource::Path(path) => {
                let total = std::fs::metadata(&path)
                    .map_err(|err| ChatError::io(&path, err))?
                    .len();
                check_size(&file_name, total, limit)?;
                read_chunked(&path, total, self.chunk_bytes, cancel, &mut on_progress)?
            }
        };

        match kind {
            AttachmentKind::Image => {
                let mime_type = sniff_image_mime(&file_name, &bytes)?;
                Ok(AttachmentRef::inline(kind, mime_type, bytes))
            }
            AttachmentKind::Video => Ok(AttachmentRef::inline(kind, declared_mime, bytes)),
        }
    }

    /// Runs `normalize_with` on a worker thread and streams its events.
    pub fn spawn_normalize(&self, upload: RawUpload, cancel: CancelToken) -> NormalizeJob {
        let (tx, rx) = mpsc::channel();
        let store = self.clone();
        let worker_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name("gemchat-normalize".to_string())
            .spawn(move || {
                let progress_tx = tx.clone();
                let outcome = store.normalize_with(upload, &worker_cancel, |progress| {
                    let _ = progress_tx.send(NormalizeEvent::Progress(progress));
                });
                let terminal = match outcome {
                    Ok(attachment) => NormalizeEvent::Completed(attachment),
                    Err(err) => NormalizeEvent::Failed(err),
                };
                let _ = tx.send(terminal);
            });

        match spawned {
            Ok(handle) => NormalizeJob {
                events: rx,
                handle: Some(handle),
                cancel,
                finished: false,
            },
            Err(err) => {
                let (tx, rx) = mpsc::channel();
                let _ = tx.send(NormalizeEvent::Failed(ChatError::io(
                    "normalize worker",
                    err,
                )));
                NormalizeJob {
                    events: rx,
                    handle: None,
                    cancel,
                    finished: false,
                }
            }
        }
    }
}

/// A running normalization. Dropping it cancels the work.
pub struct NormalizeJob {
    events: mpsc::Receiver<NormalizeEvent>,
    handle: Option<thread::JoinHandle<()>>,
    cancel: CancelToken,
    finished: bool,
}

impl NormalizeJob {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, waiting at most `timeout`. `None` means nothing yet or the
    /// job already delivered its terminal event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<NormalizeEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(mpsc::RecvTimeoutError::Timeout) => return None,
            Err(mpsc::RecvTimeoutError::Disconnected) => NormalizeEvent::Failed(ChatError::Cancelled),
        };
        if !matches!(event, NormalizeEvent::Progress(_)) {
            self.finished = true;
        }
        Some(event)
    }

    pub fn wait(mut self, mut on_progress: impl FnMut(Progress)) -> ChatResult<AttachmentRef> {
        loop {
            match self.next_timeout(Duration::from_millis(200)) {
                Some(NormalizeEvent::Progress(progress)) => on_progress(progress),
                Some(NormalizeEvent::Completed(attachment)) => return Ok(attachment),
                Some(NormalizeEvent::Failed(err)) => return Err(err),
                None if self.finished => return Err(ChatError::Cancelled),
                None => continue,
            }
        }
    }
}

impl Drop for NormalizeJob {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn check_size(file_name: &str, size: u64, limit: u64) -> ChatResult<()> {
    if size == 0 {
        return Err(ChatError::unsupported_media(file_name, "upload is empty"));
    }
    if size > limit {
        return Err(ChatError::unsupported_media(
            file_name,
            format!("{size} bytes exceeds the {limit} byte limit"),
        ));
    }
    Ok(())
}

fn read_chunked(
    path: &Path,
    total: u64,
    chunk_bytes: usize,
    cancel: &CancelToken,
    on_progress: &mut impl FnMut(Progress),
) -> ChatResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| ChatError::io(path, err))?;
    let mut bytes = Vec::with_capacity(total as usize);
    let mut chunk = vec![0u8; chunk_bytes];
    loop {
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        let read = file
            .read(&mut chunk)
            .map_err(|err| ChatError::io(path, err))?;
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
        on_progress(Progress {
            processed_bytes: bytes.len() as u64,
            total_bytes: total.max(bytes.len() as u64),
        });
    }
    Ok(bytes)
}

fn sniff_image_mime(file_name: &str, bytes: &[u8]) -> ChatResult<&'static str> {
    let format = image::guess_format(bytes).map_err(|_| {
        ChatError::unsupported_media(file_name, "content is not a recognizable image")
    })?;
    let mime_type = format.to_mime_type();
    if !IMAGE_MIME_TYPES.contains(&mime_type) {
        return Err(ChatError::unsupported_media(
            file_name,
            format!("image format '{mime_type}' is not supported"),
        ));
    }
    Ok(mime_type)
}

fn canonical_video_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "video/mp4" => Some("video/mp4"),
        "video/mpeg" | "video/mpg" => Some("video/mpeg"),
        "video/quicktime" | "video/mov" => Some("video/mov"),
        "video/x-msvideo" | "video/avi" => Some("video/avi"),
        "video/x-flv" => Some("video/x-flv"),
        "video/webm" => Some("video/webm"),
        "video/x-ms-wmv" | "video/wmv" => Some("video/wmv"),
        "video/3gpp" => Some("video/3gpp"),
        _ => None,
    }
}
