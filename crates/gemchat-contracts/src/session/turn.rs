use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(ChatError::MalformedHistory(format!(
                "unknown role '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttachmentKind {
    Image,
    Video,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// Top-level MIME type family for this kind.
    pub fn mime_prefix(self) -> &'static str {
        match self {
            Self::Image => "image/",
            Self::Video => "video/",
        }
    }

    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let lowered = mime_type.trim().to_ascii_lowercase();
        if lowered.starts_with("image/") {
            Some(Self::Image)
        } else if lowered.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        match raw {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            other => Err(ChatError::MalformedHistory(format!(
                "unknown attachment kind '{other}'"
            ))),
        }
    }
}

/// Where the bytes of an attachment live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttachmentPayload {
    Inline(Vec<u8>),
    /// Already hosted by the provider (e.g. an uploaded file URI).
    Remote { uri: String },
    /// Metadata only. Produced by loading a saved conversation.
    Detached,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentMeta {
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentRef {
    meta: AttachmentMeta,
    payload: AttachmentPayload,
}

impl AttachmentRef {
    pub fn inline(kind: AttachmentKind, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            meta: AttachmentMeta {
                kind,
                mime_type: mime_type.into(),
                size_bytes: bytes.len() as u64,
            },
            payload: AttachmentPayload::Inline(bytes),
        }
    }

    pub fn remote(
        kind: AttachmentKind,
        mime_type: impl Into<String>,
        size_bytes: u64,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            meta: AttachmentMeta {
                kind,
                mime_type: mime_type.into(),
                size_bytes,
            },
            payload: AttachmentPayload::Remote { uri: uri.into() },
        }
    }

    pub fn detached(meta: AttachmentMeta) -> Self {
        Self {
            meta,
            payload: AttachmentPayload::Detached,
        }
    }

    pub fn meta(&self) -> &AttachmentMeta {
        &self.meta
    }

    pub fn kind(&self) -> AttachmentKind {
        self.meta.kind
    }

    pub fn mime_type(&self) -> &str {
        &self.meta.mime_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    pub fn payload(&self) -> &AttachmentPayload {
        &self.payload
    }

    pub fn is_materialized(&self) -> bool {
        match &self.payload {
            AttachmentPayload::Inline(bytes) => bytes.len() as u64 == self.meta.size_bytes,
            AttachmentPayload::Remote { uri } => !uri.trim().is_empty(),
            AttachmentPayload::Detached => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    role: Role,
    text: String,
    attachments: Vec<AttachmentRef>,
    timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        role: Role,
        text: impl Into<String>,
        attachments: Vec<AttachmentRef>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            role,
            text: text.into(),
            attachments,
            timestamp,
        }
    }

    pub fn user(text: impl Into<String>, attachments: Vec<AttachmentRef>) -> Self {
        Self::new(Role::User, text, attachments, Utc::now())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text, Vec::new(), Utc::now())
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text, Vec::new(), Utc::now())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attachments(&self) -> &[AttachmentRef] {
        &self.attachments
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn has_attachment_kind(&self, kind: AttachmentKind) -> bool {
        self.attachments
            .iter()
            .any(|attachment| attachment.kind() == kind)
    }

    /// Equality over everything that survives a save/load round trip.
    pub fn same_record(&self, other: &Turn) -> bool {
        self.role == other.role
            && self.text == other.text
            && self.timestamp == other.timestamp
            && self.attachments.len() == other.attachments.len()
            && self
                .attachments
                .iter()
                .zip(other.attachments.iter())
                .all(|(left, right)| left.meta() == right.meta())
    }

    pub fn to_record(&self) -> TurnRecord {
        TurnRecord {
            role: self.role.as_str().to_string(),
            text: self.text.clone(),
            timestamp: format_timestamp(self.timestamp),
            attachments: self
                .attachments
                .iter()
                .map(|attachment| AttachmentRecord {
                    kind: attachment.kind().as_str().to_string(),
                    mime_type: attachment.mime_type().to_string(),
                    size_bytes: attachment.size_bytes(),
                })
                .collect(),
        }
    }
}

/// Wire form of a turn inside a saved conversation file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: String,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub kind: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl TryFrom<AttachmentRecord> for AttachmentRef {
    type Error = ChatError;

    fn try_from(record: AttachmentRecord) -> ChatResult<Self> {
        let kind: AttachmentKind = record.kind.parse()?;
        if AttachmentKind::from_mime(&record.mime_type) != Some(kind) {
            return Err(ChatError::MalformedHistory(format!(
                "attachment kind '{}' does not match MIME type '{}'",
                kind, record.mime_type
            )));
        }
        Ok(AttachmentRef::detached(AttachmentMeta {
            kind,
            mime_type: record.mime_type,
            size_bytes: record.size_bytes,
        }))
    }
}

impl TryFrom<TurnRecord> for Turn {
    type Error = ChatError;

    fn try_from(record: TurnRecord) -> ChatResult<Self> {
        let role: Role = record.role.parse()?;
        let timestamp = parse_timestamp(&record.timestamp)?;
        let attachments = record
            .attachments
            .into_iter()
            .map(AttachmentRef::try_from)
            .collect::<ChatResult<Vec<AttachmentRef>>>()?;
        Ok(Turn::new(role, record.text, attachments, timestamp))
    }
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(raw: &str) -> ChatResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| ChatError::MalformedHistory(format!("invalid timestamp '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        AttachmentKind, AttachmentRecord, AttachmentRef, Role, Turn, TurnRecord,
    };
    use crate::error::ChatError;

    #[test]
    fn record_conversion_preserves_metadata_and_drops_payload() -> anyhow::Result<()> {
        let stamp = Utc.with_ymd_and_hms(2024, 12, 20, 9, 30, 0).unwrap();
        let turn = Turn::new(
            Role::User,
            "what is this?",
            vec![AttachmentRef::inline(
                AttachmentKind::Image,
                "image/png",
                vec![1, 2, 3, 4],
            )],
            stamp,
        );

        let record = turn.to_record();
        assert_eq!(record.role, "user");
        assert_eq!(record.timestamp, "2024-12-20T09:30:00Z");
        assert_eq!(record.attachments[0].size_bytes, 4);

        let restored = Turn::try_from(record)?;
        assert!(restored.same_record(&turn));
        assert!(!restored.attachments()[0].is_materialized());
        assert_ne!(restored, turn);
        Ok(())
    }

    #[test]
    fn sub_second_timestamps_survive_formatting() -> anyhow::Result<()> {
        let turn = Turn::assistant("hello");
        let restored = Turn::try_from(turn.to_record())?;
        assert_eq!(restored.timestamp(), turn.timestamp());
        Ok(())
    }

    #[test]
    fn unknown_role_is_malformed() {
        let record = TurnRecord {
            role: "moderator".to_string(),
            text: "hi".to_string(),
            timestamp: "2024-12-20T09:30:00Z".to_string(),
            attachments: Vec::new(),
        };
        let err = Turn::try_from(record).err();
        assert!(matches!(err, Some(ChatError::MalformedHistory(_))));
    }

    #[test]
    fn display_only_timestamp_is_malformed() {
        let record = TurnRecord {
            role: "user".to_string(),
            text: "hi".to_string(),
            timestamp: "09:30 AM".to_string(),
            attachments: Vec::new(),
        };
        let err = Turn::try_from(record).err();
        assert!(matches!(err, Some(ChatError::MalformedHistory(_))));
    }

    #[test]
    fn attachment_kind_must_match_mime_family() {
        let record = AttachmentRecord {
            kind: "image".to_string(),
            mime_type: "video/mp4".to_string(),
            size_bytes: 10,
        };
        assert!(AttachmentRef::try_from(record).is_err());

        let record = AttachmentRecord {
            kind: "audio".to_string(),
            mime_type: "audio/mpeg".to_string(),
            size_bytes: 10,
        };
        assert!(AttachmentRef::try_from(record).is_err());
    }

    #[test]
    fn inline_payload_is_materialized_and_remote_needs_uri() {
        let inline = AttachmentRef::inline(AttachmentKind::Video, "video/mp4", vec![0; 16]);
        assert!(inline.is_materialized());
        assert_eq!(inline.size_bytes(), 16);

        let remote = AttachmentRef::remote(AttachmentKind::Video, "video/mp4", 16, " ");
        assert!(!remote.is_materialized());
    }
}
