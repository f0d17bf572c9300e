mod config;
mod log;
mod state;
mod turn;

pub use config::{
    ConfigRecord, ConfigUpdate, ModelName, SessionConfig, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_TEMPERATURE, TEMPERATURE_RANGE,
};
pub use log::MessageLog;
pub use state::{SessionDocument, SessionState};
pub use turn::{
    format_timestamp, parse_timestamp, AttachmentKind, AttachmentMeta, AttachmentPayload,
    AttachmentRecord, AttachmentRef, Role, Turn, TurnRecord,
};
