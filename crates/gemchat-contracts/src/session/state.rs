use std::path::Path;

use serde::{Deserialize, Serialize};

use super::config::{ConfigRecord, ConfigUpdate, SessionConfig};
use super::log::MessageLog;
use super::turn::{Turn, TurnRecord};
use crate::error::{ChatError, ChatResult};

/// On-disk shape of a saved conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub config: ConfigRecord,
    pub turns: Vec<TurnRecord>,
}

impl SessionDocument {
    pub fn from_json(raw: &str) -> ChatResult<Self> {
        serde_json::from_str(raw).map_err(|err| ChatError::MalformedHistory(err.to_string()))
    }

    pub fn read(path: &Path) -> ChatResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| ChatError::io(path, err))?;
        Self::from_json(&raw)
    }
}

/// One live conversation: its history plus the settings for the next call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    log: MessageLog,
    config: SessionConfig,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            log: MessageLog::new(),
            config,
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn turns(&self) -> &[Turn] {
        self.log.turns()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_config(&mut self, update: &ConfigUpdate) -> ChatResult<()> {
        self.config = self.config.merged(update)?;
        Ok(())
    }

    pub fn append(&mut self, turn: Turn) -> ChatResult<()> {
        self.log.append(turn)
    }

    /// Commits a user turn and its reply as one step.
    pub fn append_exchange(&mut self, user: Turn, reply: Turn) -> ChatResult<()> {
        self.log.append_all(vec![user, reply])
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn to_document(&self) -> SessionDocument {
        SessionDocument {
            config: self.config.to_record(),
            turns: self.log.records(),
        }
    }

    pub fn save(&self, destination: &Path) -> ChatResult<()> {
        let encoded = serde_json::to_string_pretty(&self.to_document())
            .map_err(|err| ChatError::io(destination, std::io::Error::other(err)))?;
        if let Some(parent) = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent).map_err(|err| ChatError::io(parent, err))?;
        }
        std::fs::write(destination, encoded).map_err(|err| ChatError::io(destination, err))
    }

    pub fn load(&mut self, source: &Path) -> ChatResult<()> {
        let document = SessionDocument::read(source)?;
        self.apply_document(document)
    }

    /// All-or-nothing: config and turns are validated before either is stored.
    pub fn apply_document(&mut self, document: SessionDocument) -> ChatResult<()> {
        let config = SessionConfig::try_from(document.config)
            .map_err(|err| match err {
                ChatError::MalformedHistory(reason) => {
                    ChatError::MalformedHistory(format!("config: {reason}"))
                }
                other => other,
            })?;
        self.log.replace(document.turns)?;
        self.config = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::{SessionDocument, SessionState};
    use crate::error::ChatError;
    use crate::session::config::{ConfigUpdate, ModelName, SessionConfig};
    use crate::session::turn::{AttachmentKind, AttachmentRef, Turn};

    fn populated_state() -> anyhow::Result<SessionState> {
        let mut state = SessionState::with_config(SessionConfig {
            model_name: ModelName::Gemini20FlashExp,
            temperature: 0.3,
            system_prompt: "Answer tersely.".to_string(),
        });
        state.append_exchange(
            Turn::user(
                "what is in this clip?",
                vec![AttachmentRef::inline(
                    AttachmentKind::Video,
                    "video/mp4",
                    vec![0; 64],
                )],
            ),
            Turn::assistant("A dog catching a frisbee."),
        )?;
        state.append(Turn::system("note: video processed"))?;
        Ok(state)
    }

    #[test]
    fn save_then_load_restores_records_and_config() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("conversation.json");
        let state = populated_state()?;
        state.save(&path)?;

        let mut restored = SessionState::new();
        restored.load(&path)?;
        assert_eq!(restored.config(), state.config());
        assert_eq!(restored.turns().len(), 3);
        assert!(restored
            .turns()
            .iter()
            .zip(state.turns())
            .all(|(left, right)| left.same_record(right)));
        Ok(())
    }

    #[test]
    fn saved_file_matches_documented_schema() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("conversation.json");
        populated_state()?.save(&path)?;

        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(parsed["config"]["modelName"], json!("gemini-2.0-flash-exp"));
        assert_eq!(parsed["config"]["temperature"], json!(0.3));
        assert_eq!(parsed["config"]["systemPrompt"], json!("Answer tersely."));
        assert_eq!(parsed["turns"][0]["role"], json!("user"));
        assert_eq!(parsed["turns"][0]["attachments"][0]["kind"], json!("video"));
        assert_eq!(parsed["turns"][0]["attachments"][0]["sizeBytes"], json!(64));
        assert_eq!(parsed["turns"][1]["role"], json!("assistant"));
        assert_eq!(parsed["turns"][2]["role"], json!("system"));
        Ok(())
    }

    #[test]
    fn failed_load_leaves_state_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.json");
        fs::write(
            &path,
            serde_json::to_string(&json!({
                "config": {"modelName": "gemini-exp-1206", "temperature": 0.9, "systemPrompt": ""},
                "turns": [
                    {"role": "user", "text": "hi", "timestamp": "2024-12-20T09:30:00Z", "attachments": []},
                    {"role": "assistant", "text": "hello", "timestamp": "yesterday", "attachments": []}
                ]
            }))?,
        )?;

        let mut state = populated_state()?;
        let before = state.clone();
        let err = state.load(&path).err();
        assert!(matches!(err, Some(ChatError::MalformedHistory(_))));
        assert_eq!(state, before);
        Ok(())
    }

    #[test]
    fn bad_config_in_file_keeps_turns_and_config() -> anyhow::Result<()> {
        let mut state = populated_state()?;
        let before = state.clone();
        let document = SessionDocument::from_json(
            r#"{"config": {"modelName": "gemini-exp-1206", "temperature": 3.0, "systemPrompt": ""}, "turns": []}"#,
        )?;
        let err = state.apply_document(document).err();
        assert!(matches!(err, Some(ChatError::MalformedHistory(ref msg)) if msg.starts_with("config")));
        assert_eq!(state, before);
        Ok(())
    }

    #[test]
    fn missing_file_is_io_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut state = populated_state()?;
        let before = state.clone();
        let err = state.load(&temp.path().join("nope.json")).err();
        assert!(matches!(err, Some(ChatError::Io { .. })));
        assert_eq!(state, before);
        Ok(())
    }

    #[test]
    fn not_json_is_malformed_history() {
        let err = SessionDocument::from_json("{\"messages\": [").err();
        assert!(matches!(err, Some(ChatError::MalformedHistory(_))));
    }

    #[test]
    fn save_into_directory_path_is_io_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let state = populated_state()?;
        let err = state.save(temp.path()).err();
        assert!(matches!(err, Some(ChatError::Io { .. })));
        Ok(())
    }

    #[test]
    fn clear_keeps_config() -> anyhow::Result<()> {
        let mut state = populated_state()?;
        let config = state.config().clone();
        state.clear();
        assert!(state.turns().is_empty());
        assert_eq!(state.config(), &config);
        Ok(())
    }

    #[test]
    fn rejected_temperature_keeps_previous_value() -> anyhow::Result<()> {
        let mut state = populated_state()?;
        let err = state.set_config(&ConfigUpdate::temperature(2.5)).err();
        assert!(matches!(err, Some(ChatError::InvalidConfig(_))));
        assert_eq!(state.config().temperature, 0.3);
        Ok(())
    }
}
