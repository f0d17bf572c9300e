use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Chat models a session may be configured with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ModelName {
    #[default]
    GeminiExp1206,
    Gemini20FlashExp,
}

impl ModelName {
    pub const ALL: [ModelName; 2] = [Self::GeminiExp1206, Self::Gemini20FlashExp];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeminiExp1206 => "gemini-exp-1206",
            Self::Gemini20FlashExp => "gemini-2.0-flash-exp",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        let trimmed = raw.trim();
        let name = trimmed.strip_prefix("models/").unwrap_or(trimmed);
        Self::ALL
            .into_iter()
            .find(|model| model.as_str() == name)
            .ok_or_else(|| {
                let known = Self::ALL
                    .iter()
                    .map(|model| model.as_str())
                    .collect::<Vec<&str>>()
                    .join(", ");
                ChatError::InvalidConfig(format!("unknown model '{trimmed}' (expected one of: {known})"))
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub model_name: ModelName,
    pub temperature: f64,
    pub system_prompt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_name: ModelName::default(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Partial update; `None` fields are left as they are.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigUpdate {
    pub model_name: Option<ModelName>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
}

impl ConfigUpdate {
    pub fn model(model_name: ModelName) -> Self {
        Self {
            model_name: Some(model_name),
            ..Self::default()
        }
    }

    pub fn temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
            ..Self::default()
        }
    }

    pub fn system_prompt(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.model_name.is_none() && self.temperature.is_none() && self.system_prompt.is_none()
    }
}

impl SessionConfig {
    pub fn validate_temperature(temperature: f64) -> ChatResult<f64> {
        if !temperature.is_finite() || !TEMPERATURE_RANGE.contains(&temperature) {
            return Err(ChatError::InvalidConfig(format!(
                "temperature {temperature} outside [{}, {}]",
                TEMPERATURE_RANGE.start(),
                TEMPERATURE_RANGE.end()
            )));
        }
        Ok(temperature)
    }

    /// Returns a new config with `update` applied; `self` is never touched.
    pub fn merged(&self, update: &ConfigUpdate) -> ChatResult<Self> {
        let mut next = self.clone();
        if let Some(model_name) = update.model_name {
            next.model_name = model_name;
        }
        if let Some(temperature) = update.temperature {
            next.temperature = Self::validate_temperature(temperature)?;
        }
        if let Some(prompt) = update.system_prompt.as_ref() {
            next.system_prompt = prompt.clone();
        }
        Ok(next)
    }

    pub fn to_record(&self) -> ConfigRecord {
        ConfigRecord {
            model_name: self.model_name.as_str().to_string(),
            temperature: self.temperature,
            system_prompt: self.system_prompt.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    pub model_name: String,
    pub temperature: f64,
    pub system_prompt: String,
}

impl TryFrom<ConfigRecord> for SessionConfig {
    type Error = ChatError;

    fn try_from(record: ConfigRecord) -> ChatResult<Self> {
        let model_name = record
            .model_name
            .parse::<ModelName>()
            .map_err(|err| ChatError::MalformedHistory(err.to_string()))?;
        let temperature = Self::validate_temperature(record.temperature)
            .map_err(|err| ChatError::MalformedHistory(err.to_string()))?;
        Ok(Self {
            model_name,
            temperature,
            system_prompt: record.system_prompt,
        })
    }
}
