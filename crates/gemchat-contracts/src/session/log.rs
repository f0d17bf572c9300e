use serde_json::Value;

use super::turn::{Turn, TurnRecord};
use crate::error::{ChatError, ChatResult};

/// Ordered, append-only conversation history.
///
/// Insertion order is chronological order. The only ways to remove turns are
/// `clear` and a wholesale `replace`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageLog {
    turns: Vec<Turn>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn append(&mut self, turn: Turn) -> ChatResult<()> {
        Self::check_appendable(&turn)?;
        self.turns.push(turn);
        Ok(())
    }

    /// Appends every turn or none of them.
    pub fn append_all(&mut self, turns: Vec<Turn>) -> ChatResult<()> {
        for turn in &turns {
            Self::check_appendable(turn)?;
        }
        self.turns.extend(turns);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Validates every record before swapping; on failure the log is untouched.
    pub fn replace(&mut self, records: Vec<TurnRecord>) -> ChatResult<()> {
        let turns = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| {
                Turn::try_from(record).map_err(|err| match err {
                    ChatError::MalformedHistory(reason) => {
                        ChatError::MalformedHistory(format!("turn {idx}: {reason}"))
                    }
                    other => other,
                })
            })
            .collect::<ChatResult<Vec<Turn>>>()?;
        self.turns = turns;
        Ok(())
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.turns.iter().map(Turn::to_record).collect()
    }

    pub fn serialize(&self) -> ChatResult<Value> {
        serde_json::to_value(self.records())
            .map_err(|err| ChatError::MalformedHistory(format!("serialize turns: {err}")))
    }

    pub fn deserialize(doc: &Value) -> ChatResult<Vec<Turn>> {
        let records: Vec<TurnRecord> = serde_json::from_value(doc.clone())
            .map_err(|err| ChatError::MalformedHistory(format!("turns: {err}")))?;
        let mut staged = MessageLog::new();
        staged.replace(records)?;
        Ok(staged.turns)
    }

    fn check_appendable(turn: &Turn) -> ChatResult<()> {
        if let Some(idx) = turn
            .attachments()
            .iter()
            .position(|attachment| !attachment.is_materialized())
        {
            return Err(ChatError::InvalidTurn(format!(
                "attachment {idx} ({}) has no materialized payload",
                turn.attachments()[idx].kind()
            )));
        }
        Ok(())
    }
}
