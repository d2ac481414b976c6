//! Message envelope passed between phase workers
//!
//! Workers hand each other file paths and usage counters rather than large
//! content. The orchestrator only reads the standard fields of [`PhaseOutput`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

use crate::{PesError, Result};

/// Declared content kind of a message body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    #[default]
    #[serde(rename = "application/json")]
    ApplicationJson,
    #[serde(rename = "text/plain")]
    TextPlain,
}

/// Structured message with a declared content kind and a free-form body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub mime_type: MimeType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn from_json(data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            mime_type: MimeType::ApplicationJson,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mime_type: MimeType::TextPlain,
            data: Value::String(text.into()),
            created_at: Utc::now(),
        }
    }

    /// Wrap the standard phase fields into a JSON message
    pub fn from_output(output: &PhaseOutput) -> Result<Self> {
        Ok(Self::from_json(serde_json::to_value(output)?))
    }

    /// Empty JSON message, used to start an iteration
    pub fn empty() -> Self {
        Self::from_json(Value::Object(Default::default()))
    }

    /// Read the standard phase fields; unknown fields are ignored
    pub fn output(&self) -> Result<PhaseOutput> {
        match self.mime_type {
            MimeType::ApplicationJson => Ok(serde_json::from_value(self.data.clone())?),
            MimeType::TextPlain => Err(PesError::Validation(
                "expected an application/json message body".to_string(),
            )),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.data.as_str()
    }
}

/// Standard fields exchanged between phases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_info_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_plan_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_solution_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_evaluation_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_summary_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl PhaseOutput {
    /// Overlay the fields set in `newer` onto `self`
    ///
    /// Paths from later phases win; usage counters accumulate.
    pub fn merge(&mut self, newer: PhaseOutput) {
        fn pick(slot: &mut Option<PathBuf>, newer: Option<PathBuf>) {
            if newer.is_some() {
                *slot = newer;
            }
        }
        fn add(slot: &mut Option<u64>, newer: Option<u64>) {
            if let Some(n) = newer {
                *slot = Some(slot.unwrap_or(0) + n);
            }
        }

        pick(&mut self.parent_info_file_path, newer.parent_info_file_path);
        pick(&mut self.best_plan_file_path, newer.best_plan_file_path);
        pick(&mut self.best_solution_file_path, newer.best_solution_file_path);
        pick(
            &mut self.best_evaluation_file_path,
            newer.best_evaluation_file_path,
        );
        pick(&mut self.best_summary_file_path, newer.best_summary_file_path);
        add(&mut self.total_prompt_tokens, newer.total_prompt_tokens);
        add(
            &mut self.total_completion_tokens,
            newer.total_completion_tokens,
        );
        add(&mut self.duration_ms, newer.duration_ms);
    }
}
