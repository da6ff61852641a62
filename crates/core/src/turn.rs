//! Conversation turns — the unit of recency memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
    Tool,
}

impl TurnRole {
    /// Human-readable label used when rendering a turn into context.
    pub fn label(self) -> &'static str {
        match self {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
            TurnRole::System => "System",
            TurnRole::Tool => "Tool",
        }
    }
}

/// A single conversation turn.
///
/// Immutable after ingestion. Owned by the active window until evicted,
/// then by the compression tier (as part of a summary's source set).
/// `truncated` records that the text was cut at ingestion because the
/// turn alone exceeded the window maximum — oversized turns are
/// truncated with a flag, never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    #[serde(default)]
    pub truncated: bool,
}

impl Turn {
    pub fn new(role: TurnRole, text: impl Into<String>, token_count: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            token_count,
            truncated: false,
        }
    }

    pub fn user(text: impl Into<String>, token_count: usize) -> Self {
        Self::new(TurnRole::User, text, token_count)
    }

    pub fn assistant(text: impl Into<String>, token_count: usize) -> Self {
        Self::new(TurnRole::Assistant, text, token_count)
    }

    /// One-line rendering used by the active-window section.
    pub fn render(&self) -> String {
        format!("{}: {}", self.role.label(), self.text)
    }
}
