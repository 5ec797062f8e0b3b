use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Streaming,
    Done,
    Failed,
}

/// One analysis activation: created when an analysis is requested, replaced
/// when a new one starts.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSession {
    pub id: Uuid,
    pub chain_key: String,
    pub categories: Vec<String>,
    pub prompt_text: Option<String>,
    pub accumulated: String,
    pub state: SessionState,
}

impl AnalysisSession {
    pub fn new(chain_key: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_key: chain_key.into(),
            categories,
            prompt_text: None,
            accumulated: String::new(),
            state: SessionState::Pending,
        }
    }
}
