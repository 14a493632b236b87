//! Common types for the Shelter environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a scheduled timer task.
///
/// A fresh id is minted for every schedule, so a stale callback can be
/// recognised by comparing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Creates a new random TaskId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Endpoints exposed by the simulation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    LiveState,
    AiList,
    Status,
    Proposals,
    Events,
    AiDecisions,
    AiDecision(String),
    RunNext,
    Reset,
    Vote(String),
}

impl Endpoint {
    /// Path relative to the service base URL.
    pub fn path(&self) -> String {
        match self {
            Endpoint::LiveState => "live_state".to_string(),
            Endpoint::AiList => "ai_list".to_string(),
            Endpoint::Status => "status".to_string(),
            Endpoint::Proposals => "proposals".to_string(),
            Endpoint::Events => "events".to_string(),
            Endpoint::AiDecisions => "ai_decisions".to_string(),
            Endpoint::AiDecision(name) => format!("ai/{}/decision", name),
            Endpoint::RunNext => "run_next".to_string(),
            Endpoint::Reset => "reset".to_string(),
            Endpoint::Vote(id) => format!("proposals/{}/vote", id),
        }
    }

    /// Parses a path back into an endpoint (used by in-process engines).
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            ["live_state"] => Some(Endpoint::LiveState),
            ["ai_list"] => Some(Endpoint::AiList),
            ["status"] => Some(Endpoint::Status),
            ["proposals"] => Some(Endpoint::Proposals),
            ["events"] => Some(Endpoint::Events),
            ["ai_decisions"] => Some(Endpoint::AiDecisions),
            ["ai", name, "decision"] => Some(Endpoint::AiDecision(name.to_string())),
            ["run_next"] => Some(Endpoint::RunNext),
            ["reset"] => Some(Endpoint::Reset),
            ["proposals", id, "vote"] => Some(Endpoint::Vote(id.to_string())),
            _ => None,
        }
    }
}
