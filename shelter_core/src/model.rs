//! Domain model for the observed simulation.
//!
//! These are the fully-typed records every engine works with. Raw service
//! payloads never reach this layer: the snapshot client decodes and defaults
//! them first (see `snapshot`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// SYSTEM STATE
// =============================================================================

/// Shelter-wide counters reported by `status` and `run_next`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub day: u32,
    pub remaining_resources: f64,
    pub total_resources: f64,
    /// Integer percentage, 0-100.
    pub system_efficiency: u8,
    pub elimination_count: u32,
    pub allocation_method: String,
    pub token_budget: u64,
    pub total_token_consumed: u64,
}

impl SystemState {
    /// Remaining resources as a percentage of the total, one decimal place.
    ///
    /// Returns 0.0 when the total is unknown.
    pub fn remaining_percentage(&self) -> f64 {
        if self.total_resources <= 0.0 {
            return 0.0;
        }
        let pct = self.remaining_resources / self.total_resources * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// Converts the service's 0-1 efficiency fraction to an integer percentage.
pub fn efficiency_percent(fraction: f64) -> u8 {
    if !fraction.is_finite() {
        return 0;
    }
    (fraction * 100.0).round().clamp(0.0, 100.0) as u8
}

// =============================================================================
// PROPOSALS
// =============================================================================

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Voting,
    Approved,
    Rejected,
}

impl ProposalStatus {
    /// Parses the service's status string; unknown values map to `Pending`.
    pub fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "voting" => Self::Voting,
            "approved" | "passed" => Self::Approved,
            "rejected" | "failed" => Self::Rejected,
            _ => Self::Pending,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Voting)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Voting => "voting",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Support,
    Oppose,
}

impl VoteChoice {
    pub fn from_support(support: bool) -> Self {
        if support {
            Self::Support
        } else {
            Self::Oppose
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Oppose => "oppose",
        }
    }
}

/// One entry of a proposal's vote history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub agent_name: String,
    pub choice: VoteChoice,
    pub timestamp: i64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub proposer: String,
    /// Service-defined proposal type, e.g. `resource_allocation`.
    pub kind: String,
    pub content: String,
    pub status: ProposalStatus,
    pub supporters: BTreeSet<String>,
    pub opposers: BTreeSet<String>,
    pub proposal_day: u32,
    pub vote_history: Vec<VoteRecord>,
    pub created_at: i64,
}

impl Proposal {
    /// Restores the invariant that a name sits in at most one camp.
    ///
    /// The latest vote-history entry for a name decides; without history the
    /// name is kept as an opposer.
    pub fn enforce_exclusive_votes(&mut self) {
        let conflicted: Vec<String> = self
            .supporters
            .intersection(&self.opposers)
            .cloned()
            .collect();
        for name in conflicted {
            let latest = self
                .vote_history
                .iter()
                .rev()
                .find(|record| record.agent_name == name)
                .map(|record| record.choice);
            match latest {
                Some(VoteChoice::Support) => {
                    self.opposers.remove(&name);
                }
                _ => {
                    self.supporters.remove(&name);
                }
            }
        }
    }

    /// Applies a vote, moving the voter out of the opposite camp.
    pub fn record_vote(&mut self, agent: &str, choice: VoteChoice, timestamp: i64) {
        match choice {
            VoteChoice::Support => {
                self.opposers.remove(agent);
                self.supporters.insert(agent.to_string());
            }
            VoteChoice::Oppose => {
                self.supporters.remove(agent);
                self.opposers.insert(agent.to_string());
            }
        }
        self.vote_history.push(VoteRecord {
            agent_name: agent.to_string(),
            choice,
            timestamp,
            reasoning: String::new(),
        });
    }
}

/// Per-proposal tally derived on the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteAnalysis {
    pub proposal_id: String,
    pub day: u32,
    pub support: usize,
    pub oppose: usize,
    /// Supporters over all voters; 0.0 with no votes.
    pub support_ratio: f64,
    pub outcome: ProposalStatus,
}

impl VoteAnalysis {
    pub fn from_proposal(proposal: &Proposal) -> Self {
        let support = proposal.supporters.len();
        let oppose = proposal.opposers.len();
        let total = support + oppose;
        Self {
            proposal_id: proposal.id.clone(),
            day: proposal.proposal_day,
            support,
            oppose,
            support_ratio: if total == 0 {
                0.0
            } else {
                support as f64 / total as f64
            },
            outcome: proposal.status,
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Action,
    Vote,
    Proposal,
    Resource,
    Elimination,
    Chat,
    Meeting,
}

impl EventKind {
    /// Parses the service's event type; unknown values map to `Action`.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "vote" => Self::Vote,
            "proposal" | "propose" => Self::Proposal,
            "resource" => Self::Resource,
            "elimination" | "elimination_by_vote" => Self::Elimination,
            "chat" | "private_message" => Self::Chat,
            "meeting" | "call_meeting" => Self::Meeting,
            _ => Self::Action,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Vote => "vote",
            Self::Proposal => "proposal",
            Self::Resource => "resource",
            Self::Elimination => "elimination",
            Self::Chat => "chat",
            Self::Meeting => "meeting",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: i64,
    pub day: u32,
    pub description: String,
    pub actors: Vec<String>,
    pub emotional_impact: Option<i32>,
}

// =============================================================================
// DECISIONS
// =============================================================================

/// Discriminant of an [`AiAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Propose,
    Vote,
    PrivateMessage,
    CallMeeting,
    DoNothing,
    Think,
}

/// A single planned or executed action, one variant per service action type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AiAction {
    Propose {
        content: String,
        reasoning: Option<String>,
    },
    Vote {
        proposal_id: String,
        choice: VoteChoice,
        reasoning: Option<String>,
    },
    PrivateMessage {
        target: String,
        content: String,
        reasoning: Option<String>,
    },
    CallMeeting {
        content: String,
        initiator: Option<String>,
        reasoning: Option<String>,
    },
    DoNothing {
        reasoning: Option<String>,
    },
    Think {
        content: String,
    },
}

impl AiAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            AiAction::Propose { .. } => ActionKind::Propose,
            AiAction::Vote { .. } => ActionKind::Vote,
            AiAction::PrivateMessage { .. } => ActionKind::PrivateMessage,
            AiAction::CallMeeting { .. } => ActionKind::CallMeeting,
            AiAction::DoNothing { .. } => ActionKind::DoNothing,
            AiAction::Think { .. } => ActionKind::Think,
        }
    }

    pub fn reasoning(&self) -> Option<&str> {
        match self {
            AiAction::Propose { reasoning, .. }
            | AiAction::Vote { reasoning, .. }
            | AiAction::PrivateMessage { reasoning, .. }
            | AiAction::CallMeeting { reasoning, .. }
            | AiAction::DoNothing { reasoning } => reasoning.as_deref(),
            AiAction::Think { .. } => None,
        }
    }
}

/// One agent's decision for one simulated turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiDecision {
    pub agent_name: String,
    pub thinking: String,
    pub resource_request: f64,
    pub actions: Vec<AiAction>,
    pub action_points: i64,
    pub day: u32,
}

// =============================================================================
// LIVE STATE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Thinking,
    Acting,
    Executing,
    #[default]
    Idle,
}

impl AgentPhase {
    /// Parses the service phase; `completed` and unknown values are idle.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "thinking" => Self::Thinking,
            "acting" => Self::Acting,
            "executing" => Self::Executing,
            _ => Self::Idle,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Acting => "acting",
            Self::Executing => "executing",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentLiveStatus {
    pub agent_name: String,
    pub health: i64,
    pub action_points: i64,
    pub decision_text: String,
    pub current_action_label: String,
    pub resource_request: f64,
    pub phase: AgentPhase,
    pub is_acting: bool,
    pub actions: Vec<AiAction>,
    pub timestamp: i64,
}

/// The engine's self-reported progress of the current turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub day: u32,
    pub running: bool,
    pub current_acting_agent: Option<String>,
    pub agents: Vec<AgentLiveStatus>,
}

impl LiveState {
    pub fn agent(&self, name: &str) -> Option<&AgentLiveStatus> {
        self.agents.iter().find(|a| a.agent_name == name)
    }
}

// =============================================================================
// HISTORY / ROSTER
// =============================================================================

/// A settled turn's decision, owned by the history store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionHistoryRecord {
    pub day: u32,
    pub thinking: String,
    pub actions: Vec<AiAction>,
    pub resource_request: f64,
    pub action_points: i64,
    /// Unix milliseconds.
    pub recorded_at: u64,
}

/// Roster entry from `ai_list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub alive: bool,
    pub health: i64,
    pub action_points: i64,
    pub last_request: f64,
    pub token_consumed: u64,
}

/// Outcome of `run_next`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    pub agents: Vec<AgentSummary>,
    pub system_state: Option<SystemState>,
    pub events: Vec<GameEvent>,
    pub proposals: Vec<Proposal>,
    /// Set when the service reports the game has ended.
    pub game_over: Option<String>,
}
