//! Wire formats of the simulation service and their normalization.
//!
//! Every wire struct is `#[serde(default)]` and every field goes through a
//! lenient deserializer, so a missing field, a `null`, or a number sent as a
//! string coalesces to a safe default instead of failing the whole payload.
//! Lists are decoded element by element; an element that still fails to
//! decode is dropped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::model::{
    efficiency_percent, AgentLiveStatus, AgentPhase, AgentSummary, AiAction, AiDecision,
    EventKind, GameEvent, LiveState, Proposal, ProposalStatus, SystemState, TurnResult,
    VoteChoice, VoteRecord,
};

/// Milliseconds per simulated day in the service's timestamp convention.
pub const DAY_MILLIS: i64 = 86_400_000;

// =============================================================================
// LENIENT SCALARS
// =============================================================================

mod lenient {
    use super::*;

    pub fn as_f64(value: &Value) -> f64 {
        match value {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            Value::Bool(b) => f64::from(u8::from(*b)),
            _ => 0.0,
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(as_f64(&Value::deserialize(d)?))
    }

    pub fn i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(as_f64(&Value::deserialize(d)?).round() as i64)
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(as_f64(&Value::deserialize(d)?).round().max(0.0) as u32)
    }

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(as_f64(&Value::deserialize(d)?).round().max(0.0) as u64)
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        })
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
            _ => false,
        })
    }

    pub fn strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.is_empty() => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn opt_i32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            other => Some(as_f64(&other).round() as i32),
        })
    }
}

/// Decodes a JSON array element by element, dropping undecodable entries.
pub fn decode_list<W: DeserializeOwned>(value: &Value) -> Vec<W> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match serde_json::from_value::<W>(item.clone()) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    debug!("dropping undecodable element: {}", e);
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn decode<W: DeserializeOwned + Default>(value: &Value) -> W {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

// =============================================================================
// ACTIONS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireAction {
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    kind: String,
    #[serde(deserialize_with = "lenient::opt_string")]
    target: Option<String>,
    #[serde(deserialize_with = "lenient::string")]
    content: String,
    #[serde(alias = "proposalId", deserialize_with = "lenient::string")]
    proposal_id: String,
    support: Value,
    vote: Value,
    #[serde(deserialize_with = "lenient::opt_string")]
    reasoning: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    initiator: Option<String>,
}

fn vote_choice(support: &Value, vote: &Value) -> VoteChoice {
    for raw in [support, vote] {
        match raw {
            Value::Bool(b) => return VoteChoice::from_support(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "support" | "yes" | "for" | "true" | "approve" => return VoteChoice::Support,
                "oppose" | "no" | "against" | "false" | "reject" => return VoteChoice::Oppose,
                _ => {}
            },
            _ => {}
        }
    }
    VoteChoice::Oppose
}

impl WireAction {
    fn into_action(self) -> AiAction {
        match self.kind.as_str() {
            "propose" => AiAction::Propose {
                content: self.content,
                reasoning: self.reasoning,
            },
            "vote" => AiAction::Vote {
                choice: vote_choice(&self.support, &self.vote),
                proposal_id: self.proposal_id,
                reasoning: self.reasoning,
            },
            "private_message" => AiAction::PrivateMessage {
                target: self.target.unwrap_or_default(),
                content: self.content,
                reasoning: self.reasoning,
            },
            "call_meeting" => AiAction::CallMeeting {
                content: self.content,
                initiator: self.initiator,
                reasoning: self.reasoning,
            },
            "think" => AiAction::Think {
                content: if self.content.is_empty() {
                    self.reasoning.unwrap_or_default()
                } else {
                    self.content
                },
            },
            "do_nothing" => AiAction::DoNothing {
                reasoning: self.reasoning,
            },
            other => {
                debug!("unknown action type {:?}, treating as do_nothing", other);
                AiAction::DoNothing {
                    reasoning: self.reasoning,
                }
            }
        }
    }
}

/// Normalizes a raw action list.
pub fn normalize_actions(value: &Value) -> Vec<AiAction> {
    decode_list::<WireAction>(value)
        .into_iter()
        .map(WireAction::into_action)
        .collect()
}

// =============================================================================
// SYSTEM STATE / ROSTER
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireStatus {
    #[serde(deserialize_with = "lenient::u32")]
    day: u32,
    #[serde(alias = "remaining_resources", deserialize_with = "lenient::f64")]
    remaining_resources: f64,
    #[serde(alias = "total_resources", deserialize_with = "lenient::f64")]
    total_resources: f64,
    #[serde(alias = "system_efficiency", deserialize_with = "lenient::f64")]
    system_efficiency: f64,
    #[serde(alias = "elimination_count", deserialize_with = "lenient::u32")]
    elimination_count: u32,
    #[serde(alias = "allocation_method", deserialize_with = "lenient::string")]
    allocation_method: String,
    #[serde(deserialize_with = "lenient::u64")]
    token_budget: u64,
    #[serde(deserialize_with = "lenient::u64")]
    total_token_consumed: u64,
}

/// Normalizes a `status` payload.
///
/// Efficiency arrives as a 0-1 fraction; a value above 1 is taken to be a
/// percentage already.
pub fn normalize_status(value: &Value) -> SystemState {
    let wire: WireStatus = decode(value);
    let efficiency = if wire.system_efficiency > 1.0 {
        wire.system_efficiency.round().clamp(0.0, 100.0) as u8
    } else {
        efficiency_percent(wire.system_efficiency)
    };
    let total = wire.total_resources.max(0.0);
    let remaining = if total > 0.0 {
        wire.remaining_resources.clamp(0.0, total)
    } else {
        wire.remaining_resources.max(0.0)
    };
    SystemState {
        day: wire.day,
        remaining_resources: remaining,
        total_resources: total,
        system_efficiency: efficiency,
        elimination_count: wire.elimination_count,
        allocation_method: wire.allocation_method,
        token_budget: wire.token_budget,
        total_token_consumed: wire.total_token_consumed,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireAgent {
    #[serde(deserialize_with = "lenient::string")]
    name: String,
    #[serde(deserialize_with = "lenient::bool")]
    alive: bool,
    #[serde(deserialize_with = "lenient::i64")]
    health: i64,
    #[serde(deserialize_with = "lenient::i64")]
    action_points: i64,
    #[serde(deserialize_with = "lenient::f64")]
    last_request: f64,
    #[serde(deserialize_with = "lenient::u64")]
    token_consumed: u64,
}

/// Normalizes an `ai_list` payload; nameless entries are dropped.
pub fn normalize_agents(value: &Value) -> Vec<AgentSummary> {
    decode_list::<WireAgent>(value)
        .into_iter()
        .filter(|a| !a.name.is_empty())
        .map(|a| AgentSummary {
            name: a.name,
            alive: a.alive,
            health: a.health,
            action_points: a.action_points,
            last_request: a.last_request,
            token_consumed: a.token_consumed,
        })
        .collect()
}

// =============================================================================
// PROPOSALS / EVENTS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireVoteRecord {
    #[serde(alias = "agentName", deserialize_with = "lenient::string")]
    ai_name: String,
    vote: Value,
    #[serde(deserialize_with = "lenient::i64")]
    timestamp: i64,
    #[serde(deserialize_with = "lenient::string")]
    reasoning: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireProposal {
    #[serde(alias = "proposal_id", deserialize_with = "lenient::string")]
    id: String,
    #[serde(deserialize_with = "lenient::string")]
    proposer: String,
    #[serde(rename = "type", alias = "proposal_type", deserialize_with = "lenient::string")]
    kind: String,
    #[serde(deserialize_with = "lenient::string")]
    content: String,
    #[serde(deserialize_with = "lenient::string")]
    status: String,
    #[serde(deserialize_with = "lenient::strings")]
    supporters: Vec<String>,
    #[serde(deserialize_with = "lenient::strings")]
    opposers: Vec<String>,
    #[serde(alias = "proposal_day", deserialize_with = "lenient::u32")]
    proposal_day: u32,
    #[serde(deserialize_with = "lenient::u32")]
    day: u32,
    vote_history: Value,
    #[serde(deserialize_with = "lenient::i64")]
    created_at: i64,
}

/// Normalizes a proposal list; id-less entries are dropped.
pub fn normalize_proposals(value: &Value) -> Vec<Proposal> {
    decode_list::<WireProposal>(value)
        .into_iter()
        .filter(|p| !p.id.is_empty())
        .map(|p| {
            let vote_history = decode_list::<WireVoteRecord>(&p.vote_history)
                .into_iter()
                .filter(|r| !r.ai_name.is_empty())
                .map(|r| VoteRecord {
                    choice: vote_choice(&Value::Null, &r.vote),
                    agent_name: r.ai_name,
                    timestamp: r.timestamp,
                    reasoning: r.reasoning,
                })
                .collect();
            let proposal_day = if p.proposal_day > 0 { p.proposal_day } else { p.day };
            let created_at = if p.created_at > 0 {
                p.created_at
            } else {
                i64::from(proposal_day) * DAY_MILLIS
            };
            let mut proposal = Proposal {
                id: p.id,
                proposer: p.proposer,
                kind: p.kind,
                content: p.content,
                status: ProposalStatus::from_wire(&p.status),
                supporters: p.supporters.into_iter().collect(),
                opposers: p.opposers.into_iter().collect(),
                proposal_day,
                vote_history,
                created_at,
            };
            proposal.enforce_exclusive_votes();
            proposal
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireEvent {
    #[serde(deserialize_with = "lenient::string")]
    id: String,
    #[serde(rename = "type", deserialize_with = "lenient::string")]
    kind: String,
    #[serde(deserialize_with = "lenient::i64")]
    timestamp: i64,
    #[serde(deserialize_with = "lenient::u32")]
    day: u32,
    #[serde(deserialize_with = "lenient::string")]
    description: String,
    #[serde(deserialize_with = "lenient::string")]
    content: String,
    #[serde(deserialize_with = "lenient::strings")]
    actors: Vec<String>,
    #[serde(deserialize_with = "lenient::opt_i32")]
    emotional_impact: Option<i32>,
    #[serde(deserialize_with = "lenient::opt_string")]
    actor: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    sender: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    target: Option<String>,
}

/// Normalizes an event list.
///
/// The service numbers events per response (`event-0`, `event-1`, ...), so
/// ids are qualified with the day to stay unique across days.
pub fn normalize_events(value: &Value) -> Vec<GameEvent> {
    decode_list::<WireEvent>(value)
        .into_iter()
        .enumerate()
        .map(|(index, e)| {
            let raw_id = if e.id.is_empty() {
                format!("event-{}", index)
            } else {
                e.id
            };
            let mut actors = e.actors;
            if actors.is_empty() {
                for name in [e.actor, e.sender, e.target].into_iter().flatten() {
                    if !actors.contains(&name) {
                        actors.push(name);
                    }
                }
            }
            let timestamp = if e.timestamp > 0 {
                e.timestamp
            } else {
                i64::from(e.day) * DAY_MILLIS
            };
            GameEvent {
                id: format!("{}:{}", e.day, raw_id),
                kind: EventKind::from_wire(&e.kind),
                timestamp,
                day: e.day,
                description: if e.description.is_empty() {
                    e.content
                } else {
                    e.description
                },
                actors,
                emotional_impact: e.emotional_impact,
            }
        })
        .collect()
}

// =============================================================================
// DECISIONS / LIVE STATE
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireDecision {
    #[serde(alias = "agentName", alias = "aiName", deserialize_with = "lenient::string")]
    name: String,
    #[serde(deserialize_with = "lenient::string")]
    thinking: String,
    #[serde(deserialize_with = "lenient::f64")]
    resource_request: f64,
    actions: Value,
    #[serde(deserialize_with = "lenient::i64")]
    action_points: i64,
    #[serde(deserialize_with = "lenient::u32")]
    day: u32,
}

impl WireDecision {
    fn into_decision(self) -> AiDecision {
        AiDecision {
            agent_name: self.name,
            thinking: self.thinking,
            resource_request: self.resource_request,
            actions: normalize_actions(&self.actions),
            action_points: self.action_points,
            day: self.day,
        }
    }
}

/// Normalizes an `ai_decisions` payload.
pub fn normalize_decisions(value: &Value) -> Vec<AiDecision> {
    decode_list::<WireDecision>(value)
        .into_iter()
        .filter(|d| !d.name.is_empty())
        .map(WireDecision::into_decision)
        .collect()
}

/// Normalizes a single `ai/{name}/decision` payload.
pub fn normalize_decision(value: &Value) -> Option<AiDecision> {
    let wire: WireDecision = decode(value);
    (!wire.name.is_empty()).then(|| wire.into_decision())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireLiveAgent {
    #[serde(alias = "agentName", alias = "name", deserialize_with = "lenient::string")]
    ai_name: String,
    #[serde(deserialize_with = "lenient::i64")]
    health: i64,
    #[serde(deserialize_with = "lenient::i64")]
    action_points: i64,
    #[serde(alias = "decisionText", deserialize_with = "lenient::string")]
    decision: String,
    #[serde(alias = "currentActionLabel", deserialize_with = "lenient::string")]
    current_action: String,
    #[serde(deserialize_with = "lenient::f64")]
    resource_request: f64,
    #[serde(deserialize_with = "lenient::string")]
    phase: String,
    #[serde(deserialize_with = "lenient::bool")]
    is_acting: bool,
    actions: Value,
    #[serde(deserialize_with = "lenient::i64")]
    timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLiveState {
    #[serde(deserialize_with = "lenient::u32")]
    day: u32,
    #[serde(deserialize_with = "lenient::bool")]
    running: bool,
    #[serde(alias = "currentActingAgent", deserialize_with = "lenient::opt_string")]
    current_acting_ai: Option<String>,
    #[serde(alias = "perAgentLiveStatus")]
    current_ai_states: Value,
}

/// Normalizes a `live_state` payload.
pub fn normalize_live_state(value: &Value) -> LiveState {
    let wire: WireLiveState = decode(value);
    let agents = decode_list::<WireLiveAgent>(&wire.current_ai_states)
        .into_iter()
        .filter(|a| !a.ai_name.is_empty())
        .map(|a| AgentLiveStatus {
            agent_name: a.ai_name,
            health: a.health,
            action_points: a.action_points,
            decision_text: a.decision,
            current_action_label: a.current_action,
            resource_request: a.resource_request,
            phase: AgentPhase::from_wire(&a.phase),
            is_acting: a.is_acting,
            actions: normalize_actions(&a.actions),
            timestamp: a.timestamp,
        })
        .collect();
    LiveState {
        day: wire.day,
        running: wire.running,
        current_acting_agent: wire.current_acting_ai,
        agents,
    }
}

// =============================================================================
// TURN RESULT
// =============================================================================

/// Normalizes a `run_next` payload.
///
/// The end of the game is flagged by a boolean `finished` (or `game_over`);
/// without either flag a payload lacking `system_state` counts as over. The
/// reason (if any) is surfaced in `game_over`.
pub fn normalize_turn(value: &Value) -> TurnResult {
    let system_state = value
        .get("system_state")
        .filter(|v| v.is_object())
        .map(normalize_status);
    let finished = ["finished", "game_over"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_bool))
        .unwrap_or(system_state.is_none());
    let game_over = if finished {
        let reason = ["reason", "end_reason", "message", "winner"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .unwrap_or("game over");
        Some(reason.to_string())
    } else {
        None
    };
    TurnResult {
        agents: normalize_agents(value.get("ai_list").unwrap_or(&Value::Null)),
        system_state,
        events: normalize_events(value.get("events").unwrap_or(&Value::Null)),
        proposals: normalize_proposals(value.get("proposals").unwrap_or(&Value::Null)),
        game_over,
    }
}
