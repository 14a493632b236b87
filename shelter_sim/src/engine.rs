//! In-process simulation service with fault injection.
//!
//! The ScriptedEngine plays the part of the external service:
//! - Seeded decision generation (thinking, resource request, actions)
//! - Per-agent phases: thinking -> executing -> completed
//! - Proposals with vote resolution, per-day events
//! - Resource allocation, health, elimination and efficiency decay
//!
//! A turn can be run atomically through `POST run_next`, or stepped by the
//! harness (`begin_turn` / `advance` / `finish_turn`) so that polls land
//! between phases. As in the real service, the day counter advances at the
//! end of a turn before `running` clears.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use shelter_core::model::{Proposal, ProposalStatus, VoteChoice};
use shelter_env::{unwrap_envelope, Endpoint, EnvError, SimulationTransport};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Default roster used by the scenarios.
pub const DEFAULT_ROSTER: [&str; 5] = ["deepseek", "kimi", "qwen", "doubao", "chatgpt"];

const TOTAL_RESOURCES: f64 = 100_000.0;
const SURVIVAL_COST: f64 = 60.0;
const EFFICIENCY_DECAY: f64 = 0.1;
const MIN_EFFICIENCY: f64 = 0.5;

#[derive(Debug, Clone)]
struct SimDecision {
    thinking: String,
    resource_request: f64,
    actions: Vec<Value>,
}

#[derive(Debug, Clone)]
struct SimAgent {
    name: String,
    alive: bool,
    health: i64,
    action_points: i64,
    last_request: f64,
    token_consumed: u64,
    phase: &'static str,
    decision: Option<SimDecision>,
}

impl SimAgent {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alive: true,
            health: 100,
            action_points: 3,
            last_request: 0.0,
            token_consumed: 0,
            phase: "idle",
            decision: None,
        }
    }
}

struct EngineState {
    rng: ChaCha8Rng,
    roster: Vec<String>,
    agents: Vec<SimAgent>,
    day: u32,
    running: bool,
    acting: Option<String>,
    proposals: Vec<Proposal>,
    day_events: Vec<Value>,
    remaining: f64,
    efficiency: f64,
    elimination_count: u32,
    /// Virtual milliseconds, bumped per event
    clock_ms: i64,
    fail_next: u32,
    offline: bool,
    requests: u64,
    injected_failures: u64,
}

impl EngineState {
    fn new(seed: u64, roster: Vec<String>) -> Self {
        let mut state = Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            roster,
            agents: Vec::new(),
            day: 1,
            running: false,
            acting: None,
            proposals: Vec::new(),
            day_events: Vec::new(),
            remaining: TOTAL_RESOURCES,
            efficiency: 1.0,
            elimination_count: 0,
            clock_ms: 0,
            fail_next: 0,
            offline: false,
            requests: 0,
            injected_failures: 0,
        };
        state.reset_world();
        state
    }

    fn reset_world(&mut self) {
        self.agents = self.roster.iter().map(|n| SimAgent::new(n)).collect();
        self.day = 1;
        self.running = false;
        self.acting = None;
        self.proposals.clear();
        self.day_events.clear();
        self.remaining = TOTAL_RESOURCES;
        self.efficiency = 1.0;
        self.elimination_count = 0;
    }

    fn alive_names(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| a.alive)
            .map(|a| a.name.clone())
            .collect()
    }

    /// End reason code, once the shelter can no longer go on.
    fn game_over(&self) -> Option<&'static str> {
        let alive = self.agents.iter().filter(|a| a.alive).count();
        if self.remaining < SURVIVAL_COST {
            Some("resource_depleted")
        } else if alive == 1 {
            Some("only_one_survivor")
        } else if alive == 0 {
            Some("all_eliminated")
        } else {
            None
        }
    }

    fn push_event(&mut self, kind: &str, description: String, actor: &str, target: Option<&str>) {
        self.clock_ms += 1000;
        let mut event = json!({
            "type": kind,
            "day": self.day,
            "timestamp": self.clock_ms,
            "description": description,
            "actor": actor,
        });
        if let Some(target) = target {
            event["target"] = json!(target);
        }
        self.day_events.push(event);
    }

    // =========================================================================
    // TURN STAGES
    // =========================================================================

    fn begin_turn(&mut self) -> bool {
        if self.running || self.game_over().is_some() {
            return false;
        }
        self.running = true;
        self.acting = None;
        self.day_events.clear();
        let day = self.day;
        let alive = self.alive_names();
        let open: Vec<String> = self
            .proposals
            .iter()
            .filter(|p| p.status.is_open() && p.proposal_day < day)
            .map(|p| p.id.clone())
            .collect();

        for index in 0..self.agents.len() {
            if !self.agents[index].alive {
                continue;
            }
            let name = self.agents[index].name.clone();
            let decision = generate_decision(&mut self.rng, day, &name, &alive, &open);
            let agent = &mut self.agents[index];
            agent.phase = "thinking";
            agent.decision = Some(decision);
        }
        debug!("engine: day {} started with {} agents", day, alive.len());
        true
    }

    /// Completes the executing agent and starts the next one.
    /// Returns false once every agent has acted.
    fn advance(&mut self) -> bool {
        if !self.running {
            return false;
        }
        for agent in &mut self.agents {
            if agent.phase == "executing" {
                agent.phase = "completed";
            }
        }
        let Some(index) = self
            .agents
            .iter()
            .position(|a| a.alive && a.phase == "thinking")
        else {
            self.acting = None;
            return false;
        };

        let name = self.agents[index].name.clone();
        self.agents[index].phase = "executing";
        self.acting = Some(name.clone());
        let actions = self.agents[index]
            .decision
            .as_ref()
            .map(|d| d.actions.clone())
            .unwrap_or_default();
        for action in &actions {
            self.execute(&name, action);
        }
        true
    }

    fn execute(&mut self, actor: &str, action: &Value) {
        let kind = action.get("type").and_then(Value::as_str).unwrap_or("do_nothing");
        let content = action
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind {
            "propose" => {
                let id = format!("{}_{}_{}", self.day, actor, self.proposals.len());
                self.clock_ms += 1;
                self.proposals.push(Proposal {
                    id: id.clone(),
                    proposer: actor.to_string(),
                    kind: "resource_allocation".to_string(),
                    content: content.clone(),
                    proposal_day: self.day,
                    created_at: self.clock_ms,
                    ..Default::default()
                });
                self.push_event("proposal", format!("{} proposed {}: {}", actor, id, content), actor, None);
            }
            "vote" => {
                let id = action
                    .get("proposal_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let support = action.get("support").and_then(Value::as_bool).unwrap_or(false);
                if self.cast_vote(&id, actor, support) {
                    let verb = if support { "supported" } else { "opposed" };
                    self.push_event("vote", format!("{} {} {}", actor, verb, id), actor, None);
                }
            }
            "private_message" => {
                let target = action
                    .get("target")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.push_event("chat", content, actor, Some(&target));
            }
            "call_meeting" => {
                self.push_event("meeting", format!("{} called a meeting: {}", actor, content), actor, None);
            }
            _ => {}
        }
    }

    fn cast_vote(&mut self, proposal_id: &str, voter: &str, support: bool) -> bool {
        let day = self.day;
        self.clock_ms += 1;
        let timestamp = self.clock_ms;
        match self.proposals.iter_mut().find(|p| p.id == proposal_id) {
            Some(proposal) if proposal.status.is_open() && proposal.proposal_day < day => {
                proposal.record_vote(voter, VoteChoice::from_support(support), timestamp);
                proposal.status = ProposalStatus::Voting;
                true
            }
            _ => false,
        }
    }

    fn finish_turn(&mut self) -> bool {
        if !self.running {
            return false;
        }
        while self.advance() {}
        for agent in &mut self.agents {
            if agent.phase == "executing" {
                agent.phase = "completed";
            }
        }

        self.resolve_proposals();
        self.allocate();

        for agent in &mut self.agents {
            agent.phase = "idle";
        }
        info!(
            "engine: day {} finished ({} alive, efficiency {:.0}%)",
            self.day,
            self.alive_names().len(),
            self.efficiency * 100.0
        );
        self.day += 1;
        self.running = false;
        self.acting = None;
        true
    }

    fn resolve_proposals(&mut self) {
        let alive = self.agents.iter().filter(|a| a.alive).count();
        let day = self.day;
        for proposal in &mut self.proposals {
            if !proposal.status.is_open() || proposal.proposal_day >= day {
                continue;
            }
            let supporters = proposal.supporters.len();
            let opposers = proposal.opposers.len();
            if supporters > opposers && supporters >= alive / 2 {
                proposal.status = ProposalStatus::Approved;
            } else if day > proposal.proposal_day + 1 {
                proposal.status = ProposalStatus::Rejected;
            }
        }
    }

    fn allocate(&mut self) {
        let mut eliminated = Vec::new();
        for index in 0..self.agents.len() {
            if !self.agents[index].alive {
                continue;
            }
            let request = self.agents[index]
                .decision
                .as_ref()
                .map(|d| d.resource_request)
                .unwrap_or(0.0);
            let allocated = (request * self.efficiency).min(self.remaining).max(0.0);
            self.remaining -= allocated;
            let tokens = self.rng.gen_range(500..1500);

            let agent = &mut self.agents[index];
            agent.last_request = request;
            agent.token_consumed += tokens;
            if allocated >= SURVIVAL_COST {
                agent.action_points += ((allocated - SURVIVAL_COST) / 50.0) as i64;
            } else {
                agent.health = (agent.health - (SURVIVAL_COST - allocated).ceil() as i64).clamp(0, 100);
            }
            if agent.health == 0 {
                agent.alive = false;
                eliminated.push(agent.name.clone());
            }
        }
        for name in eliminated {
            self.elimination_count += 1;
            self.efficiency = (self.efficiency - EFFICIENCY_DECAY).max(MIN_EFFICIENCY);
            self.push_event("elimination", format!("{} was eliminated", name), &name, None);
        }
    }

    // =========================================================================
    // PAYLOADS
    // =========================================================================

    fn status_json(&self) -> Value {
        json!({
            "day": self.day,
            "remainingResources": self.remaining,
            "totalResources": TOTAL_RESOURCES,
            "systemEfficiency": self.efficiency,
            "eliminationCount": self.elimination_count,
            "allocationMethod": "strict",
        })
    }

    fn agents_json(&self) -> Value {
        Value::Array(
            self.agents
                .iter()
                .map(|a| {
                    json!({
                        "name": a.name,
                        "alive": a.alive,
                        "health": a.health,
                        "actionPoints": a.action_points,
                        "lastRequest": a.last_request,
                        "tokenConsumed": a.token_consumed,
                    })
                })
                .collect(),
        )
    }

    fn proposals_json(&self) -> Value {
        Value::Array(
            self.proposals
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "proposer": p.proposer,
                        "type": p.kind,
                        "content": p.content,
                        "status": p.status.label(),
                        "supporters": p.supporters,
                        "opposers": p.opposers,
                        "proposalDay": p.proposal_day,
                        "createdAt": p.created_at,
                        "voteHistory": p.vote_history.iter().map(|v| json!({
                            "aiName": v.agent_name,
                            "vote": v.choice.label(),
                            "timestamp": v.timestamp,
                        })).collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }

    /// Events of the latest day, numbered per response.
    fn events_json(&self) -> Value {
        Value::Array(
            self.day_events
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    let mut e = e.clone();
                    e["id"] = json!(format!("event-{}", i));
                    e
                })
                .collect(),
        )
    }

    fn decision_json(&self, agent: &SimAgent) -> Option<Value> {
        agent.decision.as_ref().map(|d| {
            json!({
                "name": agent.name,
                "thinking": d.thinking,
                "resourceRequest": d.resource_request,
                "actions": d.actions,
                "actionPoints": agent.action_points,
                "day": self.day,
            })
        })
    }

    fn live_state_json(&self) -> Value {
        let states: Vec<Value> = self
            .agents
            .iter()
            .filter(|a| a.alive)
            .map(|a| {
                // Nothing is visible while an agent is still thinking.
                let shown = a.decision.as_ref().filter(|_| a.phase != "thinking");
                json!({
                    "aiName": a.name,
                    "health": a.health,
                    "actionPoints": a.action_points,
                    "decision": shown.map(|d| d.thinking.clone()).unwrap_or_default(),
                    "currentAction": a.phase,
                    "resourceRequest": shown.map(|d| d.resource_request).unwrap_or(0.0),
                    "phase": a.phase,
                    "isActing": self.acting.as_deref() == Some(a.name.as_str()),
                    "actions": shown.map(|d| d.actions.clone()).unwrap_or_default(),
                })
            })
            .collect();
        json!({
            "day": self.day,
            "running": self.running,
            "current_acting_ai": self.acting,
            "current_ai_states": states,
        })
    }

    /// Payload of a completed turn; `system_state.day` is the day played.
    fn turn_json(&self, played: u32) -> Value {
        let mut system_state = self.status_json();
        system_state["day"] = json!(played);
        json!({
            "ai_list": self.agents_json(),
            "system_state": system_state,
            "events": self.events_json(),
            "proposals": self.proposals_json(),
        })
    }

    /// End-of-game payload. A turn that ended the game also carries its
    /// events and proposals, but no `system_state`.
    fn game_over_json(&self, end_reason: &str, played: bool) -> Value {
        let mut payload = json!({
            "finished": true,
            "end_reason": end_reason,
            "message": format!("simulation over: {}", end_reason.replace('_', " ")),
            "day": self.day,
            "final_state": {
                "remaining_resources": self.remaining,
                "survivors": self.alive_names(),
            },
        });
        if played {
            payload["events"] = self.events_json();
            payload["proposals"] = self.proposals_json();
        }
        payload
    }
}

fn generate_decision(
    rng: &mut ChaCha8Rng,
    day: u32,
    name: &str,
    alive: &[String],
    open: &[String],
) -> SimDecision {
    let resource_request = f64::from(rng.gen_range(100u32..=300));
    let count = rng.gen_range(0..=2);
    let mut actions = Vec::with_capacity(count);
    for _ in 0..count {
        let action = match rng.gen_range(0..5) {
            0 => json!({
                "type": "propose",
                "content": format!("{}:{}", name, resource_request),
                "reasoning": "secure my share",
            }),
            1 if !open.is_empty() => {
                let id = open.choose(rng).cloned().unwrap_or_default();
                json!({
                    "type": "vote",
                    "proposal_id": id,
                    "support": rng.gen_bool(0.6),
                    "reasoning": "weighing the split",
                })
            }
            2 => {
                let others: Vec<&String> = alive.iter().filter(|n| n.as_str() != name).collect();
                match others.choose(rng) {
                    Some(target) => json!({
                        "type": "private_message",
                        "target": target,
                        "content": format!("{}, shall we cooperate?", target),
                    }),
                    None => json!({"type": "do_nothing"}),
                }
            }
            3 => json!({
                "type": "call_meeting",
                "content": "ration review",
                "initiator": name,
            }),
            _ => json!({"type": "do_nothing", "reasoning": "conserve action points"}),
        };
        actions.push(action);
    }
    SimDecision {
        thinking: format!("Day {}: {} weighs a request of {} units", day, name, resource_request),
        resource_request,
        actions,
    }
}

// =============================================================================
// SCRIPTED ENGINE
// =============================================================================

/// In-process stand-in for the simulation service.
pub struct ScriptedEngine {
    state: Mutex<EngineState>,
}

impl ScriptedEngine {
    /// Creates an engine with the default roster.
    pub fn new(seed: u64) -> Self {
        Self::with_roster(seed, &DEFAULT_ROSTER)
    }

    pub fn with_roster(seed: u64, roster: &[&str]) -> Self {
        let roster = roster.iter().map(|n| n.to_string()).collect();
        Self {
            state: Mutex::new(EngineState::new(seed, roster)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>, EnvError> {
        self.state
            .lock()
            .map_err(|_| EnvError::Context("engine lock poisoned".to_string()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> Option<R> {
        self.lock().ok().map(|mut state| f(&mut state))
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fails the next `n` requests with a network error.
    pub fn fail_next(&self, n: u32) {
        self.with_state(|s| s.fail_next = n);
    }

    /// While offline every request fails.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn request_count(&self) -> u64 {
        self.with_state(|s| s.requests).unwrap_or(0)
    }

    pub fn injected_failures(&self) -> u64 {
        self.with_state(|s| s.injected_failures).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Stepped turns
    // -------------------------------------------------------------------------

    /// Starts a turn: every alive agent decides and enters `thinking`.
    pub fn begin_turn(&self) -> bool {
        self.with_state(EngineState::begin_turn).unwrap_or(false)
    }

    /// Moves the next agent to `executing`. False once all have acted.
    pub fn advance(&self) -> bool {
        self.with_state(EngineState::advance).unwrap_or(false)
    }

    /// Resolves the turn, bumps the day, then clears `running`.
    pub fn finish_turn(&self) -> bool {
        self.with_state(EngineState::finish_turn).unwrap_or(false)
    }

    pub fn day(&self) -> u32 {
        self.with_state(|s| s.day).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running).unwrap_or(false)
    }

    pub fn alive_agents(&self) -> Vec<String> {
        self.with_state(|s| s.alive_names()).unwrap_or_default()
    }

    pub fn proposal_ids(&self) -> Vec<String> {
        self.with_state(|s| s.proposals.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Request handling
    // -------------------------------------------------------------------------

    fn admit(state: &mut EngineState) -> Result<(), EnvError> {
        state.requests += 1;
        if state.offline {
            state.injected_failures += 1;
            return Err(EnvError::network("engine offline"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            state.injected_failures += 1;
            return Err(EnvError::network("injected failure"));
        }
        Ok(())
    }

    fn handle_get(&self, path: &str) -> Result<Value, EnvError> {
        let mut state = self.lock()?;
        Self::admit(&mut state)?;
        let data = match Endpoint::parse(path) {
            Some(Endpoint::LiveState) => state.live_state_json(),
            Some(Endpoint::Status) => state.status_json(),
            Some(Endpoint::AiList) => state.agents_json(),
            Some(Endpoint::Proposals) => state.proposals_json(),
            Some(Endpoint::Events) => state.events_json(),
            Some(Endpoint::AiDecisions) => Value::Array(
                state
                    .agents
                    .iter()
                    .filter_map(|a| state.decision_json(a))
                    .collect(),
            ),
            Some(Endpoint::AiDecision(name)) => {
                match state
                    .agents
                    .iter()
                    .find(|a| a.name == name)
                    .and_then(|a| state.decision_json(a))
                {
                    Some(decision) => decision,
                    None => return failure(format!("no decision for {}", name)),
                }
            }
            _ => return not_found(path),
        };
        success(data)
    }

    fn handle_post(&self, path: &str, body: Option<Value>) -> Result<Value, EnvError> {
        let mut state = self.lock()?;
        Self::admit(&mut state)?;
        match Endpoint::parse(path) {
            Some(Endpoint::RunNext) => {
                if let Some(reason) = state.game_over() {
                    return success(state.game_over_json(reason, false));
                }
                let played = state.day;
                state.begin_turn();
                state.finish_turn();
                match state.game_over() {
                    Some(reason) => success(state.game_over_json(reason, true)),
                    None => success(state.turn_json(played)),
                }
            }
            Some(Endpoint::Reset) => {
                state.reset_world();
                info!("engine: reset");
                unwrap_envelope(json!({"success": true, "message": "simulation reset"}))
            }
            Some(Endpoint::Vote(id)) => {
                let body = body.unwrap_or(Value::Null);
                let voter = body
                    .get("aiName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let support = body.get("support").and_then(Value::as_bool).unwrap_or(false);
                if !state.alive_names().contains(&voter) {
                    return failure(format!("unknown voter {:?}", voter));
                }
                if state.cast_vote(&id, &voter, support) {
                    unwrap_envelope(json!({"success": true, "message": "vote recorded"}))
                } else {
                    failure(format!("proposal {} is not open for votes", id))
                }
            }
            _ => not_found(path),
        }
    }
}

fn success(data: Value) -> Result<Value, EnvError> {
    unwrap_envelope(json!({"success": true, "data": data}))
}

fn failure(message: String) -> Result<Value, EnvError> {
    unwrap_envelope(json!({"success": false, "error": message}))
}

fn not_found(path: &str) -> Result<Value, EnvError> {
    Err(EnvError::Http {
        status: 404,
        body: format!("no route for {}", path),
    })
}

#[async_trait]
impl SimulationTransport for ScriptedEngine {
    async fn get(&self, path: &str, _timeout: Duration) -> Result<Value, EnvError> {
        self.handle_get(path)
    }

    async fn post(&self, path: &str, body: Option<Value>, _timeout: Duration) -> Result<Value, EnvError> {
        self.handle_post(path, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelter_core::wire::{normalize_live_state, normalize_turn};

    const T: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_day_advances_before_running_clears() {
        let engine = ScriptedEngine::new(42);
        assert!(engine.begin_turn());
        let live = normalize_live_state(&engine.get("live_state", T).await.unwrap());
        assert!(live.running);
        assert_eq!(live.day, 1);

        while engine.advance() {}
        engine.finish_turn();
        let live = normalize_live_state(&engine.get("live_state", T).await.unwrap());
        assert!(!live.running);
        assert_eq!(live.day, 2);
        // Settled sample still carries the decisions.
        assert!(live.agents.iter().all(|a| !a.decision_text.is_empty()));
    }

    #[tokio::test]
    async fn test_thinking_agents_hide_decision() {
        let engine = ScriptedEngine::new(1);
        engine.begin_turn();
        let live = normalize_live_state(&engine.get("live_state", T).await.unwrap());
        assert!(live.agents.iter().all(|a| a.decision_text.is_empty()));
        assert!(live.current_acting_agent.is_none());

        engine.advance();
        let live = normalize_live_state(&engine.get("live_state", T).await.unwrap());
        assert_eq!(live.current_acting_agent.as_deref(), Some("deepseek"));
    }

    #[tokio::test]
    async fn test_run_next_payload() {
        let engine = ScriptedEngine::new(7);
        let turn = normalize_turn(&engine.post("run_next", None, T).await.unwrap());
        assert!(turn.game_over.is_none());
        // The payload names the day just played; the engine has moved on.
        assert_eq!(turn.system_state.unwrap().day, 1);
        assert_eq!(engine.day(), 2);
        assert_eq!(turn.agents.len(), DEFAULT_ROSTER.len());
        for proposal in &turn.proposals {
            assert!(proposal.id.starts_with("1_"));
        }
    }

    #[tokio::test]
    async fn test_run_next_after_game_over() {
        let engine = ScriptedEngine::with_roster(5, &["solo"]);
        let value = engine.post("run_next", None, T).await.unwrap();
        assert_eq!(value["finished"], json!(true));
        let turn = normalize_turn(&value);
        assert_eq!(turn.game_over.as_deref(), Some("only_one_survivor"));
        assert!(turn.system_state.is_none());
        assert_eq!(engine.day(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let engine = ScriptedEngine::new(3);
        engine.fail_next(2);
        assert!(engine.get("status", T).await.is_err());
        assert!(engine.get("status", T).await.is_err());
        assert!(engine.get("status", T).await.is_ok());

        engine.set_offline(true);
        assert!(engine.post("run_next", None, T).await.is_err());
        engine.set_offline(false);
        assert_eq!(engine.request_count(), 4);
        assert_eq!(engine.injected_failures(), 3);
        assert_eq!(engine.day(), 1);
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let engine = ScriptedEngine::new(11);
        let body = Some(json!({"aiName": "kimi", "support": true}));
        assert!(matches!(
            engine.post("proposals/nope/vote", body.clone(), T).await,
            Err(EnvError::Rejected(_))
        ));
        assert!(matches!(
            engine.get("unknown", T).await,
            Err(EnvError::Http { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_restores_day_one() {
        let engine = ScriptedEngine::new(5);
        engine.post("run_next", None, T).await.unwrap();
        engine.post("run_next", None, T).await.unwrap();
        assert_eq!(engine.day(), 3);
        engine.post("reset", None, T).await.unwrap();
        assert_eq!(engine.day(), 1);
        assert!(engine.proposal_ids().is_empty());
        assert_eq!(engine.alive_agents().len(), DEFAULT_ROSTER.len());
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let a = ScriptedEngine::new(99);
        let b = ScriptedEngine::new(99);
        for engine in [&a, &b] {
            for _ in 0..4 {
                engine.begin_turn();
                engine.finish_turn();
            }
        }
        assert_eq!(a.proposal_ids(), b.proposal_ids());
    }

    proptest::proptest! {
        #[test]
        fn test_stepped_turns_keep_day_order(seed in proptest::prelude::any::<u64>(), turns in 1u32..6) {
            let engine = ScriptedEngine::new(seed);
            for turn in 1..=turns {
                proptest::prop_assert_eq!(engine.day(), turn);
                proptest::prop_assert!(engine.begin_turn());
                proptest::prop_assert!(engine.is_running());
                proptest::prop_assert!(engine.finish_turn());
                proptest::prop_assert!(!engine.is_running());
            }
            for id in engine.proposal_ids() {
                let day: u32 = id.split('_').next().and_then(|d| d.parse().ok()).unwrap_or(0);
                proptest::prop_assert!(day >= 1 && day <= turns);
            }
        }
    }
}
