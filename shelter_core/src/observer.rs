//! Observer Runtime - composes the engines around one owned state object.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Observer                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Context: ObserverContext   now() / spawn() / sleep()   │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  ┌──────────┐ ┌───────────┐ ┌──────────┐ ┌──────────────┐    │
//! │  │ SNAPSHOT │ │ RECONCILE │ │ HISTORY  │ │   PLAYBACK   │    │
//! │  │  client  │ │   loop    │ │  store   │ │    engine    │    │
//! │  └──────────┘ └───────────┘ └──────────┘ └──────────────┘    │
//! │                   StateStore (sled / memory)                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutation happens on the task that owns the `Observer`. Requests run
//! as spawned tasks and report back through a channel; their results are
//! applied only if still current (ticket / generation checks), so nothing
//! lands after `stop()` or `reset`.
//!
//! The runtime can be driven two ways:
//! - [`Observer::run`]: the event loop used by the TUI binary
//! - [`Observer::poll_once`], [`Observer::run_next`], [`Observer::tick_timers`]:
//!   inline steps used by the simulator harness and tests

use shelter_env::{EnvError, ObserverContext, SimulationTransport};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ControlPreferences, ObserverConfig};
use crate::history::HistoryStore;
use crate::model::{
    AgentSummary, AiDecision, DecisionHistoryRecord, GameEvent, LiveState, Proposal, SystemState,
    TurnResult, VoteAnalysis, VoteChoice,
};
use crate::persistence::{PersistedState, StateStore, StoreError, STATE_VERSION};
use crate::playback::{PlaybackEngine, PlaybackMode, PlaybackSource, PlaybackState, TimelineStep};
use crate::reconcile::{ReconciliationLoop, TickOutcome, TickTicket};
use crate::schedule::{earliest, TaskSlot};
use crate::snapshot::{FullState, SnapshotClient};

#[derive(Debug, Error)]
pub enum ObserverError {
    /// The blocking initial load failed; the presentation offers a retry.
    #[error("Initial load failed: {0}")]
    InitialLoad(#[from] EnvError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Commands from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverCommand {
    SelectAgent(String),
    NextAgent,
    PrevAgent,
    ToggleWindowed,
    ToggleStatic,
    RunNext,
    Reset,
    SetAutoRun(bool),
    CycleSpeed,
    Vote {
        proposal_id: String,
        agent: String,
        support: bool,
    },
    /// Replays `agent`'s settled record for `day` in static mode until
    /// the selection changes.
    InspectHistory {
        agent: String,
        day: u32,
    },
    Retry,
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum LoadStatus {
    #[default]
    Loading,
    Ready,
    Failed(String),
}

/// Read-only projection of the playback engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackView {
    pub agent: Option<String>,
    pub state: PlaybackState,
    pub mode: PlaybackMode,
    pub windowed: bool,
    /// Index of `steps[0]` in the full step list
    pub first_index: usize,
    pub steps: Vec<TimelineStep>,
    pub cursor: usize,
    pub total_steps: usize,
    pub progress: f64,
}

/// Read-only projection published to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObserverView {
    pub load_status: LoadStatus,
    pub system_state: SystemState,
    pub live: Option<LiveState>,
    pub agents: Vec<AgentSummary>,
    pub selected_agent: Option<String>,
    /// Agents highlighted after a settlement
    pub glowing: BTreeSet<String>,
    pub playback: PlaybackView,
    pub proposals: Vec<Proposal>,
    pub events: Vec<GameEvent>,
    pub vote_analyses: Vec<VoteAnalysis>,
    pub agent_history: Vec<DecisionHistoryRecord>,
    pub preferences: ControlPreferences,
    pub turn_in_flight: bool,
    pub game_over: Option<String>,
    /// Day of the history record being replayed, if any
    pub inspecting: Option<u32>,
}

impl ObserverView {
    /// Names in display order: the live roster if known, else `ai_list`.
    pub fn agent_names(&self) -> Vec<String> {
        agent_names(self.live.as_ref(), &self.agents)
    }

    /// Newest proposal still open for votes.
    pub fn newest_open_proposal(&self) -> Option<&Proposal> {
        self.proposals.iter().find(|p| p.status.is_open())
    }
}

fn agent_names(live: Option<&LiveState>, agents: &[AgentSummary]) -> Vec<String> {
    match live {
        Some(live) if !live.agents.is_empty() => {
            live.agents.iter().map(|a| a.agent_name.clone()).collect()
        }
        _ => agents.iter().map(|a| a.name.clone()).collect(),
    }
}

/// Results of spawned requests.
enum Completion {
    Load(Result<FullState, EnvError>),
    Tick {
        ticket: TickTicket,
        sample: Option<LiveState>,
    },
    Turn {
        generation: u64,
        result: Option<TurnResult>,
        decisions: Vec<AiDecision>,
    },
    Vote {
        proposal_id: String,
        agent: String,
        support: bool,
        acknowledged: bool,
    },
    Reset {
        generation: u64,
        acknowledged: bool,
    },
}

/// Cap on how long the event loop sleeps with no deadline pending.
const IDLE_WAKE: Duration = Duration::from_millis(500);

pub struct Observer<Ctx, T>
where
    Ctx: ObserverContext,
    T: SimulationTransport,
{
    ctx: Arc<Ctx>,
    client: SnapshotClient<T>,
    store: Arc<dyn StateStore>,
    config: ObserverConfig,

    reconcile: ReconciliationLoop,
    history: HistoryStore,
    playback: PlaybackEngine,

    system_state: SystemState,
    agents: Vec<AgentSummary>,
    decisions: HashMap<String, AiDecision>,
    selected: Option<String>,
    inspecting: Option<u32>,
    preferences: ControlPreferences,
    static_mode: bool,

    glow: TaskSlot,
    glowing: BTreeSet<String>,

    turn_in_flight: bool,
    /// Settled day whose snapshot waits for our turn's response
    deferred_day: Option<u32>,
    /// Bumped by reset so late turn / reset results are dropped
    generation: u64,
    load_status: LoadStatus,
    game_over: Option<String>,
    shut_down: bool,
}

impl<Ctx, T> Observer<Ctx, T>
where
    Ctx: ObserverContext,
    T: SimulationTransport,
{
    /// Creates an observer, restoring whatever the store holds.
    pub fn new(ctx: Arc<Ctx>, transport: Arc<T>, store: Arc<dyn StateStore>, config: ObserverConfig) -> Self {
        let persisted = store.load();
        let fresh = persisted == PersistedState::default();

        let mut preferences = persisted.preferences.clone();
        if fresh {
            preferences.poll_interval_ms = config.poll_interval.as_millis() as u64;
        }

        let mut history = HistoryStore::new(config.history_cap);
        history.restore(
            persisted.day_buckets,
            persisted.agent_history,
            persisted.proposals,
            persisted.events,
            persisted.vote_analyses,
        );

        info!(
            "observer created (day {}, {} agents restored)",
            persisted.system_state.day,
            persisted.agents.len()
        );

        Self {
            client: SnapshotClient::from_config(transport, &config),
            reconcile: ReconciliationLoop::new(preferences.poll_interval()),
            playback: PlaybackEngine::new(config.window_len, preferences.speed),
            history,
            system_state: persisted.system_state,
            agents: persisted.agents,
            decisions: HashMap::new(),
            selected: None,
            inspecting: None,
            preferences,
            static_mode: false,
            glow: TaskSlot::new(),
            glowing: BTreeSet::new(),
            turn_in_flight: false,
            deferred_day: None,
            generation: 0,
            load_status: LoadStatus::Loading,
            game_over: None,
            shut_down: false,
            ctx,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.playback
    }

    pub fn reconcile(&self) -> &ReconciliationLoop {
        &self.reconcile
    }

    pub fn system_state(&self) -> &SystemState {
        &self.system_state
    }

    pub fn preferences(&self) -> &ControlPreferences {
        &self.preferences
    }

    pub fn selected_agent(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    /// Starts new playbacks in static mode.
    pub fn set_static_mode(&mut self, enabled: bool) {
        self.static_mode = enabled;
        let now = self.ctx.now();
        self.playback.set_mode(self.playback_mode(), now);
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.preferences.poll_interval_ms = interval.as_millis() as u64;
        self.reconcile.set_interval(self.preferences.poll_interval());
    }

    fn playback_mode(&self) -> PlaybackMode {
        if self.static_mode {
            PlaybackMode::Static
        } else {
            PlaybackMode::Live
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Starts the reconciliation loop.
    pub fn start(&mut self) {
        self.reconcile.start(self.ctx.now());
    }

    /// Stops polling; a fetch still in flight is discarded on arrival.
    pub fn stop(&mut self) {
        self.reconcile.stop();
    }

    /// Stops polling, clears every owned timer and attempts a final save.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.reconcile.stop();
        self.playback.clear();
        self.glow.cancel();
        self.glowing.clear();
        self.persist();
        info!("observer shut down");
    }

    /// Blocking initial load. On failure the observer stays in
    /// `LoadStatus::Failed` until a retry succeeds.
    pub async fn initial_load(&mut self) -> Result<(), ObserverError> {
        let result = self.client.load_full_state().await;
        self.apply_load(result)
    }

    fn apply_load(&mut self, result: Result<FullState, EnvError>) -> Result<(), ObserverError> {
        match result {
            Ok(full) => {
                info!(
                    "initial load complete: day {}, {} agents",
                    full.system_state.day,
                    full.agents.len()
                );
                self.system_state = full.system_state;
                self.agents = full.agents;
                self.history.set_current(full.proposals, full.events);
                self.remember_decisions(full.decisions);
                self.load_status = LoadStatus::Ready;
                self.ensure_selection();
                self.persist();
                Ok(())
            }
            Err(e) => {
                warn!("initial load failed: {}", e);
                self.load_status = LoadStatus::Failed(e.to_string());
                Err(ObserverError::InitialLoad(e))
            }
        }
    }

    // =========================================================================
    // RECONCILIATION
    // =========================================================================

    /// Runs one reconciliation tick inline.
    pub async fn poll_once(&mut self) -> TickOutcome {
        let Some(ticket) = self.begin_tick() else {
            return TickOutcome::Discarded;
        };
        let sample = self.client.live_state().await;
        self.complete_tick(ticket, sample)
    }

    /// Claims the next tick immediately. `None` while one is in flight or
    /// polling is stopped.
    pub fn begin_tick(&mut self) -> Option<TickTicket> {
        self.reconcile.begin()
    }

    /// Hands a fetched sample (or `None` on failure) back for `ticket`.
    pub fn complete_tick(&mut self, ticket: TickTicket, sample: Option<LiveState>) -> TickOutcome {
        let now = self.ctx.now();
        let outcome = self
            .reconcile
            .complete(ticket, now, self.ctx.unix_millis(), sample);

        if let TickOutcome::Applied { settlements } = &outcome {
            // Live state is fully replaced at this point; derive from it.
            if !settlements.is_empty() {
                let mut settled_day = 0;
                self.glowing.clear();
                for settlement in settlements {
                    self.history.record_agent_decision(
                        &settlement.agent_name,
                        settlement.record.clone(),
                        Some(settlement.day),
                    );
                    self.glowing.insert(settlement.agent_name.clone());
                    settled_day = settlement.day;
                }
                // Our own turn captures the day from its response; the
                // collections held now may still be the previous day's.
                if self.turn_in_flight {
                    debug!("turn in flight; day {} captured on completion", settled_day);
                    self.deferred_day = Some(settled_day);
                } else {
                    self.history.record_day_snapshot(settled_day);
                }
                self.glow.schedule(now, self.config.settle_glow);
                self.persist();
            }
            if let Some(live) = self.reconcile.live() {
                if live.day > self.system_state.day {
                    self.system_state.day = live.day;
                }
            }
            self.ensure_selection();
            self.refresh_playback();
        }
        outcome
    }

    fn remember_decisions(&mut self, decisions: Vec<AiDecision>) {
        self.reconcile.remember_decisions(&decisions);
        for decision in decisions {
            self.decisions.insert(decision.agent_name.clone(), decision);
        }
    }

    // =========================================================================
    // TURNS / VOTES / RESET
    // =========================================================================

    /// Runs one simulated turn inline. Returns whether the service answered.
    pub async fn run_next(&mut self) -> bool {
        if self.turn_in_flight {
            return false;
        }
        self.turn_in_flight = true;
        let result = self.client.run_next().await;
        let decisions = if result.is_some() {
            self.client.decisions().await
        } else {
            Vec::new()
        };
        let generation = self.generation;
        self.apply_turn(generation, result, decisions)
    }

    fn apply_turn(&mut self, generation: u64, result: Option<TurnResult>, decisions: Vec<AiDecision>) -> bool {
        if generation != self.generation {
            debug!("dropping turn result from before reset");
            return false;
        }
        self.turn_in_flight = false;
        let deferred = self.deferred_day.take();
        let Some(turn) = result else {
            if let Some(day) = deferred {
                self.history.record_day_snapshot(day);
                self.persist();
            }
            return false;
        };

        // `system_state.day` in a turn payload is the day just played.
        let played_day = match &turn.system_state {
            Some(state) => state.day.max(1),
            None => deferred.unwrap_or(self.system_state.day).max(1),
        };
        let captured = turn.system_state.is_some() || !turn.proposals.is_empty() || !turn.events.is_empty();
        if let Some(mut state) = turn.system_state {
            if turn.game_over.is_none() {
                state.day = (played_day + 1).max(self.system_state.day);
            }
            self.system_state = state;
        }
        if !turn.agents.is_empty() {
            self.agents = turn.agents;
        }
        if captured {
            self.history.set_current(turn.proposals, turn.events);
            self.history.record_day_snapshot(played_day);
        } else if let Some(day) = deferred {
            self.history.record_day_snapshot(day);
        }
        self.remember_decisions(decisions);

        if let Some(reason) = turn.game_over {
            info!("game over: {}", reason);
            self.preferences.auto_run = false;
            self.game_over = Some(reason);
        } else {
            info!("turn complete; day is now {}", self.system_state.day);
        }
        self.refresh_playback();
        self.persist();
        true
    }

    /// Casts a vote inline. Returns the acknowledgement.
    pub async fn vote(&mut self, proposal_id: &str, agent: &str, support: bool) -> bool {
        let acknowledged = self.client.vote(proposal_id, agent, support).await;
        self.apply_vote(proposal_id, agent, support, acknowledged)
    }

    fn apply_vote(&mut self, proposal_id: &str, agent: &str, support: bool, acknowledged: bool) -> bool {
        if !acknowledged {
            return false;
        }
        let existing = self
            .history
            .current_proposals()
            .iter()
            .find(|p| p.id == proposal_id)
            .cloned();
        if let Some(mut proposal) = existing {
            let timestamp = self.ctx.unix_millis() as i64;
            proposal.record_vote(agent, VoteChoice::from_support(support), timestamp);
            self.history.upsert_current_proposal(proposal);
            self.persist();
        }
        true
    }

    /// Resets the service, then clears local history, restarts polling and
    /// reloads. Returns `true` only when the reload succeeded too; a failed
    /// reload leaves `LoadStatus::Failed` for a retry.
    pub async fn reset(&mut self) -> bool {
        let generation = self.begin_reset();
        let acknowledged = self.client.reset().await;
        if !self.apply_reset(generation, acknowledged) {
            return false;
        }
        self.initial_load().await.is_ok()
    }

    fn begin_reset(&mut self) -> u64 {
        self.generation += 1;
        self.turn_in_flight = false;
        self.deferred_day = None;
        self.generation
    }

    fn apply_reset(&mut self, generation: u64, acknowledged: bool) -> bool {
        if generation != self.generation || !acknowledged {
            return false;
        }
        info!("simulation reset; clearing local history");
        self.history.clear();
        self.reconcile.stop();
        self.reconcile.clear();
        self.playback.clear();
        self.glow.cancel();
        self.glowing.clear();
        self.system_state = SystemState::default();
        self.agents.clear();
        self.decisions.clear();
        self.selected = None;
        self.inspecting = None;
        self.game_over = None;
        self.load_status = LoadStatus::Loading;
        self.persist();
        self.reconcile.start(self.ctx.now());
        true
    }

    // =========================================================================
    // SELECTION / PLAYBACK
    // =========================================================================

    fn roster(&self) -> Vec<String> {
        agent_names(self.reconcile.live(), &self.agents)
    }

    /// Selects `name`; re-selecting the current agent leaves history
    /// inspection and returns to its live decision.
    pub fn select_agent(&mut self, name: &str) {
        if self.selected.as_deref() == Some(name) && self.inspecting.is_none() {
            return;
        }
        self.selected = Some(name.to_string());
        self.inspecting = None;
        self.load_playback();
    }

    /// Pins playback to `agent`'s record for `day`, shown statically.
    /// Returns `false` (and changes nothing) when no such record exists.
    pub fn inspect_history(&mut self, agent: &str, day: u32) -> bool {
        let Some(record) = self
            .history
            .agent_history(agent)
            .iter()
            .find(|r| r.day == day)
        else {
            warn!("no day {} record for {}", day, agent);
            return false;
        };
        let source = PlaybackSource::from_record(record);
        self.selected = Some(agent.to_string());
        self.inspecting = Some(day);
        self.playback.load(agent, source, PlaybackMode::Static, self.ctx.now());
        debug!("inspecting {} day {}", agent, day);
        true
    }

    pub fn inspecting(&self) -> Option<u32> {
        self.inspecting
    }

    /// Moves the selection by `step` places, wrapping around.
    pub fn cycle_agent(&mut self, step: isize) {
        let names = self.roster();
        if names.is_empty() {
            return;
        }
        let len = names.len() as isize;
        let current = self
            .selected
            .as_ref()
            .and_then(|s| names.iter().position(|n| n == s))
            .map(|i| i as isize)
            .unwrap_or(if step >= 0 { -1 } else { 0 });
        let next = (current + step).rem_euclid(len) as usize;
        let name = names[next].clone();
        self.select_agent(&name);
    }

    fn ensure_selection(&mut self) {
        if self.selected.is_some() {
            return;
        }
        let acting = self
            .reconcile
            .live()
            .and_then(|l| l.current_acting_agent.clone());
        if let Some(name) = acting.or_else(|| self.roster().into_iter().next()) {
            self.select_agent(&name);
        }
    }

    fn playback_source(&self, agent: &str) -> Option<PlaybackSource> {
        let decision = self.decisions.get(agent);
        if let Some(status) = self.reconcile.live().and_then(|l| l.agent(agent)) {
            return Some(PlaybackSource::from_live(status, decision));
        }
        if let Some(decision) = decision {
            return Some(PlaybackSource::from_decision(decision));
        }
        self.history
            .agent_history(agent)
            .first()
            .map(PlaybackSource::from_record)
    }

    fn load_playback(&mut self) {
        let now = self.ctx.now();
        let Some(agent) = self.selected.clone() else {
            self.playback.clear();
            return;
        };
        match self.playback_source(&agent) {
            Some(source) => self.playback.load(&agent, source, self.playback_mode(), now),
            None => self.playback.clear(),
        }
    }

    fn refresh_playback(&mut self) {
        if self.inspecting.is_some() {
            return;
        }
        let Some(agent) = self.selected.clone() else {
            return;
        };
        if self.playback.agent() != Some(agent.as_str()) {
            self.load_playback();
            return;
        }
        if let Some(source) = self.playback_source(&agent) {
            self.playback.refresh(source, self.ctx.now());
        }
    }

    /// Fires due timers (playback advance, settlement glow).
    pub fn tick_timers(&mut self) {
        let now = self.ctx.now();
        self.playback.tick(now);
        if self.glow.take_if_due(now).is_some() {
            self.glowing.clear();
        }
    }

    /// Earliest pending deadline across every owned timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        earliest([
            self.reconcile.next_due(),
            self.playback.next_due(),
            self.glow.due_at(),
        ])
    }

    /// True when every owned timer is idle.
    pub fn timers_cleared(&self) -> bool {
        self.next_deadline().is_none()
    }

    /// Whether the auto-run rule wants a new turn now.
    pub fn should_auto_run(&self) -> bool {
        self.preferences.auto_run
            && !self.turn_in_flight
            && self.game_over.is_none()
            && self.load_status == LoadStatus::Ready
            && self.reconcile.is_settled()
            && matches!(
                self.playback.state(),
                PlaybackState::Done | PlaybackState::Idle
            )
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Applies a command that needs no request. Returns `false` for
    /// commands that must go through the event loop.
    pub fn apply_local(&mut self, command: &ObserverCommand) -> bool {
        let now = self.ctx.now();
        match command {
            ObserverCommand::SelectAgent(name) => self.select_agent(name),
            ObserverCommand::NextAgent => self.cycle_agent(1),
            ObserverCommand::PrevAgent => self.cycle_agent(-1),
            ObserverCommand::ToggleWindowed => {
                self.playback.toggle_windowed();
            }
            ObserverCommand::ToggleStatic => self.set_static_mode(!self.static_mode),
            ObserverCommand::InspectHistory { agent, day } => {
                self.inspect_history(agent, *day);
            }
            ObserverCommand::SetAutoRun(enabled) => {
                self.preferences.auto_run = *enabled;
                self.persist();
            }
            ObserverCommand::CycleSpeed => {
                self.preferences.speed = self.preferences.speed.next();
                self.playback.set_speed(self.preferences.speed, now);
                self.persist();
            }
            ObserverCommand::RunNext
            | ObserverCommand::Reset
            | ObserverCommand::Vote { .. }
            | ObserverCommand::Retry
            | ObserverCommand::Shutdown => return false,
        }
        true
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    /// Runs until `Shutdown` arrives or the command channel closes.
    ///
    /// `publish` receives a fresh view after every wake-up.
    pub async fn run<P>(mut self, mut commands: mpsc::UnboundedReceiver<ObserverCommand>, mut publish: P)
    where
        P: FnMut(ObserverView) + Send,
    {
        let (tx, mut completions) = mpsc::unbounded_channel::<Completion>();
        let ctx = Arc::clone(&self.ctx);

        if self.load_status != LoadStatus::Ready {
            self.spawn_load(&tx);
        }
        self.start();

        loop {
            self.tick_timers();
            let now = ctx.now();
            if let Some(ticket) = self.reconcile.poll_due(now) {
                self.spawn_tick(ticket, &tx);
            }
            if self.should_auto_run() {
                debug!("auto-run: issuing next turn");
                self.spawn_turn(&tx);
            }
            publish(self.view());

            let wait = self
                .next_deadline()
                .map(|due| due.saturating_sub(now))
                .unwrap_or(IDLE_WAKE)
                .min(IDLE_WAKE);

            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(ObserverCommand::Shutdown) => break,
                    Some(command) => self.dispatch(command, &tx),
                },
                Some(done) = completions.recv() => self.on_completion(done, &tx),
                _ = ctx.sleep(wait) => {}
            }
        }

        self.shutdown();
        publish(self.view());
    }

    fn dispatch(&mut self, command: ObserverCommand, tx: &mpsc::UnboundedSender<Completion>) {
        if self.apply_local(&command) {
            return;
        }
        match command {
            ObserverCommand::RunNext => self.spawn_turn(tx),
            ObserverCommand::Reset => {
                let generation = self.begin_reset();
                let client = self.client.clone();
                let tx = tx.clone();
                self.ctx.spawn("reset", async move {
                    let acknowledged = client.reset().await;
                    let _ = tx.send(Completion::Reset {
                        generation,
                        acknowledged,
                    });
                });
            }
            ObserverCommand::Vote {
                proposal_id,
                agent,
                support,
            } => {
                let client = self.client.clone();
                let tx = tx.clone();
                self.ctx.spawn("vote", async move {
                    let acknowledged = client.vote(&proposal_id, &agent, support).await;
                    let _ = tx.send(Completion::Vote {
                        proposal_id,
                        agent,
                        support,
                        acknowledged,
                    });
                });
            }
            ObserverCommand::Retry => {
                if matches!(self.load_status, LoadStatus::Failed(_)) {
                    self.load_status = LoadStatus::Loading;
                    self.spawn_load(tx);
                }
            }
            _ => {}
        }
    }

    fn on_completion(&mut self, done: Completion, tx: &mpsc::UnboundedSender<Completion>) {
        match done {
            Completion::Load(result) => {
                let _ = self.apply_load(result);
            }
            Completion::Tick { ticket, sample } => {
                self.complete_tick(ticket, sample);
            }
            Completion::Turn {
                generation,
                result,
                decisions,
            } => {
                self.apply_turn(generation, result, decisions);
            }
            Completion::Vote {
                proposal_id,
                agent,
                support,
                acknowledged,
            } => {
                self.apply_vote(&proposal_id, &agent, support, acknowledged);
            }
            Completion::Reset {
                generation,
                acknowledged,
            } => {
                if self.apply_reset(generation, acknowledged) {
                    self.spawn_load(tx);
                }
            }
        }
    }

    fn spawn_load(&self, tx: &mpsc::UnboundedSender<Completion>) {
        let client = self.client.clone();
        let tx = tx.clone();
        self.ctx.spawn("initial_load", async move {
            let result = client.load_full_state().await;
            let _ = tx.send(Completion::Load(result));
        });
    }

    fn spawn_tick(&self, ticket: TickTicket, tx: &mpsc::UnboundedSender<Completion>) {
        let client = self.client.clone();
        let tx = tx.clone();
        self.ctx.spawn("live_state", async move {
            let sample = client.live_state().await;
            let _ = tx.send(Completion::Tick { ticket, sample });
        });
    }

    fn spawn_turn(&mut self, tx: &mpsc::UnboundedSender<Completion>) {
        if self.turn_in_flight {
            return;
        }
        self.turn_in_flight = true;
        let generation = self.generation;
        let client = self.client.clone();
        let tx = tx.clone();
        self.ctx.spawn("run_next", async move {
            let result = client.run_next().await;
            let decisions = if result.is_some() {
                client.decisions().await
            } else {
                Vec::new()
            };
            let _ = tx.send(Completion::Turn {
                generation,
                result,
                decisions,
            });
        });
    }

    // =========================================================================
    // PROJECTION / PERSISTENCE
    // =========================================================================

    pub fn view(&self) -> ObserverView {
        let (first_index, steps) = self.playback.visible_steps();
        ObserverView {
            load_status: self.load_status.clone(),
            system_state: self.system_state.clone(),
            live: self.reconcile.live().cloned(),
            agents: self.agents.clone(),
            selected_agent: self.selected.clone(),
            glowing: self.glowing.clone(),
            playback: PlaybackView {
                agent: self.playback.agent().map(str::to_string),
                state: self.playback.state(),
                mode: self.playback.mode(),
                windowed: self.playback.is_windowed(),
                first_index,
                steps: steps.to_vec(),
                cursor: self.playback.cursor(),
                total_steps: self.playback.steps().len(),
                progress: self.playback.progress(),
            },
            proposals: self.history.all_proposals(),
            events: self.history.all_events(),
            vote_analyses: self.history.all_vote_analyses(),
            agent_history: self
                .selected
                .as_deref()
                .map(|a| self.history.agent_history(a).to_vec())
                .unwrap_or_default(),
            preferences: self.preferences.clone(),
            turn_in_flight: self.turn_in_flight,
            game_over: self.game_over.clone(),
            inspecting: self.inspecting,
        }
    }

    /// Snapshot of everything that survives a restart.
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            system_state: self.system_state.clone(),
            agents: self.agents.clone(),
            proposals: self.history.current_proposals().to_vec(),
            events: self.history.current_events().to_vec(),
            vote_analyses: self.history.current_vote_analyses(),
            day_buckets: self.history.day_buckets().clone(),
            agent_history: self.history.agent_histories().clone(),
            preferences: self.preferences.clone(),
        }
    }

    pub fn save(&self) -> Result<(), ObserverError> {
        self.store.save(&self.persisted_state())?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("failed to save observer state: {}", e);
        }
    }
}

impl<Ctx, T> Drop for Observer<Ctx, T>
where
    Ctx: ObserverContext,
    T: SimulationTransport,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStateStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use shelter_env::TokioContext;
    use std::sync::Mutex;

    /// Serves a scripted sequence of live states and fixed payloads.
    #[derive(Default)]
    struct FakeService {
        live: Mutex<Vec<Value>>,
        offline: Mutex<bool>,
        /// Fails reads only; posts still succeed
        reads_offline: Mutex<bool>,
        run_next: Mutex<Option<Value>>,
        /// Consumed one per `run_next` before falling back to `run_next`
        turns: Mutex<Vec<Value>>,
    }

    impl FakeService {
        fn push_live(&self, value: Value) {
            self.live.lock().unwrap().push(value);
        }

        fn push_turn(&self, value: Value) {
            self.turns.lock().unwrap().push(value);
        }
    }

    #[async_trait]
    impl SimulationTransport for FakeService {
        async fn get(&self, path: &str, _timeout: Duration) -> Result<Value, EnvError> {
            if *self.offline.lock().unwrap() || *self.reads_offline.lock().unwrap() {
                return Err(EnvError::network("offline"));
            }
            Ok(match path {
                "live_state" => {
                    let mut live = self.live.lock().unwrap();
                    if live.len() > 1 {
                        live.remove(0)
                    } else {
                        live.first().cloned().unwrap_or(Value::Null)
                    }
                }
                "status" => json!({"day": 1, "totalResources": 5000, "remainingResources": 5000, "systemEfficiency": 1.0}),
                "ai_list" => json!([{"name": "deepseek", "alive": true}, {"name": "kimi", "alive": true}]),
                "ai_decisions" => json!([{"name": "deepseek", "thinking": "plan", "resourceRequest": 150}]),
                _ => json!([]),
            })
        }

        async fn post(&self, path: &str, _body: Option<Value>, _timeout: Duration) -> Result<Value, EnvError> {
            if *self.offline.lock().unwrap() {
                return Err(EnvError::network("offline"));
            }
            match path {
                "run_next" => {
                    let mut turns = self.turns.lock().unwrap();
                    if !turns.is_empty() {
                        return Ok(turns.remove(0));
                    }
                    self.run_next
                        .lock()
                        .unwrap()
                        .clone()
                        .ok_or_else(|| EnvError::rejected("busy"))
                }
                _ => Ok(json!({"message": "ok"})),
            }
        }
    }

    fn live(day: u32, running: bool) -> Value {
        json!({
            "day": day,
            "running": running,
            "current_ai_states": [
                {"aiName": "deepseek", "decision": "share", "phase": if running { "executing" } else { "completed" }, "resourceRequest": 0},
                {"aiName": "kimi", "decision": "hoard", "phase": "thinking"},
            ],
        })
    }

    fn observer(
        service: Arc<FakeService>,
        store: Arc<MemoryStateStore>,
    ) -> Observer<TokioContext, FakeService> {
        Observer::new(TokioContext::shared(), service, store, ObserverConfig::default())
    }

    #[tokio::test]
    async fn test_settlement_records_history_under_running_day() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(6, true));
        service.push_live(live(7, false));
        let store = Arc::new(MemoryStateStore::new());
        let mut obs = observer(service, store.clone());
        obs.initial_load().await.unwrap();
        obs.start();

        obs.poll_once().await;
        let outcome = obs.poll_once().await;
        assert!(matches!(outcome, TickOutcome::Applied { ref settlements } if settlements.len() == 2));

        let history = obs.history().agent_history("deepseek");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].day, 6);
        // Zero live request back-filled from the cached decision.
        assert_eq!(history[0].resource_request, 150.0);
        assert!(obs.history().day_bucket(6).is_some());
        assert!(obs.view().glowing.contains("kimi"));

        // Settlement was persisted.
        assert_eq!(store.load().agent_history["deepseek"][0].day, 6);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_live_state() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(2, true));
        let mut obs = observer(service.clone(), Arc::new(MemoryStateStore::new()));
        obs.start();
        obs.poll_once().await;
        *service.offline.lock().unwrap() = true;
        assert_eq!(obs.poll_once().await, TickOutcome::Failed);
        assert_eq!(obs.view().live.unwrap().day, 2);
    }

    #[tokio::test]
    async fn test_initial_load_failure_then_retry() {
        let service = Arc::new(FakeService::default());
        *service.offline.lock().unwrap() = true;
        let mut obs = observer(service.clone(), Arc::new(MemoryStateStore::new()));
        assert!(matches!(
            obs.initial_load().await,
            Err(ObserverError::InitialLoad(_))
        ));
        assert!(matches!(obs.load_status(), LoadStatus::Failed(_)));

        *service.offline.lock().unwrap() = false;
        obs.initial_load().await.unwrap();
        assert_eq!(obs.load_status(), &LoadStatus::Ready);
        assert_eq!(obs.selected_agent(), Some("deepseek"));
    }

    /// A `run_next` payload for `played`: the pool holds one proposal per
    /// day so far and `system_state.day` is the day just played.
    fn turn(played: u32) -> Value {
        let proposals: Vec<Value> = (1..=played)
            .map(|day| json!({"id": format!("{}_deepseek_0", day), "proposer": "deepseek", "proposalDay": day}))
            .collect();
        json!({
            "ai_list": [{"name": "deepseek", "alive": true}],
            "system_state": {"day": played, "systemEfficiency": 0.75},
            "proposals": proposals,
            "events": [{"id": "event-0", "type": "proposal", "day": played}],
        })
    }

    fn bucket_ids(obs: &Observer<TokioContext, FakeService>, day: u32) -> Vec<String> {
        obs.history()
            .day_bucket(day)
            .map(|b| b.proposals.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_run_next_records_played_day() {
        let service = Arc::new(FakeService::default());
        for played in 1..=3 {
            service.push_turn(turn(played));
        }
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();

        for played in 1..=3u32 {
            assert!(obs.run_next().await);
            let ids = bucket_ids(&obs, played);
            assert!(ids.contains(&format!("{}_deepseek_0", played)), "day {}: {:?}", played, ids);
            assert_eq!(obs.system_state().day, played + 1);
        }
        assert_eq!(obs.history().day_buckets().len(), 3);
        assert_eq!(bucket_ids(&obs, 1), vec!["1_deepseek_0".to_string()]);
        assert_eq!(obs.system_state().system_efficiency, 75);
        assert!(obs.view().events.iter().any(|e| e.id == "3:event-0"));
    }

    #[tokio::test]
    async fn test_settlement_before_turn_response_leaves_day_to_turn() {
        let service = Arc::new(FakeService::default());
        service.push_turn(turn(1));
        service.push_live(live(2, true));
        service.push_live(live(3, false));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        assert!(obs.run_next().await);
        obs.start();

        // Day 2 is ours and its response has not arrived yet.
        obs.turn_in_flight = true;
        obs.poll_once().await;
        let outcome = obs.poll_once().await;
        assert!(matches!(outcome, TickOutcome::Applied { ref settlements } if !settlements.is_empty()));
        assert!(obs.history().day_bucket(2).is_none());
        assert_eq!(obs.history().agent_history("deepseek")[0].day, 2);

        let generation = obs.generation;
        assert!(obs.apply_turn(generation, Some(crate::wire::normalize_turn(&turn(2))), Vec::new()));
        assert!(bucket_ids(&obs, 2).contains(&"2_deepseek_0".to_string()));
        assert_eq!(obs.system_state().day, 3);
    }

    #[tokio::test]
    async fn test_failed_turn_still_records_settled_day() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(2, true));
        service.push_live(live(3, false));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        obs.start();

        obs.turn_in_flight = true;
        obs.poll_once().await;
        obs.poll_once().await;
        assert!(obs.history().day_bucket(2).is_none());

        let generation = obs.generation;
        assert!(!obs.apply_turn(generation, None, Vec::new()));
        assert!(obs.history().day_bucket(2).is_some());
        assert!(!obs.view().turn_in_flight);
    }

    #[tokio::test]
    async fn test_settlement_without_own_turn_records_day() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(4, true));
        service.push_live(live(5, false));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        obs.start();
        obs.poll_once().await;
        obs.poll_once().await;
        assert!(obs.history().day_bucket(4).is_some());
    }

    #[tokio::test]
    async fn test_finished_turn_keeps_current_collections() {
        let service = Arc::new(FakeService::default());
        service.push_turn(turn(1));
        service.push_turn(json!({"finished": true, "end_reason": "resource_depleted", "day": 2}));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        assert!(obs.run_next().await);
        assert!(obs.run_next().await);
        assert_eq!(obs.view().game_over.as_deref(), Some("resource_depleted"));
        assert_eq!(obs.history().current_proposals().len(), 1);
        assert_eq!(obs.history().day_buckets().len(), 1);
    }

    #[tokio::test]
    async fn test_game_over_disables_auto_run() {
        let service = Arc::new(FakeService::default());
        *service.run_next.lock().unwrap() = Some(json!({"game_over": true, "reason": "last one standing"}));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        obs.apply_local(&ObserverCommand::SetAutoRun(true));
        assert!(obs.run_next().await);
        assert_eq!(obs.view().game_over.as_deref(), Some("last one standing"));
        assert!(!obs.preferences().auto_run);
        assert!(!obs.should_auto_run());
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(1, true));
        service.push_live(live(2, false));
        let store = Arc::new(MemoryStateStore::new());
        let mut obs = observer(service, store.clone());
        obs.initial_load().await.unwrap();
        obs.start();
        obs.poll_once().await;
        obs.poll_once().await;
        assert!(!obs.history().agent_history("deepseek").is_empty());

        assert!(obs.reset().await);
        assert!(obs.history().agent_history("deepseek").is_empty());
        assert!(store.load().agent_history.is_empty());
        assert!(obs.reconcile().is_started());
    }

    #[tokio::test]
    async fn test_inspect_history_pins_static_record() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(6, true));
        service.push_live(live(7, false));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        obs.start();
        obs.poll_once().await;
        obs.poll_once().await;

        assert!(!obs.inspect_history("deepseek", 2));
        assert_eq!(obs.inspecting(), None);

        assert!(obs.apply_local(&ObserverCommand::InspectHistory {
            agent: "deepseek".to_string(),
            day: 6,
        }));
        let view = obs.view();
        assert_eq!(view.inspecting, Some(6));
        assert_eq!(view.playback.mode, PlaybackMode::Static);
        assert!(view.playback.total_steps > 0);

        // Polling does not pull the view back to live data.
        obs.poll_once().await;
        assert_eq!(obs.view().playback.mode, PlaybackMode::Static);

        obs.apply_local(&ObserverCommand::SelectAgent("deepseek".to_string()));
        assert_eq!(obs.inspecting(), None);
        assert_eq!(obs.view().playback.mode, PlaybackMode::Live);
    }

    #[tokio::test]
    async fn test_reset_reports_failed_reload() {
        let service = Arc::new(FakeService::default());
        let mut obs = observer(service.clone(), Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();

        *service.reads_offline.lock().unwrap() = true;
        assert!(!obs.reset().await);
        assert!(matches!(obs.load_status(), LoadStatus::Failed(_)));

        *service.reads_offline.lock().unwrap() = false;
        assert!(obs.reset().await);
        assert_eq!(obs.load_status(), &LoadStatus::Ready);
    }

    #[tokio::test]
    async fn test_saved_vote_analyses_restored() {
        let store = Arc::new(MemoryStateStore::new());
        let saved = PersistedState {
            proposals: vec![Proposal {
                id: "1_kimi_0".to_string(),
                ..Default::default()
            }],
            vote_analyses: vec![VoteAnalysis {
                proposal_id: "1_kimi_0".to_string(),
                support: 3,
                ..Default::default()
            }],
            ..Default::default()
        };
        store.save(&saved).unwrap();

        let obs = observer(Arc::new(FakeService::default()), store);
        assert_eq!(obs.view().vote_analyses[0].support, 3);
        assert_eq!(obs.persisted_state().vote_analyses, saved.vote_analyses);
    }

    #[tokio::test]
    async fn test_preferences_restored() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let mut obs = observer(Arc::new(FakeService::default()), store.clone());
            obs.apply_local(&ObserverCommand::CycleSpeed);
            obs.apply_local(&ObserverCommand::SetAutoRun(true));
        }
        let obs = observer(Arc::new(FakeService::default()), store);
        assert!(obs.preferences().auto_run);
        assert_eq!(obs.preferences().speed, crate::config::SpeedTier::Fast);
    }

    #[tokio::test]
    async fn test_shutdown_clears_timers() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(1, true));
        let mut obs = observer(service, Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        obs.start();
        obs.poll_once().await;
        assert!(!obs.timers_cleared());
        obs.shutdown();
        assert!(obs.timers_cleared());
        assert!(!obs.reconcile().is_started());
    }

    #[tokio::test]
    async fn test_cycle_agent_wraps() {
        let mut obs = observer(Arc::new(FakeService::default()), Arc::new(MemoryStateStore::new()));
        obs.initial_load().await.unwrap();
        assert_eq!(obs.selected_agent(), Some("deepseek"));
        obs.apply_local(&ObserverCommand::NextAgent);
        assert_eq!(obs.selected_agent(), Some("kimi"));
        obs.apply_local(&ObserverCommand::NextAgent);
        assert_eq!(obs.selected_agent(), Some("deepseek"));
        obs.apply_local(&ObserverCommand::PrevAgent);
        assert_eq!(obs.selected_agent(), Some("kimi"));
    }

    #[tokio::test]
    async fn test_run_loop_shuts_down_on_command() {
        let service = Arc::new(FakeService::default());
        service.push_live(live(1, true));
        let obs = observer(service, Arc::new(MemoryStateStore::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let views = Arc::new(Mutex::new(Vec::new()));
        let sink = views.clone();
        let handle = tokio::spawn(obs.run(rx, move |view| sink.lock().unwrap().push(view)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(ObserverCommand::Shutdown).unwrap();
        handle.await.unwrap();

        let views = views.lock().unwrap();
        let last = views.last().unwrap();
        assert_eq!(last.load_status, LoadStatus::Ready);
        assert_eq!(last.playback.state, PlaybackState::Idle);
    }
}
