//! Scenario runner - drives a real `Observer` against the scripted engine.

use crate::context::SimContext;
use crate::engine::ScriptedEngine;
use crate::scenarios::ScenarioId;

use shelter_core::config::SpeedTier;
use shelter_core::model::{AgentPhase, AiAction, DecisionHistoryRecord, Proposal, ProposalStatus, VoteChoice};
use shelter_core::persistence::{MemoryStateStore, StateStore, STATE_VERSION};
use shelter_core::playback::{PlaybackEngine, PlaybackMode, PlaybackSource, PlaybackState};
use shelter_core::{HistoryStore, Observer, ObserverCommand, ObserverConfig, SnapshotClient, TickOutcome};
use shelter_env::ObserverContext;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type SimObserver = Observer<SimContext, ScriptedEngine>;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Turns played against the engine
    pub turns: u32,

    /// Day reported by the observer at the end
    pub final_day: u32,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Requests served by the engine
    pub requests: u64,

    /// Ticks whose sample was applied
    pub applied_ticks: u64,

    /// Ticks whose fetch failed
    pub failed_ticks: u64,

    /// Ticks dropped as stale
    pub discarded_ticks: u64,

    /// Per-agent settlement records produced
    pub settlements: u64,
}

impl ScenarioMetrics {
    fn count(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Applied { settlements } => {
                self.applied_ticks += 1;
                self.settlements += settlements.len() as u64;
            }
            TickOutcome::Failed => self.failed_ticks += 1,
            TickOutcome::Discarded => self.discarded_ticks += 1,
        }
    }
}

/// What a scenario body reports back.
#[derive(Debug, Default)]
struct Run {
    turns: u32,
    final_day: u32,
    metrics: ScenarioMetrics,
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

/// Runs observer scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Turns played by turn-driven scenarios
    turns: u32,

    config: ObserverConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            turns: 12,
            config: ObserverConfig::default(),
        }
    }

    /// Sets the number of turns.
    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns.max(1);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::SteadyTurns => self.block_on(self.run_steady_turns()),
            ScenarioId::FlakyNetwork => self.block_on(self.run_flaky_network()),
            ScenarioId::StopMidFlight => self.block_on(self.run_stop_mid_flight()),
            ScenarioId::OutOfOrderHistory => self.run_out_of_order_history(),
            ScenarioId::PlaybackTiming => self.run_playback_timing(),
            ScenarioId::PersistenceRoundtrip => self.block_on(self.run_persistence_roundtrip()),
        };

        let (run, failure_reason) = match outcome {
            Ok(run) => (run, None),
            Err((run, reason)) => {
                warn!("✗ {} failed: {}", scenario.name(), reason);
                (run, Some(reason))
            }
        };
        if failure_reason.is_none() {
            info!("✓ {} complete ({} turns, day {})", scenario.name(), run.turns, run.final_day);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            turns: run.turns,
            final_day: run.final_day,
            failure_reason,
            metrics: run.metrics,
        }
    }

    fn block_on<F>(&self, future: F) -> Result<Run, (Run, String)>
    where
        F: Future<Output = Result<Run, (Run, String)>>,
    {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(future),
            Err(e) => Err((Run::default(), format!("failed to build runtime: {}", e))),
        }
    }

    fn setup(&self, store: Arc<MemoryStateStore>) -> (Arc<SimContext>, Arc<ScriptedEngine>, SimObserver) {
        let ctx = SimContext::shared(self.seed);
        let engine = Arc::new(ScriptedEngine::new(self.seed));
        let observer = Observer::new(ctx.clone(), engine.clone(), store, self.config.clone());
        (ctx, engine, observer)
    }

    // =========================================================================
    // OBS-001
    // =========================================================================

    /// OBS-001: SteadyTurns - stepped turns polled between every phase.
    ///
    /// **Assertion**: each settlement lands under the day that was played,
    /// histories stay within the cap, and every played day has a bucket.
    async fn run_steady_turns(&self) -> Result<Run, (Run, String)> {
        info!("OBS-001: SteadyTurns - {} stepped turns", self.turns);
        let (ctx, engine, mut observer) = self.setup(Arc::new(MemoryStateStore::new()));
        let mut run = Run::default();

        let result = async {
            observer.initial_load().await.map_err(|e| e.to_string())?;
            observer.start();
            let cap = observer.history().cap();

            for turn in 1..=self.turns {
                let played = engine.day();
                let settled = drive_turn(&mut observer, &engine, &ctx, &mut run.metrics).await;
                run.turns = turn;
                ensure(played == turn, || format!("engine played day {} on turn {}", played, turn))?;
                ensure(settled > 0, || format!("turn {} produced no settlements", turn))?;

                for agent in engine.alive_agents() {
                    let newest = observer.history().agent_history(&agent).first().map(|r| r.day);
                    ensure(newest == Some(played), || {
                        format!("{}: newest record day {:?}, expected {}", agent, newest, played)
                    })?;
                }
                ensure(observer.history().day_bucket(played).is_some(), || {
                    format!("no day bucket for day {}", played)
                })?;
                debug!("  turn {} settled {} agents", turn, settled);
            }

            for (agent, records) in observer.history().agent_histories() {
                ensure(records.len() <= cap, || {
                    format!("{} keeps {} records, cap {}", agent, records.len(), cap)
                })?;
                ensure(records.windows(2).all(|w| w[0].day > w[1].day), || {
                    format!("{} history is not newest-first", agent)
                })?;
            }
            let day = observer.system_state().day;
            ensure(day == self.turns + 1, || {
                format!("observer day {} after {} turns", day, self.turns)
            })?;
            Ok::<(), String>(())
        }
        .await;

        run.final_day = observer.system_state().day;
        run.metrics.requests = engine.request_count();
        observer.shutdown();
        finish(run, result)
    }

    // =========================================================================
    // OBS-002
    // =========================================================================

    /// OBS-002: FlakyNetwork - injected failures during a turn.
    ///
    /// **Assertion**: failed ticks keep the previous live state and the
    /// settlement still lands under the played day.
    async fn run_flaky_network(&self) -> Result<Run, (Run, String)> {
        info!("OBS-002: FlakyNetwork - failures mid-turn");
        let (ctx, engine, mut observer) = self.setup(Arc::new(MemoryStateStore::new()));
        let mut run = Run::default();
        let interval = observer.preferences().poll_interval();

        let result = async {
            engine.fail_next(1);
            ensure(observer.initial_load().await.is_err(), || "initial load ignored an injected failure".to_string())?;
            observer.initial_load().await.map_err(|e| e.to_string())?;
            observer.start();

            engine.begin_turn();
            run.metrics.count(&observer.poll_once().await);
            let before = observer.reconcile().live().cloned();
            ensure(before.as_ref().is_some_and(|l| l.running), || "first sample not running".to_string())?;

            engine.fail_next(2);
            for _ in 0..2 {
                let outcome = observer.poll_once().await;
                ensure(outcome == TickOutcome::Failed, || format!("expected a failed tick, got {:?}", outcome))?;
                run.metrics.count(&outcome);
            }
            ensure(observer.reconcile().live().cloned() == before, || {
                "failed tick replaced the live state".to_string()
            })?;

            engine.set_offline(true);
            engine.advance();
            ctx.advance_time(interval);
            run.metrics.count(&observer.poll_once().await);
            let day = observer.system_state().day;
            ensure(!observer.run_next().await, || "run_next succeeded while offline".to_string())?;
            ensure(observer.system_state().day == day, || "offline run_next changed the day".to_string())?;
            engine.set_offline(false);

            while engine.advance() {
                ctx.advance_time(interval);
                run.metrics.count(&observer.poll_once().await);
            }
            engine.finish_turn();
            let outcome = observer.poll_once().await;
            run.metrics.count(&outcome);
            run.turns = 1;

            let settlements = match &outcome {
                TickOutcome::Applied { settlements } => settlements.clone(),
                other => return Err(format!("settling tick was {:?}", other)),
            };
            ensure(!settlements.is_empty() && settlements.iter().all(|s| s.day == 1), || {
                format!("settlement days {:?}", settlements.iter().map(|s| s.day).collect::<Vec<_>>())
            })?;
            let (_, failed) = observer.reconcile().stats();
            ensure(failed == 3, || format!("{} failed ticks recorded, expected 3", failed))?;
            Ok::<(), String>(())
        }
        .await;

        run.final_day = observer.system_state().day;
        run.metrics.requests = engine.request_count();
        observer.shutdown();
        finish(run, result)
    }

    // =========================================================================
    // OBS-003
    // =========================================================================

    /// OBS-003: StopMidFlight - a response that arrives after `stop()`.
    ///
    /// **Assertion**: the late sample is discarded; neither history nor the
    /// store changes, and polling picks the settlement up after a restart.
    async fn run_stop_mid_flight(&self) -> Result<Run, (Run, String)> {
        info!("OBS-003: StopMidFlight - late response after stop");
        let store = Arc::new(MemoryStateStore::new());
        let (_ctx, engine, mut observer) = self.setup(store.clone());
        let client = SnapshotClient::from_config(engine.clone(), &self.config);
        let mut run = Run::default();

        let result = async {
            observer.initial_load().await.map_err(|e| e.to_string())?;
            observer.start();
            engine.begin_turn();
            run.metrics.count(&observer.poll_once().await);

            let ticket = observer
                .begin_tick()
                .ok_or_else(|| "no ticket while started".to_string())?;
            ensure(observer.begin_tick().is_none(), || "second ticket issued while in flight".to_string())?;

            engine.finish_turn();
            let sample = client.live_state().await;
            ensure(sample.as_ref().is_some_and(|l| !l.running), || "settled sample expected".to_string())?;

            let saved = store.load_raw().map_err(|e| e.to_string())?;
            observer.stop();
            let outcome = observer.complete_tick(ticket, sample);
            run.metrics.count(&outcome);
            ensure(outcome == TickOutcome::Discarded, || format!("late tick was {:?}", outcome))?;
            ensure(observer.history().agent_histories().is_empty(), || "late tick wrote history".to_string())?;
            ensure(store.load_raw().map_err(|e| e.to_string())? == saved, || "late tick persisted".to_string())?;
            ensure(observer.reconcile().next_due().is_none(), || "timer survived stop".to_string())?;

            observer.start();
            let outcome = observer.poll_once().await;
            run.metrics.count(&outcome);
            run.turns = 1;
            let settled = matches!(&outcome, TickOutcome::Applied { settlements } if !settlements.is_empty());
            ensure(settled, || format!("restart tick was {:?}", outcome))?;
            Ok::<(), String>(())
        }
        .await;

        run.final_day = observer.system_state().day;
        run.metrics.requests = engine.request_count();
        observer.shutdown();
        finish(run, result)
    }

    // =========================================================================
    // OBS-004
    // =========================================================================

    /// OBS-004: OutOfOrderHistory - cap eviction and a late older day.
    fn run_out_of_order_history(&self) -> Result<Run, (Run, String)> {
        info!("OBS-004: OutOfOrderHistory - cap {}", self.config.history_cap);
        let cap = self.config.history_cap as u32;
        let mut history = HistoryStore::new(self.config.history_cap);
        let record = |day: u32| DecisionHistoryRecord {
            day,
            thinking: format!("day {}", day),
            ..Default::default()
        };

        let result = (|| {
            for day in 2..=cap + 2 {
                history.record_agent_decision("kimi", record(day), None);
            }
            let days: Vec<u32> = history.agent_history("kimi").iter().map(|r| r.day).collect();
            ensure(days.len() == cap as usize, || format!("{} records kept", days.len()))?;
            ensure(days.first() == Some(&(cap + 2)) && days.last() == Some(&3), || {
                format!("unexpected window {:?}", days)
            })?;

            // A late, older day is prepended and evicts by position.
            history.record_agent_decision("kimi", record(1), None);
            let days: Vec<u32> = history.agent_history("kimi").iter().map(|r| r.day).collect();
            ensure(days.first() == Some(&1) && !days.contains(&3), || {
                format!("late day handled as {:?}", days)
            })?;

            let mut replaced = record(5);
            replaced.thinking = "revised".to_string();
            history.record_agent_decision("kimi", replaced, None);
            let entries = history.agent_history("kimi");
            ensure(entries.len() == cap as usize, || "in-place update changed the length".to_string())?;
            ensure(
                entries.iter().any(|r| r.day == 5 && r.thinking == "revised"),
                || "day 5 was not replaced".to_string(),
            )?;
            ensure(!history.record_agent_decision("kimi", record(0), None), || "day 0 recorded".to_string())?;

            let proposal = Proposal {
                id: "3_kimi_0".to_string(),
                proposer: "kimi".to_string(),
                proposal_day: 3,
                ..Default::default()
            };
            history.set_current(vec![proposal.clone()], Vec::new());
            ensure(history.record_day_snapshot(3), || "day 3 bucket not created".to_string())?;
            ensure(!history.record_day_snapshot(3), || "day 3 bucket overwritten".to_string())?;
            ensure(!history.record_day_snapshot(0), || "day 0 bucket created".to_string())?;

            let mut approved = proposal;
            approved.status = ProposalStatus::Approved;
            history.set_current(vec![approved], Vec::new());
            let merged = history.all_proposals();
            ensure(merged.len() == 1 && merged[0].status == ProposalStatus::Approved, || {
                format!("merged proposals {:?}", merged.iter().map(|p| p.status).collect::<Vec<_>>())
            })?;
            Ok::<(), String>(())
        })();

        finish(Run::default(), result)
    }

    // =========================================================================
    // OBS-005
    // =========================================================================

    /// OBS-005: PlaybackTiming - per-kind step delays on the virtual clock.
    fn run_playback_timing(&self) -> Result<Run, (Run, String)> {
        info!("OBS-005: PlaybackTiming - step delays");
        let ctx = SimContext::new(self.seed);
        let source = PlaybackSource {
            phase: AgentPhase::Thinking,
            thinking: "split the rations".to_string(),
            actions: vec![
                AiAction::Propose {
                    content: "equal shares".to_string(),
                    reasoning: None,
                },
                AiAction::Vote {
                    proposal_id: "1_qwen_0".to_string(),
                    choice: VoteChoice::Support,
                    reasoning: None,
                },
                AiAction::DoNothing { reasoning: None },
            ],
        };
        let ms = Duration::from_millis;

        let result = (|| {
            let mut playback = PlaybackEngine::new(self.config.window_len, SpeedTier::Normal);
            playback.load("kimi", source.clone(), PlaybackMode::Live, ctx.now());
            ensure(playback.state() == PlaybackState::Playing, || "playback not playing".to_string())?;

            // think 5s -> propose 8.5s -> vote 6.5s -> last step
            for (hold, cursor) in [(5000, 1), (8500, 2), (6500, 3)] {
                ctx.advance_time(ms(hold - 1));
                playback.tick(ctx.now());
                ensure(playback.cursor() == cursor - 1, || format!("advanced early before step {}", cursor))?;
                ctx.advance_time(ms(1));
                playback.tick(ctx.now());
                ensure(playback.cursor() == cursor, || {
                    format!("cursor {} after {}ms, expected {}", playback.cursor(), hold, cursor)
                })?;
            }
            ensure(playback.state() == PlaybackState::Done, || "playback not done".to_string())?;
            ensure(!playback.has_pending_timer(), || "timer left after done".to_string())?;

            // Switching agents cancels the pending advance.
            playback.set_speed(SpeedTier::Fast, ctx.now());
            playback.load("kimi", source.clone(), PlaybackMode::Live, ctx.now());
            ctx.advance_time(ms(1000));
            playback.load("qwen", source.clone(), PlaybackMode::Live, ctx.now());
            ensure(playback.next_due() == Some(ctx.now() + ms(2500)), || {
                format!("fast think step due at {:?}", playback.next_due())
            })?;
            ensure(playback.agent() == Some("qwen") && playback.cursor() == 0, || "switch did not restart".to_string())?;

            playback.set_mode(PlaybackMode::Static, ctx.now());
            ensure(playback.state() == PlaybackState::Done && playback.cursor() == 3, || {
                "static mode did not jump to the last step".to_string()
            })?;
            ensure(playback.next_due().is_none(), || "static mode kept a timer".to_string())?;

            playback.clear();
            ensure(playback.state() == PlaybackState::Idle && playback.progress() == 0.0, || {
                "clear left state behind".to_string()
            })?;
            Ok::<(), String>(())
        })();

        finish(Run::default(), result)
    }

    // =========================================================================
    // OBS-006
    // =========================================================================

    /// OBS-006: PersistenceRoundtrip - restore after a restart.
    async fn run_persistence_roundtrip(&self) -> Result<Run, (Run, String)> {
        info!("OBS-006: PersistenceRoundtrip");
        let store = Arc::new(MemoryStateStore::new());
        let mut run = Run::default();

        let result = async {
            let (ctx, engine, mut observer) = self.setup(store.clone());
            observer.initial_load().await.map_err(|e| e.to_string())?;
            observer.start();
            for _ in 0..2 {
                drive_turn(&mut observer, &engine, &ctx, &mut run.metrics).await;
                run.turns += 1;
            }
            observer.apply_local(&ObserverCommand::SetAutoRun(true));
            observer.apply_local(&ObserverCommand::CycleSpeed);
            observer.save().map_err(|e| e.to_string())?;
            let saved = observer.persisted_state();
            run.metrics.requests = engine.request_count();
            drop(observer);

            let (_, _, restored) = self.setup(store.clone());
            let state = restored.persisted_state();
            ensure(state.agent_history == saved.agent_history, || "agent history not restored".to_string())?;
            ensure(state.day_buckets == saved.day_buckets, || "day buckets not restored".to_string())?;
            ensure(state.preferences == saved.preferences, || "preferences not restored".to_string())?;
            ensure(restored.preferences().speed == SpeedTier::Fast, || "speed not restored".to_string())?;
            ensure(state.system_state == saved.system_state, || "system state not restored".to_string())?;
            run.final_day = restored.system_state().day;
            drop(restored);

            let mut stale = saved;
            stale.version = STATE_VERSION + 1;
            let bytes = serde_json::to_vec(&stale).map_err(|e| e.to_string())?;
            store.put_raw(&bytes).map_err(|e| e.to_string())?;
            let (_, _, fresh) = self.setup(store.clone());
            ensure(fresh.history().agent_histories().is_empty(), || "stale record was restored".to_string())?;
            ensure(!fresh.preferences().auto_run, || "stale preferences were restored".to_string())?;
            ensure(
                fresh.preferences().poll_interval() == self.config.poll_interval,
                || "poll interval not seeded from config".to_string(),
            )?;
            Ok::<(), String>(())
        }
        .await;

        finish(run, result)
    }
}

/// Plays one engine turn, polling between every phase. Returns the number
/// of settlement records produced.
async fn drive_turn(
    observer: &mut SimObserver,
    engine: &ScriptedEngine,
    ctx: &SimContext,
    metrics: &mut ScenarioMetrics,
) -> usize {
    let interval = observer.preferences().poll_interval();
    let before = metrics.settlements;

    engine.begin_turn();
    metrics.count(&observer.poll_once().await);
    while engine.advance() {
        ctx.advance_time(interval);
        metrics.count(&observer.poll_once().await);
        observer.tick_timers();
    }
    engine.finish_turn();
    ctx.advance_time(interval);
    metrics.count(&observer.poll_once().await);
    observer.tick_timers();

    (metrics.settlements - before) as usize
}

fn finish(run: Run, result: Result<(), String>) -> Result<Run, (Run, String)> {
    match result {
        Ok(()) => Ok(run),
        Err(reason) => Err((run, reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_scenarios_pass() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_steady_turns_metrics() {
        let result = ScenarioRunner::new(7).with_turns(3).run(ScenarioId::SteadyTurns);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.turns, 3);
        assert_eq!(result.final_day, 4);
        assert_eq!(result.metrics.settlements, 15);
        assert_eq!(result.metrics.failed_ticks, 0);
        assert!(result.metrics.requests > 0);
    }

    #[test]
    fn test_flaky_network_counts_failures() {
        let result = ScenarioRunner::new(3).run(ScenarioId::FlakyNetwork);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.failed_ticks, 3);
    }

    #[test]
    fn test_stop_mid_flight_discards() {
        let result = ScenarioRunner::new(9).run(ScenarioId::StopMidFlight);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.discarded_ticks, 1);
    }

    #[test]
    fn test_other_seeds() {
        for seed in [1, 2, 1234, u64::MAX] {
            let result = ScenarioRunner::new(seed).with_turns(4).run(ScenarioId::SteadyTurns);
            assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
        }
    }
}
