//! Reconciliation Loop - live-state polling and settlement detection.
//!
//! The loop is Sans-IO. The runtime asks [`ReconciliationLoop::poll_due`]
//! for a [`TickTicket`], performs the fetch however it likes, and hands the
//! result back through [`ReconciliationLoop::complete`]. A ticket is only
//! honoured if it is the one in flight and was issued in the current
//! generation, so:
//! - at most one fetch is in flight; a slow response delays the next tick
//! - a result arriving after `stop()` is discarded and mutates nothing

use shelter_env::TaskId;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::{AiDecision, DecisionHistoryRecord, LiveState};
use crate::schedule::TaskSlot;

/// Permission to run one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTicket {
    generation: u64,
    seq: u64,
}

impl TickTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A settled turn's record for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub agent_name: String,
    /// Day the record belongs to, always >= 1
    pub day: u32,
    pub record: DecisionHistoryRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Stale ticket (stopped, restarted, or not the one in flight)
    Discarded,
    /// Fetch failed; the previous live state is untouched
    Failed,
    /// New live state applied. `settlements` is non-empty on running -> settled.
    Applied { settlements: Vec<Settlement> },
}

pub struct ReconciliationLoop {
    interval: Duration,
    timer: TaskSlot,
    started: bool,
    generation: u64,
    next_seq: u64,
    in_flight: Option<TickTicket>,
    live: Option<LiveState>,
    /// `running` as of the last applied sample
    last_running: bool,
    /// Day reported by the last sample that had `running = true`
    last_running_day: u32,
    decision_cache: HashMap<String, AiDecision>,
    applied: u64,
    failed: u64,
}

impl ReconciliationLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timer: TaskSlot::new(),
            started: false,
            generation: 0,
            next_seq: 0,
            in_flight: None,
            live: None,
            last_running: false,
            last_running_day: 0,
            decision_cache: HashMap::new(),
            applied: 0,
            failed: 0,
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Starts polling; the first tick is due immediately.
    pub fn start(&mut self, now: Duration) -> TaskId {
        if !self.started {
            info!("reconciliation loop started ({:?} cadence)", self.interval);
        }
        self.started = true;
        self.timer.schedule(now, Duration::ZERO)
    }

    /// Cancels the timer and invalidates any fetch in flight.
    pub fn stop(&mut self) {
        if self.started {
            info!("reconciliation loop stopped");
        }
        self.started = false;
        self.timer.cancel();
        self.generation += 1;
        self.in_flight = None;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Changes the cadence; takes effect from the next scheduled tick.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Deadline of the next tick, if one is scheduled.
    pub fn next_due(&self) -> Option<Duration> {
        self.timer.due_at()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    // =========================================================================
    // TICKS
    // =========================================================================

    /// Issues a ticket if the tick timer has fired and nothing is in flight.
    pub fn poll_due(&mut self, now: Duration) -> Option<TickTicket> {
        if !self.started || self.in_flight.is_some() {
            return None;
        }
        self.timer.take_if_due(now)?;
        Some(self.issue())
    }

    /// Issues a ticket immediately, skipping the timer. `None` while a
    /// fetch is already in flight or the loop is stopped.
    pub fn begin(&mut self) -> Option<TickTicket> {
        if !self.started || self.in_flight.is_some() {
            return None;
        }
        self.timer.cancel();
        Some(self.issue())
    }

    fn issue(&mut self) -> TickTicket {
        let ticket = TickTicket {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.in_flight = Some(ticket);
        ticket
    }

    /// Completes a fetch started with `ticket`.
    ///
    /// `sample` is `None` when the fetch failed. `recorded_at` stamps any
    /// settlement records (unix milliseconds).
    pub fn complete(
        &mut self,
        ticket: TickTicket,
        now: Duration,
        recorded_at: u64,
        sample: Option<LiveState>,
    ) -> TickOutcome {
        if ticket.generation != self.generation || self.in_flight != Some(ticket) {
            debug!("discarding stale tick #{}", ticket.seq);
            return TickOutcome::Discarded;
        }
        self.in_flight = None;
        if self.started {
            self.timer.schedule(now, self.interval);
        }

        match sample {
            None => {
                self.failed += 1;
                warn!("live state tick #{} failed; keeping previous state", ticket.seq);
                TickOutcome::Failed
            }
            Some(live) => {
                self.applied += 1;
                TickOutcome::Applied {
                    settlements: self.apply(live, recorded_at),
                }
            }
        }
    }

    fn apply(&mut self, mut live: LiveState, recorded_at: u64) -> Vec<Settlement> {
        let was_running = self.last_running;
        self.last_running = live.running;

        for agent in &mut live.agents {
            if agent.resource_request == 0.0 {
                if let Some(cached) = self.decision_cache.get(&agent.agent_name) {
                    if cached.resource_request != 0.0 {
                        agent.resource_request = cached.resource_request;
                    }
                }
            }
        }

        let mut settlements = Vec::new();
        if was_running && !live.running {
            // The service bumps its day counter before clearing `running`,
            // so the settled turn is the one seen while still running.
            let day = self.last_running_day.max(1);
            info!("turn settled; recording {} agents under day {}", live.agents.len(), day);
            settlements = live
                .agents
                .iter()
                .map(|agent| {
                    let cached = self.decision_cache.get(&agent.agent_name);
                    let thinking = if agent.decision_text.is_empty() {
                        cached.map(|d| d.thinking.clone()).unwrap_or_default()
                    } else {
                        agent.decision_text.clone()
                    };
                    let actions = if agent.actions.is_empty() {
                        cached.map(|d| d.actions.clone()).unwrap_or_default()
                    } else {
                        agent.actions.clone()
                    };
                    Settlement {
                        agent_name: agent.agent_name.clone(),
                        day,
                        record: DecisionHistoryRecord {
                            day,
                            thinking,
                            actions,
                            resource_request: agent.resource_request,
                            action_points: agent.action_points,
                            recorded_at,
                        },
                    }
                })
                .collect();
        }
        if live.running {
            self.last_running_day = live.day;
        }

        self.live = Some(live);
        settlements
    }

    // =========================================================================
    // STATE
    // =========================================================================

    pub fn live(&self) -> Option<&LiveState> {
        self.live.as_ref()
    }

    /// `running` as observed by the last applied sample.
    pub fn last_running(&self) -> bool {
        self.last_running
    }

    /// True once a sample has been applied and it reported a settled turn.
    pub fn is_settled(&self) -> bool {
        self.live.as_ref().map(|l| !l.running).unwrap_or(false)
    }

    /// Caches decisions used to back-fill zero resource requests.
    pub fn remember_decisions(&mut self, decisions: &[AiDecision]) {
        for decision in decisions {
            self.decision_cache
                .insert(decision.agent_name.clone(), decision.clone());
        }
    }

    pub fn cached_decision(&self, agent: &str) -> Option<&AiDecision> {
        self.decision_cache.get(agent)
    }

    /// Forgets the live state, the running memory and the decision cache.
    pub fn clear(&mut self) {
        self.live = None;
        self.last_running = false;
        self.last_running_day = 0;
        self.decision_cache.clear();
    }

    /// (applied, failed) tick counts.
    pub fn stats(&self) -> (u64, u64) {
        (self.applied, self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentLiveStatus, AgentPhase};

    const TICK: Duration = Duration::from_millis(2000);

    fn sample(day: u32, running: bool, request: f64) -> LiveState {
        LiveState {
            day,
            running,
            current_acting_agent: None,
            agents: vec![AgentLiveStatus {
                agent_name: "deepseek".to_string(),
                decision_text: "share evenly".to_string(),
                resource_request: request,
                phase: AgentPhase::Executing,
                ..Default::default()
            }],
        }
    }

    fn tick(lp: &mut ReconciliationLoop, now: Duration, live: Option<LiveState>) -> TickOutcome {
        let ticket = lp.begin().expect("ticket");
        lp.complete(ticket, now, 1, live)
    }

    #[test]
    fn test_first_tick_due_immediately() {
        let mut lp = ReconciliationLoop::new(TICK);
        assert!(lp.poll_due(Duration::ZERO).is_none());
        lp.start(Duration::ZERO);
        assert!(lp.poll_due(Duration::ZERO).is_some());
    }

    #[test]
    fn test_no_overlapping_ticks() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        let ticket = lp.poll_due(Duration::ZERO).unwrap();
        assert!(lp.poll_due(Duration::from_secs(30)).is_none());
        assert!(lp.begin().is_none());

        // A slow response pushes the next tick out from completion time.
        lp.complete(ticket, Duration::from_secs(30), 0, Some(sample(1, true, 0.0)));
        assert_eq!(lp.next_due(), Some(Duration::from_secs(32)));
        assert!(lp.poll_due(Duration::from_secs(31)).is_none());
        assert!(lp.poll_due(Duration::from_secs(32)).is_some());
    }

    #[test]
    fn test_failed_tick_keeps_previous_state() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        tick(&mut lp, TICK, Some(sample(2, true, 50.0)));
        assert_eq!(tick(&mut lp, TICK * 2, None), TickOutcome::Failed);
        assert_eq!(lp.live().unwrap().day, 2);
        assert!(lp.last_running());
        assert_eq!(lp.stats(), (1, 1));
    }

    #[test]
    fn test_settlement_uses_last_running_day() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        tick(&mut lp, TICK, Some(sample(6, true, 10.0)));
        // Day counter has already advanced when running clears.
        let outcome = tick(&mut lp, TICK * 2, Some(sample(7, false, 10.0)));
        match outcome {
            TickOutcome::Applied { settlements } => {
                assert_eq!(settlements.len(), 1);
                assert_eq!(settlements[0].day, 6);
                assert_eq!(settlements[0].record.thinking, "share evenly");
            }
            other => panic!("unexpected {:?}", other),
        }
        // settled -> settled emits nothing
        let outcome = tick(&mut lp, TICK * 3, Some(sample(7, false, 10.0)));
        assert_eq!(outcome, TickOutcome::Applied { settlements: vec![] });
    }

    #[test]
    fn test_settlement_day_zero_clamped() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        tick(&mut lp, TICK, Some(sample(0, true, 0.0)));
        match tick(&mut lp, TICK * 2, Some(sample(0, false, 0.0))) {
            TickOutcome::Applied { settlements } => assert_eq!(settlements[0].day, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_zero_request_backfilled_from_cache() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        lp.remember_decisions(&[AiDecision {
            agent_name: "deepseek".to_string(),
            resource_request: 180.0,
            ..Default::default()
        }]);
        tick(&mut lp, TICK, Some(sample(1, true, 0.0)));
        assert_eq!(lp.live().unwrap().agents[0].resource_request, 180.0);

        tick(&mut lp, TICK * 2, Some(sample(1, true, 95.0)));
        assert_eq!(lp.live().unwrap().agents[0].resource_request, 95.0);
    }

    #[test]
    fn test_no_writes_after_stop() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        let ticket = lp.poll_due(Duration::ZERO).unwrap();
        lp.stop();
        assert_eq!(
            lp.complete(ticket, TICK, 0, Some(sample(3, true, 0.0))),
            TickOutcome::Discarded
        );
        assert!(lp.live().is_none());
        assert!(lp.next_due().is_none());
        assert!(lp.poll_due(TICK * 10).is_none());
    }

    #[test]
    fn test_restart_invalidates_old_ticket() {
        let mut lp = ReconciliationLoop::new(TICK);
        lp.start(Duration::ZERO);
        let old = lp.poll_due(Duration::ZERO).unwrap();
        lp.stop();
        lp.start(TICK);
        let fresh = lp.poll_due(TICK).unwrap();
        assert_eq!(lp.complete(old, TICK, 0, None), TickOutcome::Discarded);
        assert!(matches!(
            lp.complete(fresh, TICK, 0, Some(sample(1, false, 0.0))),
            TickOutcome::Applied { .. }
        ));
    }
}
