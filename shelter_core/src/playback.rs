//! Timeline Playback Engine - paced replay of one agent's turn.
//!
//! A decision (reasoning text + ordered actions) and the agent's phase are
//! turned into an ordered list of [`TimelineStep`]s. In live mode a cursor
//! walks the list, holding each step for a duration that depends on its
//! kind; in static mode the cursor sits on the final step and no timer runs.
//!
//! ```text
//!   Idle ──load──► Building ──► Playing ──(last step)──► Done
//!     ▲                            │                       │
//!     └──────────── clear ─────────┴───────────────────────┘
//! ```
//!
//! The engine owns exactly one advance timer. Every transition that
//! invalidates it (load, clear, mode switch) cancels it before arming a new one.

use std::time::Duration;
use tracing::debug;

use crate::config::SpeedTier;
use crate::model::{AgentLiveStatus, AgentPhase, AiAction, AiDecision, DecisionHistoryRecord, VoteChoice};
use crate::schedule::TaskSlot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Idle,
    Building,
    Playing,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackMode {
    /// Steps are revealed on per-step timers
    #[default]
    Live,
    /// Final state shown immediately, no timers
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Think,
    Propose,
    Vote,
    PrivateMessage,
    CallMeeting,
    DoNothing,
    /// Synthetic step for an acting agent with nothing to execute
    NoAction,
}

impl StepKind {
    /// How long a step of this kind stays current at normal speed.
    pub fn base_delay(self) -> Duration {
        match self {
            StepKind::DoNothing => Duration::from_millis(1500),
            StepKind::Think => Duration::from_millis(5000),
            StepKind::Propose | StepKind::CallMeeting => Duration::from_millis(8500),
            StepKind::Vote | StepKind::PrivateMessage => Duration::from_millis(6500),
            StepKind::NoAction => Duration::from_millis(3000),
        }
    }

    pub fn delay(self, speed: SpeedTier) -> Duration {
        self.base_delay().mul_f64(speed.factor())
    }

    pub fn label(self) -> &'static str {
        match self {
            StepKind::Think => "think",
            StepKind::Propose => "propose",
            StepKind::Vote => "vote",
            StepKind::PrivateMessage => "message",
            StepKind::CallMeeting => "meeting",
            StepKind::DoNothing => "do nothing",
            StepKind::NoAction => "no action",
        }
    }
}

/// One displayable step.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineStep {
    pub kind: StepKind,
    pub title: String,
    pub detail: String,
    pub target: Option<String>,
    pub proposal_id: Option<String>,
    pub vote: Option<VoteChoice>,
    pub reasoning: Option<String>,
    /// Derived from an acting/executing phase rather than a plan
    pub executing: bool,
}

impl TimelineStep {
    fn new(kind: StepKind, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            detail: detail.into(),
            target: None,
            proposal_id: None,
            vote: None,
            reasoning: None,
            executing: false,
        }
    }
}

/// What a playback is derived from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSource {
    pub phase: AgentPhase,
    pub thinking: String,
    pub actions: Vec<AiAction>,
}

impl PlaybackSource {
    /// Live status, with empty fields back-filled from the cached decision.
    pub fn from_live(status: &AgentLiveStatus, decision: Option<&AiDecision>) -> Self {
        let thinking = if status.decision_text.is_empty() {
            decision.map(|d| d.thinking.clone()).unwrap_or_default()
        } else {
            status.decision_text.clone()
        };
        let actions = if status.actions.is_empty() {
            decision.map(|d| d.actions.clone()).unwrap_or_default()
        } else {
            status.actions.clone()
        };
        Self {
            phase: status.phase,
            thinking,
            actions,
        }
    }

    pub fn from_decision(decision: &AiDecision) -> Self {
        Self {
            phase: AgentPhase::Idle,
            thinking: decision.thinking.clone(),
            actions: decision.actions.clone(),
        }
    }

    /// A settled record, shown as its full reasoning and plan.
    pub fn from_record(record: &DecisionHistoryRecord) -> Self {
        Self {
            phase: AgentPhase::Idle,
            thinking: record.thinking.clone(),
            actions: record.actions.clone(),
        }
    }
}

// =============================================================================
// STEP DERIVATION
// =============================================================================

/// Derives the step list for `source`.
///
/// - thinking (and idle): one think step, then one step per planned action,
///   or a synthetic do-nothing step when there is no plan
/// - acting / executing: one step per action being executed, or a single
///   "no action available" step
pub fn derive_steps(source: &PlaybackSource) -> Vec<TimelineStep> {
    match source.phase {
        AgentPhase::Thinking | AgentPhase::Idle => {
            let mut steps = Vec::with_capacity(source.actions.len() + 1);
            let reasoning = if source.thinking.is_empty() {
                "(no reasoning recorded)".to_string()
            } else {
                source.thinking.clone()
            };
            steps.push(TimelineStep::new(StepKind::Think, "Thinking", reasoning));
            if source.actions.is_empty() {
                steps.push(TimelineStep::new(
                    StepKind::DoNothing,
                    "Plans to do nothing",
                    "No actions planned this turn",
                ));
            } else {
                steps.extend(source.actions.iter().map(|a| action_step(a, false)));
            }
            steps
        }
        AgentPhase::Acting | AgentPhase::Executing => {
            if source.actions.is_empty() {
                let mut step = TimelineStep::new(
                    StepKind::NoAction,
                    "No action available",
                    "Nothing to execute this turn",
                );
                step.executing = true;
                vec![step]
            } else {
                source.actions.iter().map(|a| action_step(a, true)).collect()
            }
        }
    }
}

fn action_step(action: &AiAction, executing: bool) -> TimelineStep {
    let verb = |plan: &'static str, exec: &'static str| if executing { exec } else { plan };
    let mut step = match action {
        AiAction::Propose { content, .. } => TimelineStep::new(
            StepKind::Propose,
            verb("Plans a proposal", "Proposing"),
            content.clone(),
        ),
        AiAction::Vote {
            proposal_id,
            choice,
            ..
        } => {
            let mut step = TimelineStep::new(
                StepKind::Vote,
                verb("Plans to vote", "Voting"),
                format!("{} proposal {}", choice.label(), proposal_id),
            );
            step.proposal_id = Some(proposal_id.clone());
            step.vote = Some(*choice);
            step
        }
        AiAction::PrivateMessage { target, content, .. } => {
            let mut step = TimelineStep::new(
                StepKind::PrivateMessage,
                format!("{} {}", verb("Plans to message", "Messaging"), target),
                content.clone(),
            );
            step.target = Some(target.clone());
            step
        }
        AiAction::CallMeeting {
            content, initiator, ..
        } => {
            let mut step = TimelineStep::new(
                StepKind::CallMeeting,
                verb("Plans a meeting", "Calling a meeting"),
                content.clone(),
            );
            step.target = initiator.clone();
            step
        }
        AiAction::DoNothing { .. } => TimelineStep::new(
            StepKind::DoNothing,
            verb("Plans to do nothing", "Doing nothing"),
            String::new(),
        ),
        AiAction::Think { content } => {
            TimelineStep::new(StepKind::Think, "Thinking", content.clone())
        }
    };
    step.reasoning = action.reasoning().map(str::to_string);
    step.executing = executing;
    step
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct PlaybackEngine {
    state: PlaybackState,
    mode: PlaybackMode,
    speed: SpeedTier,
    window_len: usize,
    windowed: bool,
    agent: Option<String>,
    source: Option<PlaybackSource>,
    steps: Vec<TimelineStep>,
    cursor: usize,
    timer: TaskSlot,
}

impl PlaybackEngine {
    pub fn new(window_len: usize, speed: SpeedTier) -> Self {
        Self {
            state: PlaybackState::Idle,
            mode: PlaybackMode::Live,
            speed,
            window_len: window_len.max(1),
            windowed: true,
            agent: None,
            source: None,
            steps: Vec::new(),
            cursor: 0,
            timer: TaskSlot::new(),
        }
    }

    /// Starts a new playback for `agent`, cancelling any pending advance.
    pub fn load(&mut self, agent: &str, source: PlaybackSource, mode: PlaybackMode, now: Duration) {
        self.timer.cancel();
        self.state = PlaybackState::Building;
        self.agent = Some(agent.to_string());
        self.mode = mode;
        self.steps = derive_steps(&source);
        self.source = Some(source);
        self.cursor = 0;
        debug!("playback for {}: {} steps ({:?})", agent, self.steps.len(), mode);
        self.settle_cursor(now);
    }

    /// Re-derives steps for the displayed agent without restarting.
    ///
    /// The cursor keeps its position (clamped); a playback that was `Done`
    /// resumes if new steps appeared. Returns whether the steps changed.
    pub fn refresh(&mut self, source: PlaybackSource, now: Duration) -> bool {
        if self.agent.is_none() || self.source.as_ref() == Some(&source) {
            return false;
        }
        let steps = derive_steps(&source);
        self.source = Some(source);
        if steps == self.steps {
            return false;
        }
        self.steps = steps;
        self.cursor = self.cursor.min(self.last_index());
        self.settle_cursor(now);
        true
    }

    /// Cancels the timer and forgets the playback.
    pub fn clear(&mut self) {
        self.timer.cancel();
        self.state = PlaybackState::Idle;
        self.agent = None;
        self.source = None;
        self.steps.clear();
        self.cursor = 0;
    }

    /// Switches mode. Entering live mode replays from the first step.
    pub fn set_mode(&mut self, mode: PlaybackMode, now: Duration) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        if self.agent.is_none() {
            return;
        }
        if mode == PlaybackMode::Live {
            self.cursor = 0;
        }
        self.timer.cancel();
        self.settle_cursor(now);
    }

    /// Changes pace; a pending advance is re-armed with the new factor.
    pub fn set_speed(&mut self, speed: SpeedTier, now: Duration) {
        self.speed = speed;
        if self.timer.is_pending() {
            self.arm(now);
        }
    }

    pub fn toggle_windowed(&mut self) -> bool {
        self.windowed = !self.windowed;
        self.windowed
    }

    /// Advances the cursor past every step whose hold time has elapsed.
    /// Returns whether the cursor moved.
    pub fn tick(&mut self, now: Duration) -> bool {
        let mut moved = false;
        while let Some(task) = self.timer.take_if_due(now) {
            if self.cursor >= self.last_index() {
                break;
            }
            self.cursor += 1;
            moved = true;
            debug!("playback cursor -> {}/{}", self.cursor + 1, self.steps.len());
            if self.cursor >= self.last_index() {
                self.state = PlaybackState::Done;
            } else {
                self.arm(task.due_at);
            }
        }
        moved
    }

    fn settle_cursor(&mut self, now: Duration) {
        if self.mode == PlaybackMode::Static {
            self.timer.cancel();
            self.cursor = self.last_index();
            self.state = PlaybackState::Done;
        } else if self.cursor >= self.last_index() {
            self.timer.cancel();
            self.state = PlaybackState::Done;
        } else {
            self.state = PlaybackState::Playing;
            if !self.timer.is_pending() {
                self.arm(now);
            }
        }
    }

    fn arm(&mut self, from: Duration) {
        if let Some(step) = self.steps.get(self.cursor) {
            self.timer.schedule(from, step.kind.delay(self.speed));
        }
    }

    fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    // =========================================================================
    // READ VIEWS
    // =========================================================================

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn speed(&self) -> SpeedTier {
        self.speed
    }

    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    pub fn steps(&self) -> &[TimelineStep] {
        &self.steps
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_windowed(&self) -> bool {
        self.windowed
    }

    pub fn current_step(&self) -> Option<&TimelineStep> {
        self.steps.get(self.cursor)
    }

    /// Fraction of steps revealed, 0.0 when idle.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        (self.cursor + 1) as f64 / self.steps.len() as f64
    }

    /// Revealed steps with the index of the first one. Windowed view keeps
    /// only the trailing `window_len` steps up to the cursor.
    pub fn visible_steps(&self) -> (usize, &[TimelineStep]) {
        if self.steps.is_empty() {
            return (0, &[]);
        }
        let end = self.cursor + 1;
        let start = if self.windowed {
            end.saturating_sub(self.window_len)
        } else {
            0
        };
        (start, &self.steps[start..end])
    }

    /// Deadline of the pending advance.
    pub fn next_due(&self) -> Option<Duration> {
        self.timer.due_at()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.timer.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn thinking(actions: Vec<AiAction>) -> PlaybackSource {
        PlaybackSource {
            phase: AgentPhase::Thinking,
            thinking: "divide by need".to_string(),
            actions,
        }
    }

    fn vote(id: &str) -> AiAction {
        AiAction::Vote {
            proposal_id: id.to_string(),
            choice: VoteChoice::Support,
            reasoning: Some("fair".to_string()),
        }
    }

    fn propose() -> AiAction {
        AiAction::Propose {
            content: "a:100,b:100".to_string(),
            reasoning: None,
        }
    }

    #[test]
    fn test_thinking_without_actions_gives_two_steps() {
        let steps = derive_steps(&thinking(vec![]));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind, StepKind::Think);
        assert_eq!(steps[0].detail, "divide by need");
        assert_eq!(steps[1].kind, StepKind::DoNothing);
    }

    #[test]
    fn test_executing_steps_carry_resolved_fields() {
        let source = PlaybackSource {
            phase: AgentPhase::Executing,
            thinking: String::new(),
            actions: vec![
                vote("1_a_0"),
                AiAction::PrivateMessage {
                    target: "kimi".to_string(),
                    content: "ally?".to_string(),
                    reasoning: None,
                },
            ],
        };
        let steps = derive_steps(&source);
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.executing));
        assert_eq!(steps[0].proposal_id.as_deref(), Some("1_a_0"));
        assert_eq!(steps[0].vote, Some(VoteChoice::Support));
        assert_eq!(steps[1].target.as_deref(), Some("kimi"));
    }

    #[test]
    fn test_acting_without_actions() {
        let source = PlaybackSource {
            phase: AgentPhase::Acting,
            ..Default::default()
        };
        let steps = derive_steps(&source);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::NoAction);
    }

    #[test]
    fn test_step_delays() {
        assert_eq!(StepKind::DoNothing.delay(SpeedTier::Normal), Duration::from_millis(1500));
        assert_eq!(StepKind::Think.delay(SpeedTier::Normal), Duration::from_millis(5000));
        assert_eq!(StepKind::Propose.delay(SpeedTier::Normal), Duration::from_millis(8500));
        assert_eq!(StepKind::Vote.delay(SpeedTier::Normal), Duration::from_millis(6500));
        assert_eq!(StepKind::NoAction.delay(SpeedTier::Normal), Duration::from_millis(3000));
        assert_eq!(StepKind::Think.delay(SpeedTier::Fast), Duration::from_millis(2500));
        assert_eq!(StepKind::Think.delay(SpeedTier::Slow), Duration::from_millis(7500));
    }

    #[test]
    fn test_live_playback_advances_on_step_delays() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose(), vote("p")]), PlaybackMode::Live, Duration::ZERO);
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.cursor(), 0);

        assert!(!engine.tick(Duration::from_millis(4999)));
        assert!(engine.tick(Duration::from_millis(5000)));
        assert_eq!(engine.current_step().unwrap().kind, StepKind::Propose);

        // think (5 s) + propose (8.5 s)
        assert!(engine.tick(Duration::from_millis(13_500)));
        assert_eq!(engine.state(), PlaybackState::Done);
        assert!(!engine.has_pending_timer());
        assert_relative_eq!(engine.progress(), 1.0);
    }

    #[test]
    fn test_tick_catches_up_after_long_gap() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose()]), PlaybackMode::Live, Duration::ZERO);
        assert!(engine.tick(Duration::from_secs(60)));
        assert_eq!(engine.state(), PlaybackState::Done);
    }

    #[test]
    fn test_static_mode_jumps_to_end() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose(), vote("p")]), PlaybackMode::Static, Duration::ZERO);
        assert_eq!(engine.state(), PlaybackState::Done);
        assert_eq!(engine.cursor(), 2);
        assert!(!engine.has_pending_timer());
    }

    #[test]
    fn test_switching_agent_replaces_timer() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose()]), PlaybackMode::Live, Duration::ZERO);
        engine.load("b", thinking(vec![]), PlaybackMode::Live, Duration::from_secs(1));
        assert_eq!(engine.agent(), Some("b"));
        // Old 5 s deadline from t=0 is gone; new one runs from t=1 s.
        assert_eq!(engine.next_due(), Some(Duration::from_secs(6)));
        assert!(!engine.tick(Duration::from_secs(5)));
    }

    #[test]
    fn test_clear_cancels_timer() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose()]), PlaybackMode::Live, Duration::ZERO);
        engine.clear();
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!(!engine.has_pending_timer());
        assert!(!engine.tick(Duration::from_secs(100)));
        assert_eq!(engine.progress(), 0.0);
    }

    #[test]
    fn test_refresh_resumes_done_playback() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        let source = PlaybackSource {
            phase: AgentPhase::Executing,
            ..Default::default()
        };
        engine.load("a", source, PlaybackMode::Live, Duration::ZERO);
        assert_eq!(engine.state(), PlaybackState::Done);

        let grown = PlaybackSource {
            phase: AgentPhase::Executing,
            thinking: String::new(),
            actions: vec![vote("p"), propose()],
        };
        assert!(engine.refresh(grown.clone(), Duration::from_secs(2)));
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.cursor(), 0);
        assert!(!engine.refresh(grown, Duration::from_secs(3)));
    }

    #[test]
    fn test_windowed_view_trails_cursor() {
        let mut engine = PlaybackEngine::new(2, SpeedTier::Normal);
        let actions = vec![propose(), vote("p"), vote("q")];
        engine.load("a", thinking(actions), PlaybackMode::Static, Duration::ZERO);
        let (start, steps) = engine.visible_steps();
        assert_eq!((start, steps.len()), (2, 2));

        assert!(!engine.toggle_windowed());
        let (start, steps) = engine.visible_steps();
        assert_eq!((start, steps.len()), (0, 4));
    }

    #[test]
    fn test_mode_switch_to_live_replays() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose()]), PlaybackMode::Static, Duration::ZERO);
        engine.set_mode(PlaybackMode::Live, Duration::from_secs(1));
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.cursor(), 0);
        assert_eq!(engine.next_due(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_speed_change_rearms() {
        let mut engine = PlaybackEngine::new(5, SpeedTier::Normal);
        engine.load("a", thinking(vec![propose()]), PlaybackMode::Live, Duration::ZERO);
        engine.set_speed(SpeedTier::Fast, Duration::from_secs(1));
        assert_eq!(engine.next_due(), Some(Duration::from_millis(3500)));
    }
}
