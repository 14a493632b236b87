//! Shelter TUI Dashboard Module
//! ==============================
//!
//! Terminal front end for the observer runtime.
//! Uses Ratatui for rendering and Crossbeam for view delivery.
//!
//! Enable with the `dashboard` feature flag.
//!
//! Features:
//! - Day / resources / efficiency header
//! - Agent list with settlement glow
//! - Timeline playback (windowed or full) with progress gauge
//! - Merged proposals and events
//! - Draggable, resizable step inspector (mouse)

use std::io::{self, Stdout};
use std::time::Duration;

use crossbeam::channel::Receiver;
use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, MouseButton,
        MouseEvent, MouseEventKind,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect as Area},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::OverlayConfig;
use crate::model::{AgentPhase, ProposalStatus};
use crate::observer::{LoadStatus, ObserverCommand, ObserverView};
use crate::overlay::{OverlayManager, Point, PointerDown, Rect, Viewport};
use crate::playback::{PlaybackMode, PlaybackState, TimelineStep};

/// What the main loop should do after an input event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAction {
    None,
    Quit,
    Send(ObserverCommand),
}

/// Pointer input reduced to what the overlay cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerInput {
    Down(Point),
    Drag(Point),
    Up,
}

// =============================================================================
// OBSERVER DASHBOARD
// =============================================================================

/// TUI dashboard driven by published [`ObserverView`]s.
pub struct ObserverDashboard {
    rx: Receiver<ObserverView>,
    commands: UnboundedSender<ObserverCommand>,
    view: ObserverView,
    overlay: OverlayManager,
    /// Screen rows of the visible timeline steps from the last frame
    timeline_rows: Vec<(usize, Rect)>,
    frame_count: usize,
}

impl ObserverDashboard {
    pub fn new(
        rx: Receiver<ObserverView>,
        commands: UnboundedSender<ObserverCommand>,
        overlay: OverlayConfig,
    ) -> Self {
        Self {
            rx,
            commands,
            view: ObserverView::default(),
            overlay: OverlayManager::new(overlay, Viewport::new(80, 24)),
            timeline_rows: Vec::new(),
            frame_count: 0,
        }
    }

    /// Run the TUI main loop (blocks until 'q' pressed)
    pub fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
        terminal.show_cursor()?;

        let _ = self.commands.send(ObserverCommand::Shutdown);
        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
        loop {
            // Keep only the newest view
            while let Ok(view) = self.rx.try_recv() {
                self.view = view;
            }

            terminal.draw(|f| self.ui(f))?;
            self.frame_count += 1;

            if !event::poll(Duration::from_millis(50))? {
                continue;
            }
            let action = match event::read()? {
                Event::Key(key) => self.on_key(key),
                Event::Mouse(mouse) => {
                    if let Some(input) = pointer_input(mouse) {
                        self.on_pointer(input);
                    }
                    InputAction::None
                }
                _ => InputAction::None,
            };
            match action {
                InputAction::Quit => break,
                InputAction::Send(command) => {
                    debug!("dashboard command: {:?}", command);
                    if self.commands.send(command).is_err() {
                        break;
                    }
                }
                InputAction::None => {}
            }
        }
        Ok(())
    }

    /// Applies a view directly (tests, or callers without a channel).
    pub fn set_view(&mut self, view: ObserverView) {
        self.view = view;
    }

    pub fn overlay(&self) -> &OverlayManager {
        &self.overlay
    }

    // =========================================================================
    // INPUT
    // =========================================================================

    /// Maps a key press to an action.
    pub fn on_key(&mut self, key: KeyEvent) -> InputAction {
        let command = match key.code {
            KeyCode::Esc => {
                self.overlay.cancel_key();
                return InputAction::None;
            }
            KeyCode::Char('q') => return InputAction::Quit,
            KeyCode::Tab => ObserverCommand::NextAgent,
            KeyCode::BackTab => ObserverCommand::PrevAgent,
            KeyCode::Char('w') => ObserverCommand::ToggleWindowed,
            KeyCode::Char('s') => ObserverCommand::ToggleStatic,
            KeyCode::Char('n') => ObserverCommand::RunNext,
            KeyCode::Char('a') => ObserverCommand::SetAutoRun(!self.view.preferences.auto_run),
            KeyCode::Char('+') => ObserverCommand::CycleSpeed,
            KeyCode::Char('r') => ObserverCommand::Reset,
            KeyCode::Char('R') => ObserverCommand::Retry,
            KeyCode::Char(c @ ('y' | 'x')) => match self.vote_command(c == 'y') {
                Some(command) => command,
                None => return InputAction::None,
            },
            KeyCode::Char('h') => match self.history_command() {
                Some(command) => command,
                None => return InputAction::None,
            },
            KeyCode::Char('l') => match (&self.view.inspecting, &self.view.selected_agent) {
                (Some(_), Some(agent)) => ObserverCommand::SelectAgent(agent.clone()),
                _ => return InputAction::None,
            },
            _ => return InputAction::None,
        };
        InputAction::Send(command)
    }

    /// Vote by the selected agent on the newest open proposal.
    fn vote_command(&self, support: bool) -> Option<ObserverCommand> {
        let agent = self.view.selected_agent.clone()?;
        let proposal = self.view.newest_open_proposal()?;
        Some(ObserverCommand::Vote {
            proposal_id: proposal.id.clone(),
            agent,
            support,
        })
    }

    /// Steps one record further back in the selected agent's history,
    /// starting from the newest.
    fn history_command(&self) -> Option<ObserverCommand> {
        let agent = self.view.selected_agent.clone()?;
        let records = &self.view.agent_history;
        let record = match self.view.inspecting {
            Some(day) => records
                .iter()
                .position(|r| r.day == day)
                .and_then(|i| records.get(i + 1))
                .or_else(|| records.first()),
            None => records.first(),
        }?;
        Some(ObserverCommand::InspectHistory {
            agent,
            day: record.day,
        })
    }

    /// Single dispatcher for pointer input.
    pub fn on_pointer(&mut self, input: PointerInput) {
        match input {
            PointerInput::Down(p) => {
                if self.overlay.pointer_down(p) != PointerDown::Ignored {
                    return;
                }
                let hit = self
                    .timeline_rows
                    .iter()
                    .find(|(_, row)| row.contains(p))
                    .copied();
                if let Some((index, row)) = hit {
                    let start = self.view.playback.first_index;
                    if let Some(step) = index
                        .checked_sub(start)
                        .and_then(|i| self.view.playback.steps.get(i))
                    {
                        let (title, content) = inspector_text(index, step);
                        self.overlay.open(row, index, title, content);
                    }
                }
            }
            PointerInput::Drag(p) => {
                self.overlay.pointer_move(p);
            }
            PointerInput::Up => self.overlay.pointer_up(),
        }
    }

    /// Records where timeline step `index` was drawn.
    pub fn set_timeline_rows(&mut self, rows: Vec<(usize, Rect)>) {
        self.timeline_rows = rows;
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn ui(&mut self, f: &mut Frame) {
        let area = f.area();
        self.overlay
            .set_viewport(Viewport::new(i32::from(area.width), i32::from(area.height)));

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(4), // Header
                Constraint::Min(8),    // Body
                Constraint::Length(1), // Footer
            ])
            .split(area);

        self.render_header(f, chunks[0]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length(22),
                Constraint::Percentage(45),
                Constraint::Min(20),
            ])
            .split(chunks[1]);

        self.render_agents(f, body[0]);
        self.render_timeline(f, body[1]);

        let side = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(body[2]);
        self.render_proposals(f, side[0]);
        self.render_events(f, side[1]);

        let footer = Paragraph::new(
            "q quit | Tab agent | n next | a auto | + speed | w window | s static | h/l history | y/x vote | r reset",
        )
        .style(Style::default().fg(Color::DarkGray));
        f.render_widget(footer, chunks[2]);

        self.render_overlay(f, area);
    }

    fn render_header(&self, f: &mut Frame, area: Area) {
        let view = &self.view;
        let halves = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(area);

        let status = match &view.load_status {
            LoadStatus::Loading => Span::styled("loading", Style::default().fg(Color::Yellow)),
            LoadStatus::Ready if view.game_over.is_some() => {
                Span::styled("GAME OVER", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))
            }
            LoadStatus::Ready => {
                let running = view.live.as_ref().map(|l| l.running).unwrap_or(false);
                if running || view.turn_in_flight {
                    Span::styled("running", Style::default().fg(Color::Green))
                } else {
                    Span::styled("settled", Style::default().fg(Color::Cyan))
                }
            }
            LoadStatus::Failed(reason) => Span::styled(
                format!("load failed: {} (R to retry)", reason),
                Style::default().fg(Color::Red),
            ),
        };

        let header = Paragraph::new(vec![
            Line::from(vec![
                Span::styled("Shelter Observer", Style::default().add_modifier(Modifier::BOLD)),
                Span::raw("  |  "),
                Span::styled(format!("Day {}", view.system_state.day), Style::default().fg(Color::Cyan)),
                Span::raw("  |  "),
                status,
            ]),
            Line::from(vec![
                Span::raw(format!("efficiency {}%", view.system_state.system_efficiency)),
                Span::raw("  |  "),
                Span::raw(format!("speed {}", view.preferences.speed.label())),
                Span::raw("  |  "),
                Span::raw(if view.preferences.auto_run { "auto-run on" } else { "auto-run off" }),
            ]),
        ])
        .block(Block::default().borders(Borders::BOTTOM));
        f.render_widget(header, halves[0]);

        let pct = view.system_state.remaining_percentage();
        let color = if pct < 20.0 {
            Color::Red
        } else if pct < 50.0 {
            Color::Yellow
        } else {
            Color::Green
        };
        let gauge = Gauge::default()
            .block(Block::default().title("Resources").borders(Borders::ALL))
            .gauge_style(Style::default().fg(color))
            .percent(pct.clamp(0.0, 100.0) as u16)
            .label(format!(
                "{:.0}/{:.0}",
                view.system_state.remaining_resources, view.system_state.total_resources
            ));
        f.render_widget(gauge, halves[1]);
    }

    fn render_agents(&self, f: &mut Frame, area: Area) {
        let view = &self.view;
        let items: Vec<ListItem> = view
            .agent_names()
            .into_iter()
            .map(|name| {
                let phase = view
                    .live
                    .as_ref()
                    .and_then(|l| l.agent(&name))
                    .map(|a| a.phase)
                    .unwrap_or_default();
                let mut style = Style::default();
                if view.glowing.contains(&name) {
                    style = style.fg(Color::Yellow).add_modifier(Modifier::BOLD);
                }
                if view.selected_agent.as_deref() == Some(name.as_str()) {
                    style = style.add_modifier(Modifier::REVERSED);
                }
                let marker = match phase {
                    AgentPhase::Thinking => "?",
                    AgentPhase::Acting | AgentPhase::Executing => ">",
                    AgentPhase::Idle => " ",
                };
                ListItem::new(Line::from(Span::styled(format!("{} {}", marker, name), style)))
            })
            .collect();
        let list = List::new(items).block(Block::default().title("Agents").borders(Borders::ALL));
        f.render_widget(list, area);
    }

    fn render_timeline(&mut self, f: &mut Frame, area: Area) {
        let playback = &self.view.playback;
        let parts = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(3)])
            .split(area);

        let title = match (&playback.agent, self.view.inspecting, playback.mode) {
            (Some(agent), Some(day), _) => format!("Timeline: {} (day {} record, l for live)", agent, day),
            (Some(agent), None, PlaybackMode::Static) => format!("Timeline: {} (static)", agent),
            (Some(agent), None, PlaybackMode::Live) => format!("Timeline: {}", agent),
            (None, _, _) => "Timeline".to_string(),
        };
        let block = Block::default().title(title).borders(Borders::ALL);
        let inner = block.inner(parts[0]);

        let mut rows = Vec::new();
        let lines: Vec<Line> = playback
            .steps
            .iter()
            .enumerate()
            .take(usize::from(inner.height))
            .map(|(i, step)| {
                let index = playback.first_index + i;
                rows.push((
                    index,
                    Rect::new(
                        i32::from(inner.x),
                        i32::from(inner.y) + i as i32,
                        i32::from(inner.width),
                        1,
                    ),
                ));
                let style = if index == playback.cursor {
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
                } else if index < playback.cursor {
                    Style::default()
                } else {
                    Style::default().fg(Color::DarkGray)
                };
                Line::from(Span::styled(
                    format!("{:>2} {:<8} {}", index + 1, step.kind.label(), step.title),
                    style,
                ))
            })
            .collect();
        f.render_widget(Paragraph::new(lines).block(block), parts[0]);
        self.timeline_rows = rows;

        let label = match playback.state {
            PlaybackState::Idle => "idle".to_string(),
            PlaybackState::Building => "building".to_string(),
            _ => format!(
                "{}/{}{}",
                (playback.cursor + 1).min(playback.total_steps),
                playback.total_steps,
                if playback.windowed { " (windowed)" } else { "" }
            ),
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL))
            .gauge_style(Style::default().fg(Color::Cyan))
            .ratio(playback.progress.clamp(0.0, 1.0))
            .label(label);
        f.render_widget(gauge, parts[1]);
    }

    fn render_proposals(&self, f: &mut Frame, area: Area) {
        let items: Vec<ListItem> = self
            .view
            .proposals
            .iter()
            .map(|p| {
                let color = match p.status {
                    ProposalStatus::Approved => Color::Green,
                    ProposalStatus::Rejected => Color::Red,
                    _ => Color::Yellow,
                };
                ListItem::new(Line::from(vec![
                    Span::styled(format!("[{}] ", p.status.label()), Style::default().fg(color)),
                    Span::raw(format!(
                        "d{} {} +{}/-{} {}",
                        p.proposal_day,
                        p.proposer,
                        p.supporters.len(),
                        p.opposers.len(),
                        p.content
                    )),
                ]))
            })
            .collect();
        let list = List::new(items).block(Block::default().title("Proposals").borders(Borders::ALL));
        f.render_widget(list, area);
    }

    fn render_events(&self, f: &mut Frame, area: Area) {
        let items: Vec<ListItem> = self
            .view
            .events
            .iter()
            .map(|e| {
                ListItem::new(format!("d{} {:<8} {}", e.day, e.kind.label(), e.description))
            })
            .collect();
        let list = List::new(items).block(Block::default().title("Events").borders(Borders::ALL));
        f.render_widget(list, area);
    }

    fn render_overlay(&self, f: &mut Frame, frame: Area) {
        let Some(state) = self.overlay.overlay() else {
            return;
        };
        let area = to_area(state.rect).intersection(frame);
        if area.width == 0 || area.height == 0 {
            return;
        }
        let panel = Paragraph::new(state.content.as_str())
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .title(state.title.as_str())
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(Color::Magenta)),
            );
        f.render_widget(Clear, area);
        f.render_widget(panel, area);
    }
}

fn pointer_input(mouse: MouseEvent) -> Option<PointerInput> {
    let p = Point::new(i32::from(mouse.column), i32::from(mouse.row));
    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => Some(PointerInput::Down(p)),
        MouseEventKind::Drag(MouseButton::Left) => Some(PointerInput::Drag(p)),
        MouseEventKind::Up(MouseButton::Left) => Some(PointerInput::Up),
        _ => None,
    }
}

fn to_area(rect: Rect) -> Area {
    let clamp = |v: i32| v.clamp(0, i32::from(u16::MAX)) as u16;
    Area::new(clamp(rect.x), clamp(rect.y), clamp(rect.width), clamp(rect.height))
}

/// Title and body for the inspector of one step.
fn inspector_text(index: usize, step: &TimelineStep) -> (String, String) {
    let mut body = vec![step.detail.clone()];
    if let Some(target) = &step.target {
        body.push(format!("target: {}", target));
    }
    if let Some(id) = &step.proposal_id {
        body.push(format!("proposal: {}", id));
    }
    if let Some(vote) = step.vote {
        body.push(format!("vote: {}", vote.label()));
    }
    if let Some(reasoning) = &step.reasoning {
        body.push(String::new());
        body.push(reasoning.clone());
    }
    (format!("Step {}: {}", index + 1, step.kind.label()), body.join("\n"))
}

// =============================================================================
// TESTS
// =============================================================================
