//! Shelter Deterministic Simulation Harness
//!
//! Runs the real `shelter_core::Observer` against an in-process scripted
//! simulation service, with every source of non-determinism pinned down:
//! - **Time**: a virtual clock that only moves when a scenario advances it
//! - **Service**: a seeded engine that can be stepped phase by phase
//! - **Faults**: injected request failures and offline windows
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                       │
//! │  ┌────────────┐   get/post   ┌───────────────────────┐  │
//! │  │  Observer  │─────────────►│    ScriptedEngine     │  │
//! │  │ (real one) │              │ begin/advance/finish  │  │
//! │  └─────┬──────┘              └───────────────────────┘  │
//! │        │ now()                                          │
//! │  ┌─────▼──────┐                                         │
//! │  │ SimContext │  virtual clock, fixed epoch             │
//! │  └────────────┘                                         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shelter_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_turns(12).run(ScenarioId::SteadyTurns);
//! assert!(result.passed);
//! ```

mod context;
mod engine;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use engine::{ScriptedEngine, DEFAULT_ROSTER};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
