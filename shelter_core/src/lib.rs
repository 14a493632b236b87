//! Shelter Core - observation client for a turn-based multi-agent simulation
//!
//! This library turns a remote simulation's polled snapshots into a coherent,
//! human-paced view:
//! 1. **Reconciliation**: live-state polling with settlement detection
//! 2. **History**: cross-day merge of transient "current" data with per-day buckets
//! 3. **Playback**: timed, cancelable replay of one agent's turn
//! 4. **Overlay**: draggable / resizable inspector geometry
//!
//! The engines are Sans-IO; [`observer::Observer`] composes them over a
//! [`shelter_env::ObserverContext`] and [`shelter_env::SimulationTransport`].

pub mod config;
pub mod history;
pub mod model;
pub mod observer;
pub mod overlay;
pub mod persistence;
pub mod playback;
pub mod reconcile;
pub mod schedule;
pub mod snapshot;
pub mod wire;

#[cfg(feature = "dashboard")]
pub mod dashboard;

// Re-export key types for convenience
pub use config::{ControlPreferences, ObserverConfig, OverlayConfig, SpeedTier};
pub use history::{DayBucket, HistoryStore};
pub use observer::{LoadStatus, Observer, ObserverCommand, ObserverError, ObserverView};
pub use overlay::{OverlayManager, Point, Rect, Viewport};
pub use persistence::{MemoryStateStore, PersistedState, SledStateStore, StateStore, StoreError};
pub use playback::{PlaybackEngine, PlaybackMode, PlaybackState, TimelineStep};
pub use reconcile::{ReconciliationLoop, Settlement, TickOutcome, TickTicket};
pub use snapshot::{FullState, SnapshotClient};
