//! Core environment context trait for the Shelter observer.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the clock and the task executor so the observer
/// engines run unchanged in production (tokio) and in the deterministic
/// simulator (virtual clock).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` (in `shelter_sim`) - virtual clock advanced by the harness
#[async_trait]
pub trait ObserverContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// All timers (poll cadence, playback steps, settlement glow) are
    /// expressed as deadlines on this clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time, used for `recordedAt` stamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Used for long-running requests (a full simulated turn can take
    /// minutes) so that polling keeps its cadence.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Wall-clock milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64 {
        self.system_time()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
