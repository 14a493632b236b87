//! Deterministic observer scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// OBS-001: Polled turns settle into per-day history
    SteadyTurns,

    /// OBS-002: Failed polls leave the view untouched
    FlakyNetwork,

    /// OBS-003: Stop while a poll is in flight
    StopMidFlight,

    /// OBS-004: History cap and out-of-order day buckets
    OutOfOrderHistory,

    /// OBS-005: Playback step delays and cancellation
    PlaybackTiming,

    /// OBS-006: Persisted state survives a restart
    PersistenceRoundtrip,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyTurns,
            ScenarioId::FlakyNetwork,
            ScenarioId::StopMidFlight,
            ScenarioId::OutOfOrderHistory,
            ScenarioId::PlaybackTiming,
            ScenarioId::PersistenceRoundtrip,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyTurns => "steady_turns",
            ScenarioId::FlakyNetwork => "flaky_network",
            ScenarioId::StopMidFlight => "stop_mid_flight",
            ScenarioId::OutOfOrderHistory => "out_of_order_history",
            ScenarioId::PlaybackTiming => "playback_timing",
            ScenarioId::PersistenceRoundtrip => "persistence_roundtrip",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyTurns => "Stepped turns polled mid-flight, settlements keyed to the played day",
            ScenarioId::FlakyNetwork => "Injected failures and an offline window, live view stays stable",
            ScenarioId::StopMidFlight => "Stop with a poll in flight, late response is discarded",
            ScenarioId::OutOfOrderHistory => "History cap eviction with an older day recorded late",
            ScenarioId::PlaybackTiming => "Step delays per action kind, cancel on agent switch, speed tiers",
            ScenarioId::PersistenceRoundtrip => "Save and reload observer state, version mismatch starts fresh",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_turns" | "steadyturns" | "obs-001" => Ok(ScenarioId::SteadyTurns),
            "flaky_network" | "flakynetwork" | "obs-002" => Ok(ScenarioId::FlakyNetwork),
            "stop_mid_flight" | "stopmidflight" | "obs-003" => Ok(ScenarioId::StopMidFlight),
            "out_of_order_history" | "outoforderhistory" | "obs-004" => Ok(ScenarioId::OutOfOrderHistory),
            "playback_timing" | "playbacktiming" | "obs-005" => Ok(ScenarioId::PlaybackTiming),
            "persistence_roundtrip" | "persistenceroundtrip" | "obs-006" => {
                Ok(ScenarioId::PersistenceRoundtrip)
            }
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
            assert_eq!(id.to_string(), id.name());
            assert!(!id.description().is_empty());
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("OBS-003".parse::<ScenarioId>(), Ok(ScenarioId::StopMidFlight));
        assert_eq!("PlaybackTiming".parse::<ScenarioId>(), Ok(ScenarioId::PlaybackTiming));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
