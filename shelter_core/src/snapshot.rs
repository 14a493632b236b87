//! Snapshot Client - bounded-timeout requests to the simulation service.
//!
//! Every method comes in two flavours:
//! - `try_*` returns `Result<_, EnvError>` for callers that need to know
//! - the plain method degrades a failure to a typed default and logs a warning
//!
//! Only [`SnapshotClient::load_full_state`] propagates errors, because the
//! initial load blocks the presentation until it succeeds.

use serde_json::{json, Value};
use shelter_env::{Endpoint, EnvError, SimulationTransport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ObserverConfig;
use crate::model::{AgentSummary, AiDecision, GameEvent, LiveState, Proposal, SystemState, TurnResult};
use crate::wire;

/// Everything the presentation needs before first render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullState {
    pub system_state: SystemState,
    pub agents: Vec<AgentSummary>,
    pub proposals: Vec<Proposal>,
    pub events: Vec<GameEvent>,
    pub decisions: Vec<AiDecision>,
}

/// Typed, normalizing client over a [`SimulationTransport`].
pub struct SnapshotClient<T: SimulationTransport> {
    transport: Arc<T>,
    request_timeout: Duration,
    run_next_timeout: Duration,
}

impl<T: SimulationTransport> Clone for SnapshotClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            request_timeout: self.request_timeout,
            run_next_timeout: self.run_next_timeout,
        }
    }
}

impl<T: SimulationTransport> SnapshotClient<T> {
    pub fn new(transport: Arc<T>, request_timeout: Duration, run_next_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
            run_next_timeout,
        }
    }

    /// Builds a client with the timeouts from `config`.
    pub fn from_config(transport: Arc<T>, config: &ObserverConfig) -> Self {
        Self::new(transport, config.request_timeout, config.run_next_timeout)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    async fn fetch(&self, endpoint: Endpoint) -> Result<Value, EnvError> {
        let path = endpoint.path();
        debug!("GET {}", path);
        self.transport.get(&path, self.request_timeout).await
    }

    // =========================================================================
    // FALLIBLE REQUESTS
    // =========================================================================

    pub async fn try_live_state(&self) -> Result<LiveState, EnvError> {
        let raw = self.fetch(Endpoint::LiveState).await?;
        Ok(wire::normalize_live_state(&raw))
    }

    pub async fn try_status(&self) -> Result<SystemState, EnvError> {
        let raw = self.fetch(Endpoint::Status).await?;
        Ok(wire::normalize_status(&raw))
    }

    pub async fn try_agent_list(&self) -> Result<Vec<AgentSummary>, EnvError> {
        let raw = self.fetch(Endpoint::AiList).await?;
        Ok(wire::normalize_agents(&raw))
    }

    pub async fn try_proposals(&self) -> Result<Vec<Proposal>, EnvError> {
        let raw = self.fetch(Endpoint::Proposals).await?;
        Ok(wire::normalize_proposals(&raw))
    }

    pub async fn try_events(&self) -> Result<Vec<GameEvent>, EnvError> {
        let raw = self.fetch(Endpoint::Events).await?;
        Ok(wire::normalize_events(&raw))
    }

    pub async fn try_decisions(&self) -> Result<Vec<AiDecision>, EnvError> {
        let raw = self.fetch(Endpoint::AiDecisions).await?;
        Ok(wire::normalize_decisions(&raw))
    }

    pub async fn try_agent_decision(&self, name: &str) -> Result<Option<AiDecision>, EnvError> {
        let raw = self.fetch(Endpoint::AiDecision(name.to_string())).await?;
        Ok(wire::normalize_decision(&raw))
    }

    pub async fn try_run_next(&self) -> Result<TurnResult, EnvError> {
        let path = Endpoint::RunNext.path();
        debug!("POST {} (timeout {:?})", path, self.run_next_timeout);
        let raw = self.transport.post(&path, None, self.run_next_timeout).await?;
        Ok(wire::normalize_turn(&raw))
    }

    pub async fn try_vote(&self, proposal_id: &str, agent: &str, support: bool) -> Result<(), EnvError> {
        let path = Endpoint::Vote(proposal_id.to_string()).path();
        let body = json!({ "aiName": agent, "support": support });
        self.transport
            .post(&path, Some(body), self.request_timeout)
            .await
            .map(|_| ())
    }

    pub async fn try_reset(&self) -> Result<(), EnvError> {
        self.transport
            .post(&Endpoint::Reset.path(), None, self.request_timeout)
            .await
            .map(|_| ())
    }

    // =========================================================================
    // DEGRADING REQUESTS
    // =========================================================================

    /// `None` when the sample could not be fetched.
    pub async fn live_state(&self) -> Option<LiveState> {
        soft("live_state", self.try_live_state().await)
    }

    pub async fn status(&self) -> Option<SystemState> {
        soft("status", self.try_status().await)
    }

    pub async fn agent_list(&self) -> Vec<AgentSummary> {
        soft("ai_list", self.try_agent_list().await).unwrap_or_default()
    }

    pub async fn proposals(&self) -> Vec<Proposal> {
        soft("proposals", self.try_proposals().await).unwrap_or_default()
    }

    pub async fn events(&self) -> Vec<GameEvent> {
        soft("events", self.try_events().await).unwrap_or_default()
    }

    pub async fn decisions(&self) -> Vec<AiDecision> {
        soft("ai_decisions", self.try_decisions().await).unwrap_or_default()
    }

    pub async fn agent_decision(&self, name: &str) -> Option<AiDecision> {
        soft("ai decision", self.try_agent_decision(name).await).flatten()
    }

    /// Runs one full simulated turn. `None` on failure.
    pub async fn run_next(&self) -> Option<TurnResult> {
        soft("run_next", self.try_run_next().await)
    }

    /// Casts a vote on behalf of `agent`; returns the acknowledgement.
    pub async fn vote(&self, proposal_id: &str, agent: &str, support: bool) -> bool {
        soft("vote", self.try_vote(proposal_id, agent, support).await).is_some()
    }

    pub async fn reset(&self) -> bool {
        soft("reset", self.try_reset().await).is_some()
    }

    /// Fetches status, roster, proposals, events and decisions.
    ///
    /// Fails on the first transport error.
    pub async fn load_full_state(&self) -> Result<FullState, EnvError> {
        Ok(FullState {
            system_state: self.try_status().await?,
            agents: self.try_agent_list().await?,
            proposals: self.try_proposals().await?,
            events: self.try_events().await?,
            decisions: self.try_decisions().await?,
        })
    }
}

fn soft<V>(what: &str, result: Result<V, EnvError>) -> Option<V> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} request failed: {}", what, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned responses keyed by path; unknown paths fail with a network error.
    #[derive(Default)]
    struct StubTransport {
        responses: HashMap<String, Value>,
        posts: Mutex<Vec<(String, Option<Value>, Duration)>>,
    }

    impl StubTransport {
        fn with(mut self, path: &str, value: Value) -> Self {
            self.responses.insert(path.to_string(), value);
            self
        }
    }

    #[async_trait]
    impl SimulationTransport for StubTransport {
        async fn get(&self, path: &str, _timeout: Duration) -> Result<Value, EnvError> {
            self.responses
                .get(path)
                .cloned()
                .ok_or_else(|| EnvError::network("connection refused"))
        }

        async fn post(&self, path: &str, body: Option<Value>, timeout: Duration) -> Result<Value, EnvError> {
            self.posts.lock().unwrap().push((path.to_string(), body, timeout));
            self.responses
                .get(path)
                .cloned()
                .ok_or(EnvError::Timeout(timeout.as_millis() as u64))
        }
    }

    fn client(stub: StubTransport) -> SnapshotClient<StubTransport> {
        SnapshotClient::new(Arc::new(stub), Duration::from_secs(10), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_failures_degrade_to_defaults() {
        let client = client(StubTransport::default());
        assert!(client.live_state().await.is_none());
        assert!(client.status().await.is_none());
        assert!(client.proposals().await.is_empty());
        assert!(client.events().await.is_empty());
        assert!(client.agent_decision("a").await.is_none());
        assert!(client.run_next().await.is_none());
        assert!(!client.reset().await);
    }

    #[tokio::test]
    async fn test_status_normalized() {
        let client = client(StubTransport::default().with(
            "status",
            json!({"day": 2, "remainingResources": 3500, "totalResources": 5000, "systemEfficiency": 0.842}),
        ));
        let status = client.status().await.unwrap();
        assert_eq!(status.system_efficiency, 84);
        assert_eq!(status.remaining_percentage(), 70.0);
    }

    #[tokio::test]
    async fn test_load_full_state_propagates_first_error() {
        let client = client(
            StubTransport::default()
                .with("status", json!({"day": 1}))
                .with("ai_list", json!([])),
        );
        assert!(matches!(
            client.load_full_state().await,
            Err(EnvError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_load_full_state_ok() {
        let client = client(
            StubTransport::default()
                .with("status", json!({"day": 1}))
                .with("ai_list", json!([{"name": "a", "alive": true}]))
                .with("proposals", json!([]))
                .with("events", json!([]))
                .with("ai_decisions", json!([{"name": "a", "thinking": "hm", "resourceRequest": 120}])),
        );
        let state = client.load_full_state().await.unwrap();
        assert_eq!(state.agents.len(), 1);
        assert_eq!(state.decisions[0].resource_request, 120.0);
    }

    #[tokio::test]
    async fn test_run_next_uses_long_timeout() {
        let stub = StubTransport::default().with("run_next", json!({"system_state": {"day": 4}}));
        let client = client(stub);
        let turn = client.run_next().await.unwrap();
        assert_eq!(turn.system_state.unwrap().day, 4);
        let posts = client.transport().posts.lock().unwrap();
        assert_eq!(posts[0].2, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_vote_body() {
        let stub = StubTransport::default().with("proposals/1_a_0/vote", json!({"message": "ok"}));
        let client = client(stub);
        assert!(client.vote("1_a_0", "kimi", true).await);
        let posts = client.transport().posts.lock().unwrap();
        assert_eq!(posts[0].1, Some(json!({"aiName": "kimi", "support": true})));
    }
}
