//! History Merge Engine - cross-day history with deduplicated read views.
//!
//! Two persistent maps:
//! - day buckets: the proposals / events / vote analyses captured for a day
//! - agent history: up to `cap` recent decision records per agent, newest first
//!
//! plus the transient "current" collections for the day in flight. Read
//! views merge every bucket with the current collections by id; the current
//! entry always wins.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::model::{DecisionHistoryRecord, GameEvent, Proposal, VoteAnalysis};

/// Default number of decision records kept per agent.
pub const DEFAULT_HISTORY_CAP: usize = 10;

/// One day's captured data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayBucket {
    pub proposals: Vec<Proposal>,
    pub events: Vec<GameEvent>,
    pub vote_analyses: Vec<VoteAnalysis>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    cap: usize,
    day_buckets: BTreeMap<u32, DayBucket>,
    agent_history: BTreeMap<String, Vec<DecisionHistoryRecord>>,
    current_proposals: Vec<Proposal>,
    current_events: Vec<GameEvent>,
    current_analyses: Vec<VoteAnalysis>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl HistoryStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            day_buckets: BTreeMap::new(),
            agent_history: BTreeMap::new(),
            current_proposals: Vec::new(),
            current_events: Vec::new(),
            current_analyses: Vec::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    // =========================================================================
    // MUTATORS
    // =========================================================================

    /// Replaces the in-flight collections.
    pub fn set_current(&mut self, proposals: Vec<Proposal>, events: Vec<GameEvent>) {
        self.current_proposals = proposals;
        self.current_events = events;
        self.analyze_current();
    }

    /// Upserts a single in-flight proposal (e.g. after a local vote).
    pub fn upsert_current_proposal(&mut self, proposal: Proposal) {
        match self.current_proposals.iter_mut().find(|p| p.id == proposal.id) {
            Some(existing) => *existing = proposal,
            None => self.current_proposals.push(proposal),
        }
        self.analyze_current();
    }

    fn analyze_current(&mut self) {
        self.current_analyses = self
            .current_proposals
            .iter()
            .map(VoteAnalysis::from_proposal)
            .collect();
    }

    /// Captures the in-flight collections under `day`.
    ///
    /// First write wins: day 0 and days that already have a bucket are
    /// no-ops. Returns whether a bucket was created.
    pub fn record_day_snapshot(&mut self, day: u32) -> bool {
        if day == 0 {
            debug!("skipping day snapshot for day 0");
            return false;
        }
        if self.day_buckets.contains_key(&day) {
            debug!("day {} already captured", day);
            return false;
        }
        self.day_buckets.insert(
            day,
            DayBucket {
                proposals: self.current_proposals.clone(),
                events: self.current_events.clone(),
                vote_analyses: self.current_vote_analyses(),
            },
        );
        true
    }

    /// Upserts a decision record into `agent`'s history.
    ///
    /// The target day is `day` when given, else `record.day`. A record for a
    /// day already present replaces it in place; otherwise it is prepended.
    /// The list is then truncated to the cap by position. Day 0 is a no-op.
    pub fn record_agent_decision(
        &mut self,
        agent: &str,
        mut record: DecisionHistoryRecord,
        day: Option<u32>,
    ) -> bool {
        let day = day.unwrap_or(record.day);
        if day == 0 || agent.is_empty() {
            debug!("ignoring decision record for {:?} on day {}", agent, day);
            return false;
        }
        record.day = day;

        let entries = self.agent_history.entry(agent.to_string()).or_default();
        match entries.iter_mut().find(|r| r.day == day) {
            Some(existing) => *existing = record,
            None => entries.insert(0, record),
        }
        entries.truncate(self.cap);
        true
    }

    /// Drops everything, including the in-flight collections.
    pub fn clear(&mut self) {
        self.day_buckets.clear();
        self.agent_history.clear();
        self.current_proposals.clear();
        self.current_events.clear();
        self.current_analyses.clear();
    }

    /// Replaces the whole store with previously exported state.
    ///
    /// Saved vote analyses are taken as-is; an empty list is re-derived
    /// from the restored proposals.
    pub fn restore(
        &mut self,
        day_buckets: BTreeMap<u32, DayBucket>,
        agent_history: BTreeMap<String, Vec<DecisionHistoryRecord>>,
        proposals: Vec<Proposal>,
        events: Vec<GameEvent>,
        vote_analyses: Vec<VoteAnalysis>,
    ) {
        self.day_buckets = day_buckets;
        self.day_buckets.remove(&0);
        self.agent_history = agent_history;
        for entries in self.agent_history.values_mut() {
            entries.retain(|r| r.day != 0);
            entries.truncate(self.cap);
        }
        self.set_current(proposals, events);
        if !vote_analyses.is_empty() {
            self.current_analyses = vote_analyses;
        }
    }

    // =========================================================================
    // READ VIEWS
    // =========================================================================

    pub fn day_buckets(&self) -> &BTreeMap<u32, DayBucket> {
        &self.day_buckets
    }

    pub fn day_bucket(&self, day: u32) -> Option<&DayBucket> {
        self.day_buckets.get(&day)
    }

    pub fn agent_histories(&self) -> &BTreeMap<String, Vec<DecisionHistoryRecord>> {
        &self.agent_history
    }

    /// Newest-first decision records for `agent`.
    pub fn agent_history(&self, agent: &str) -> &[DecisionHistoryRecord] {
        self.agent_history
            .get(agent)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn current_proposals(&self) -> &[Proposal] {
        &self.current_proposals
    }

    pub fn current_events(&self) -> &[GameEvent] {
        &self.current_events
    }

    pub fn current_vote_analyses(&self) -> Vec<VoteAnalysis> {
        self.current_analyses.clone()
    }

    /// Every proposal across all days, unique by id, newest first.
    pub fn all_proposals(&self) -> Vec<Proposal> {
        let mut merged = merge_by_id(
            self.day_buckets.values().map(|b| b.proposals.as_slice()),
            &self.current_proposals,
            |p| &p.id,
        );
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        merged
    }

    /// Every event across all days, unique by id, newest first.
    pub fn all_events(&self) -> Vec<GameEvent> {
        let mut merged = merge_by_id(
            self.day_buckets.values().map(|b| b.events.as_slice()),
            &self.current_events,
            |e| &e.id,
        );
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        merged
    }

    /// Every vote analysis across all days, unique by proposal id, in first
    /// insertion order (oldest day first, then the current day).
    pub fn all_vote_analyses(&self) -> Vec<VoteAnalysis> {
        let current = self.current_vote_analyses();
        merge_by_id(
            self.day_buckets.values().map(|b| b.vote_analyses.as_slice()),
            &current,
            |a| &a.proposal_id,
        )
    }
}

/// Merges historical slices with the current slice by id, keeping the first
/// insertion position of each id and the last written value.
fn merge_by_id<'a, V, I, K>(historical: I, current: &'a [V], key: K) -> Vec<V>
where
    V: Clone + 'a,
    I: IntoIterator<Item = &'a [V]>,
    K: Fn(&V) -> &String,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<V> = Vec::new();
    for item in historical.into_iter().flatten().chain(current.iter()) {
        match positions.get(key(item)) {
            Some(&index) => merged[index] = item.clone(),
            None => {
                positions.insert(key(item).clone(), merged.len());
                merged.push(item.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventKind, ProposalStatus, VoteChoice};
    use proptest::prelude::*;

    fn record(day: u32, thinking: &str) -> DecisionHistoryRecord {
        DecisionHistoryRecord {
            day,
            thinking: thinking.to_string(),
            ..Default::default()
        }
    }

    fn proposal(id: &str, created_at: i64, content: &str) -> Proposal {
        Proposal {
            id: id.to_string(),
            content: content.to_string(),
            created_at,
            ..Default::default()
        }
    }

    fn event(id: &str, timestamp: i64) -> GameEvent {
        GameEvent {
            id: id.to_string(),
            kind: EventKind::Action,
            timestamp,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_day_decision_replaced_in_place() {
        let mut store = HistoryStore::default();
        store.record_agent_decision("a", record(3, "first"), None);
        store.record_agent_decision("a", record(4, "other"), None);
        store.record_agent_decision("a", record(0, "ignored"), Some(3));
        store.record_agent_decision("a", record(0, "second"), Some(3));

        let history = store.agent_history("a");
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| r.day == 3).count(), 1);
        assert_eq!(history[1].thinking, "second");
        assert_eq!(history[0].day, 4);
    }

    #[test]
    fn test_day_zero_decision_is_noop() {
        let mut store = HistoryStore::default();
        assert!(!store.record_agent_decision("a", record(0, "pre"), None));
        assert!(store.agent_history("a").is_empty());
    }

    #[test]
    fn test_cap_evicts_by_position() {
        let mut store = HistoryStore::new(3);
        for day in [5, 6, 7] {
            store.record_agent_decision("a", record(day, ""), None);
        }
        // An older day arriving late is prepended and pushes day 5 out.
        store.record_agent_decision("a", record(2, ""), None);
        let days: Vec<u32> = store.agent_history("a").iter().map(|r| r.day).collect();
        assert_eq!(days, vec![2, 7, 6]);
    }

    #[test]
    fn test_day_snapshot_first_write_wins() {
        let mut store = HistoryStore::default();
        store.set_current(vec![proposal("p1", 10, "early")], vec![]);
        assert!(store.record_day_snapshot(1));
        store.set_current(vec![proposal("p1", 10, "late")], vec![]);
        assert!(!store.record_day_snapshot(1));
        assert_eq!(store.day_bucket(1).unwrap().proposals[0].content, "early");
        assert!(!store.record_day_snapshot(0));
        assert!(store.day_bucket(0).is_none());
    }

    #[test]
    fn test_all_proposals_current_wins_and_sorted() {
        let mut store = HistoryStore::default();
        store.set_current(vec![proposal("p1", 10, "old"), proposal("p2", 20, "")], vec![]);
        store.record_day_snapshot(1);
        store.set_current(vec![proposal("p1", 10, "new"), proposal("p3", 30, "")], vec![]);

        let all = store.all_proposals();
        let ids: Vec<&str> = all.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", "p2", "p1"]);
        assert_eq!(all[2].content, "new");
    }

    #[test]
    fn test_all_events_unique_desc() {
        let mut store = HistoryStore::default();
        store.set_current(vec![], vec![event("1:event-0", 100), event("1:event-1", 200)]);
        store.record_day_snapshot(1);
        store.set_current(vec![], vec![event("2:event-0", 300), event("1:event-1", 200)]);
        store.record_day_snapshot(2);

        let ids: Vec<String> = store.all_events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["2:event-0", "1:event-1", "1:event-0"]);
    }

    #[test]
    fn test_vote_analyses_insertion_order() {
        let mut store = HistoryStore::default();
        let mut p1 = proposal("p1", 0, "");
        p1.record_vote("a", VoteChoice::Support, 0);
        store.set_current(vec![proposal("p2", 0, ""), p1.clone()], vec![]);
        store.record_day_snapshot(1);
        p1.record_vote("b", VoteChoice::Support, 1);
        p1.status = ProposalStatus::Approved;
        store.set_current(vec![p1], vec![]);

        let analyses = store.all_vote_analyses();
        assert_eq!(analyses.len(), 2);
        assert_eq!(analyses[0].proposal_id, "p2");
        assert_eq!(analyses[1].support, 2);
        assert_eq!(analyses[1].outcome, ProposalStatus::Approved);
    }

    #[test]
    fn test_clear_and_restore() {
        let mut store = HistoryStore::default();
        store.record_agent_decision("a", record(1, ""), None);
        store.set_current(vec![proposal("p1", 0, "")], vec![]);
        store.record_day_snapshot(1);

        let buckets = store.day_buckets().clone();
        let history = store.agent_histories().clone();
        store.clear();
        assert!(store.all_proposals().is_empty());

        store.restore(buckets, history, vec![], vec![], vec![]);
        assert_eq!(store.all_proposals().len(), 1);
        assert_eq!(store.agent_history("a").len(), 1);
    }

    #[test]
    fn test_restore_keeps_saved_vote_analyses() {
        let mut store = HistoryStore::default();
        let saved = VoteAnalysis {
            proposal_id: "p1".to_string(),
            support: 4,
            ..Default::default()
        };
        store.restore(BTreeMap::new(), BTreeMap::new(), vec![proposal("p1", 0, "")], vec![], vec![saved]);
        assert_eq!(store.current_vote_analyses()[0].support, 4);

        // Nothing saved: derived from the proposals.
        store.restore(BTreeMap::new(), BTreeMap::new(), vec![proposal("p1", 0, "")], vec![], vec![]);
        let analyses = store.current_vote_analyses();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].support, 0);
    }

    proptest! {
        #[test]
        fn test_history_never_exceeds_cap(days in prop::collection::vec(0u32..40, 0..80)) {
            let mut store = HistoryStore::default();
            for day in days {
                store.record_agent_decision("a", record(day, ""), None);
                prop_assert!(store.agent_history("a").len() <= DEFAULT_HISTORY_CAP);
            }
            let history = store.agent_history("a");
            let mut seen: Vec<u32> = history.iter().map(|r| r.day).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), history.len());
            prop_assert!(history.iter().all(|r| r.day != 0));
        }
    }
}
