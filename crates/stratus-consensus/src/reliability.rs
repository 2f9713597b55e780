//! Voter reliability tracking
//!
//! Every finalized consensus contributes one observation per voter: did the
//! vote land on the final value, and how confident were both sides. A
//! periodic recompute folds a composite of weighted success rate,
//! confidence-outcome correlation and recent trend into each voter's trust
//! level through an EMA. Trust is clamped to [0.1, 2.0] and scales vote
//! weights in the engine.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::engine::ConsensusResult;

const HISTORY_CAPACITY: usize = 1000;
const EMA_ALPHA: f64 = 0.3;
const TRUST_MIN: f64 = 0.1;
const TRUST_MAX: f64 = 2.0;

#[derive(Debug, Clone)]
struct Observation {
    voter_id: String,
    success: bool,
    vote_confidence: f64,
    vote_weight: f64,
    consensus_confidence: f64,
    agreement_level: f64,
}

/// Published reliability state for one voter
#[derive(Debug, Clone, Serialize)]
pub struct VoterReliability {
    pub trust_level: f64,
    pub observations: u64,
    pub successes: u64,
}

impl Default for VoterReliability {
    fn default() -> Self {
        Self { trust_level: 1.0, observations: 0, successes: 0 }
    }
}

/// Collects outcomes and recomputes trust levels
pub struct ReliabilityTracker {
    history: Mutex<VecDeque<Observation>>,
    voters: Mutex<HashMap<String, VoterReliability>>,
}

impl Default for ReliabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityTracker {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            voters: Mutex::new(HashMap::new()),
        }
    }

    /// Record the outcome of a finalized consensus
    pub fn observe(&self, result: &ConsensusResult, confidence_threshold: f64) {
        let Some(final_value) = &result.final_value else { return };

        let mut history = self.history.lock();
        let mut voters = self.voters.lock();
        for vote in &result.votes {
            let success =
                vote.value == *final_value && result.confidence >= confidence_threshold;

            let record = voters.entry(vote.voter_id.clone()).or_default();
            record.observations += 1;
            if success {
                record.successes += 1;
            }

            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(Observation {
                voter_id: vote.voter_id.clone(),
                success,
                vote_confidence: vote.confidence,
                vote_weight: vote.weight,
                consensus_confidence: result.confidence,
                agreement_level: result.agreement_level,
            });
        }
    }

    /// Current trust level, 1.0 for unknown voters
    pub fn trust_level(&self, voter_id: &str) -> f64 {
        self.voters.lock().get(voter_id).map(|r| r.trust_level).unwrap_or(1.0)
    }

    /// Snapshot of every tracked voter
    pub fn snapshot(&self) -> HashMap<String, VoterReliability> {
        self.voters.lock().clone()
    }

    /// Fold recent history into trust levels via EMA
    pub fn recompute(&self) {
        let history = self.history.lock();
        let mut by_voter: HashMap<&str, Vec<&Observation>> = HashMap::new();
        for observation in history.iter() {
            by_voter.entry(observation.voter_id.as_str()).or_default().push(observation);
        }

        let mut voters = self.voters.lock();
        for (voter_id, observations) in by_voter {
            if observations.is_empty() {
                continue;
            }

            let composite = 0.6 * weighted_success_rate(&observations)
                + 0.25 * confidence_outcome_correlation(&observations)
                + 0.15 * recent_trend(&observations);
            let target = (composite * TRUST_MAX).clamp(TRUST_MIN, TRUST_MAX);

            let record = voters.entry(voter_id.to_string()).or_default();
            record.trust_level = ((1.0 - EMA_ALPHA) * record.trust_level
                + EMA_ALPHA * target)
                .clamp(TRUST_MIN, TRUST_MAX);
        }
    }
}

/// Successes weighted by how meaningful each consensus was
fn weighted_success_rate(observations: &[&Observation]) -> f64 {
    let mut won = 0.0;
    let mut total = 0.0;
    for obs in observations {
        let weight = obs.consensus_confidence
            * obs.agreement_level.max(0.05)
            * obs.vote_confidence.max(0.05)
            * obs.vote_weight.max(0.05);
        if obs.success {
            won += weight;
        }
        total += weight;
    }
    if total > 0.0 {
        won / total
    } else {
        0.5
    }
}

/// Pearson correlation between stated confidence and being right, mapped
/// from [-1, 1] into [0, 1]
fn confidence_outcome_correlation(observations: &[&Observation]) -> f64 {
    if observations.len() < 3 {
        return 0.5;
    }
    let n = observations.len() as f64;
    let xs: Vec<f64> = observations.iter().map(|o| o.vote_confidence).collect();
    let ys: Vec<f64> =
        observations.iter().map(|o| if o.success { 1.0 } else { 0.0 }).collect();
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut x_var = 0.0;
    let mut y_var = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        covariance += (x - x_mean) * (y - y_mean);
        x_var += (x - x_mean).powi(2);
        y_var += (y - y_mean).powi(2);
    }
    if x_var == 0.0 || y_var == 0.0 {
        return 0.5;
    }
    let r = covariance / (x_var.sqrt() * y_var.sqrt());
    (r + 1.0) / 2.0
}

/// Newer-half success rate against older-half, mapped into [0, 1]
fn recent_trend(observations: &[&Observation]) -> f64 {
    if observations.len() < 4 {
        return 0.5;
    }
    let mid = observations.len() / 2;
    let rate = |slice: &[&Observation]| {
        slice.iter().filter(|o| o.success).count() as f64 / slice.len() as f64
    };
    let delta = rate(&observations[mid..]) - rate(&observations[..mid]);
    (delta + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Vote, VoteValue};
    use chrono::Utc;

    fn result_with(votes: Vec<Vote>, final_value: VoteValue, confidence: f64) -> ConsensusResult {
        ConsensusResult {
            consensus_id: "c1".to_string(),
            subject: "test".to_string(),
            final_value: Some(final_value),
            confidence,
            agreement_level: 0.9,
            participating_voters: votes.len(),
            votes,
            conflicts: Vec::new(),
            minority_opinions: Vec::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    fn yes() -> VoteValue {
        VoteValue::Label("yes".to_string())
    }

    fn no() -> VoteValue {
        VoteValue::Label("no".to_string())
    }

    #[test]
    fn unknown_voters_have_neutral_trust() {
        let tracker = ReliabilityTracker::new();
        assert_eq!(tracker.trust_level("nobody"), 1.0);
    }

    #[test]
    fn consistently_right_voters_gain_trust() {
        let tracker = ReliabilityTracker::new();
        for _ in 0..10 {
            let votes = vec![
                Vote::new("good", yes(), 0.9),
                Vote::new("bad", no(), 0.9),
                Vote::new("also-good", yes(), 0.8),
            ];
            tracker.observe(&result_with(votes, yes(), 0.9), 0.7);
        }
        tracker.recompute();

        assert!(tracker.trust_level("good") > 1.0);
        assert!(tracker.trust_level("bad") < 1.0);
    }

    #[test]
    fn trust_stays_clamped() {
        let tracker = ReliabilityTracker::new();
        for _ in 0..200 {
            let votes = vec![Vote::new("wrong", no(), 1.0), Vote::new("right", yes(), 1.0)];
            tracker.observe(&result_with(votes, yes(), 1.0), 0.7);
            tracker.recompute();
        }
        let wrong = tracker.trust_level("wrong");
        let right = tracker.trust_level("right");
        assert!((0.1..=2.0).contains(&wrong));
        assert!((0.1..=2.0).contains(&right));
        assert!(wrong < 0.5, "repeated failures drive trust down, got {wrong}");
        assert!(right > 1.0);
    }

    #[test]
    fn no_consensus_results_contribute_nothing() {
        let tracker = ReliabilityTracker::new();
        let mut result = result_with(vec![Vote::new("a", yes(), 0.9)], yes(), 0.9);
        result.final_value = None;
        tracker.observe(&result, 0.7);
        assert_eq!(tracker.snapshot().len(), 0);
    }

    #[test]
    fn observation_counters_accumulate() {
        let tracker = ReliabilityTracker::new();
        let votes = vec![Vote::new("a", yes(), 0.9), Vote::new("b", no(), 0.9)];
        tracker.observe(&result_with(votes, yes(), 0.9), 0.7);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["a"].observations, 1);
        assert_eq!(snapshot["a"].successes, 1);
        assert_eq!(snapshot["b"].successes, 0);
    }
}
