//! Consensus engine: vote collection and strategy resolution

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use stratus_common::{Error, Result};

use crate::reliability::ReliabilityTracker;

/// A vote's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum VoteValue {
    Bool(bool),
    Number(f64),
    Label(String),
}

impl VoteValue {
    /// Stable key for counting identical values
    fn key(&self) -> String {
        match self {
            VoteValue::Bool(b) => format!("bool:{b}"),
            VoteValue::Number(n) => format!("num:{n}"),
            VoteValue::Label(s) => format!("label:{s}"),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            VoteValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A single vote in a consensus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub value: VoteValue,
    /// Voter's confidence in this vote, clamped to [0, 1]
    pub confidence: f64,
    pub weight: f64,
    pub expertise: Vec<String>,
    pub reasoning: String,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(voter_id: impl Into<String>, value: VoteValue, confidence: f64) -> Self {
        Self {
            voter_id: voter_id.into(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
            weight: 1.0,
            expertise: Vec::new(),
            reasoning: String::new(),
            cast_at: Utc::now(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight.max(0.0);
        self
    }

    pub fn with_expertise(mut self, expertise: impl IntoIterator<Item = String>) -> Self {
        self.expertise = expertise.into_iter().collect();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// Voting strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    SimpleMajority,
    WeightedMajority,
    Unanimous,
    ThresholdBased,
    ConfidenceWeighted,
    DomainWeighted,
}

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub strategy: VotingStrategy,
    pub minimum_votes: usize,
    pub maximum_votes: usize,
    /// Votes below this confidence are discarded by THRESHOLD_BASED
    pub confidence_threshold: f64,
    /// Share of surviving votes the winner must reach in THRESHOLD_BASED
    pub agreement_threshold: f64,
    /// Below this agreement a conflict is recorded
    pub conflict_threshold: f64,
    pub timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: VotingStrategy::WeightedMajority,
            minimum_votes: 3,
            maximum_votes: 10,
            confidence_threshold: 0.7,
            agreement_threshold: 0.6,
            conflict_threshold: 0.4,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A dissenting opinion preserved when agreement is low
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinorityOpinion {
    pub voter_id: String,
    pub value: VoteValue,
    pub confidence: f64,
    pub reasoning: String,
}

/// Final outcome of a consensus
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResult {
    pub consensus_id: String,
    pub subject: String,
    /// None when no consensus was reached
    pub final_value: Option<VoteValue>,
    pub confidence: f64,
    /// Share of voters behind the modal value (1 - CV for numeric votes)
    pub agreement_level: f64,
    pub participating_voters: usize,
    pub votes: Vec<Vote>,
    pub conflicts: Vec<String>,
    pub minority_opinions: Vec<MinorityOpinion>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

struct ActiveConsensus {
    subject: String,
    tags: Vec<String>,
    votes: Vec<Vote>,
    started_at: DateTime<Utc>,
    opened: Instant,
}

/// Multi-voter consensus engine
pub struct ConsensusEngine {
    config: ConsensusConfig,
    active: Mutex<HashMap<String, ActiveConsensus>>,
    completed: Mutex<HashMap<String, ConsensusResult>>,
    reliability: ReliabilityTracker,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            reliability: ReliabilityTracker::new(),
        }
    }

    /// Open a consensus on `subject`; `tags` describe the domain for
    /// DOMAIN_WEIGHTED matching
    pub fn start(&self, subject: impl Into<String>, tags: Vec<String>) -> String {
        let id = format!("consensus_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let subject = subject.into();
        debug!(consensus = %id, subject = %subject, "consensus opened");
        self.active.lock().insert(
            id.clone(),
            ActiveConsensus {
                subject,
                tags,
                votes: Vec::new(),
                started_at: Utc::now(),
                opened: Instant::now(),
            },
        );
        id
    }

    /// Append a vote; order of appends is arrival order
    pub fn vote(&self, consensus_id: &str, vote: Vote) -> Result<()> {
        let mut active = self.active.lock();
        let consensus = active
            .get_mut(consensus_id)
            .ok_or_else(|| Error::Consensus(format!("unknown consensus '{consensus_id}'")))?;
        if consensus.votes.len() >= self.config.maximum_votes {
            return Err(Error::Consensus("maximum votes reached".into()));
        }
        consensus.votes.push(vote);
        Ok(())
    }

    /// Compute the result once enough votes arrived or the timeout elapsed.
    ///
    /// Returns `Err` while the consensus is still collecting.
    pub fn result(&self, consensus_id: &str) -> Result<ConsensusResult> {
        if let Some(done) = self.completed.lock().get(consensus_id) {
            return Ok(done.clone());
        }

        let mut active = self.active.lock();
        let consensus = active
            .get(consensus_id)
            .ok_or_else(|| Error::Consensus(format!("unknown consensus '{consensus_id}'")))?;

        let timed_out = consensus.opened.elapsed() >= self.config.timeout;
        if consensus.votes.len() < self.config.minimum_votes && !timed_out {
            return Err(Error::Consensus(format!(
                "consensus pending: {}/{} votes",
                consensus.votes.len(),
                self.config.minimum_votes
            )));
        }

        let Some(consensus) = active.remove(consensus_id) else {
            return Err(Error::Consensus(format!("unknown consensus '{consensus_id}'")));
        };
        drop(active);

        let mut result = if consensus.votes.len() < self.config.minimum_votes {
            warn!(consensus = %consensus_id, votes = consensus.votes.len(), "consensus timed out");
            ConsensusResult {
                consensus_id: consensus_id.to_string(),
                subject: consensus.subject,
                final_value: None,
                confidence: 0.0,
                agreement_level: 0.0,
                participating_voters: consensus.votes.len(),
                votes: consensus.votes,
                conflicts: vec!["timed out with insufficient votes".to_string()],
                minority_opinions: Vec::new(),
                started_at: consensus.started_at,
                completed_at: Utc::now(),
            }
        } else {
            self.resolve(consensus_id, consensus)
        };

        self.analyze_quality(&mut result);
        self.reliability.observe(&result, self.config.confidence_threshold);
        self.completed.lock().insert(consensus_id.to_string(), result.clone());
        Ok(result)
    }

    fn resolve(&self, consensus_id: &str, consensus: ActiveConsensus) -> ConsensusResult {
        let votes = consensus.votes;
        let (final_value, confidence) = match self.config.strategy {
            VotingStrategy::SimpleMajority => self.simple_majority(&votes),
            VotingStrategy::WeightedMajority => {
                self.weighted(&votes, |vote| self.effective_weight(vote) * vote.confidence)
            }
            VotingStrategy::Unanimous => self.unanimous(&votes),
            VotingStrategy::ThresholdBased => self.threshold_based(&votes),
            VotingStrategy::ConfidenceWeighted => self.weighted(&votes, |vote| {
                self.effective_weight(vote) * vote.confidence * vote.confidence
            }),
            VotingStrategy::DomainWeighted => self.weighted(&votes, |vote| {
                let overlap = vote
                    .expertise
                    .iter()
                    .filter(|tag| consensus.tags.contains(tag))
                    .count();
                let boost = (1.0 + 0.25 * overlap as f64).min(2.0);
                self.effective_weight(vote) * boost * vote.confidence
            }),
        };

        ConsensusResult {
            consensus_id: consensus_id.to_string(),
            subject: consensus.subject,
            final_value,
            confidence,
            agreement_level: 0.0,
            participating_voters: votes.len(),
            votes,
            conflicts: Vec::new(),
            minority_opinions: Vec::new(),
            started_at: consensus.started_at,
            completed_at: Utc::now(),
        }
    }

    /// Voter weight scaled by tracked reliability
    fn effective_weight(&self, vote: &Vote) -> f64 {
        vote.weight * self.reliability.trust_level(&vote.voter_id)
    }

    fn simple_majority(&self, votes: &[Vote]) -> (Option<VoteValue>, f64) {
        let mut counts: HashMap<String, (usize, VoteValue)> = HashMap::new();
        for vote in votes {
            let slot = counts.entry(vote.value.key()).or_insert((0, vote.value.clone()));
            slot.0 += 1;
        }
        let Some((count, value)) = counts.into_values().max_by_key(|(count, _)| *count) else {
            return (None, 0.0);
        };
        (Some(value), count as f64 / votes.len() as f64)
    }

    fn weighted<F>(&self, votes: &[Vote], weight_of: F) -> (Option<VoteValue>, f64)
    where
        F: Fn(&Vote) -> f64,
    {
        let mut weights: HashMap<String, (f64, VoteValue)> = HashMap::new();
        let mut total = 0.0;
        for vote in votes {
            let weight = weight_of(vote);
            let slot = weights.entry(vote.value.key()).or_insert((0.0, vote.value.clone()));
            slot.0 += weight;
            total += weight;
        }
        if total <= 0.0 {
            return (None, 0.0);
        }
        let Some((winning_weight, value)) = weights
            .into_values()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return (None, 0.0);
        };
        (Some(value), winning_weight / total)
    }

    fn unanimous(&self, votes: &[Vote]) -> (Option<VoteValue>, f64) {
        let Some(first) = votes.first() else { return (None, 0.0) };
        if votes.iter().all(|vote| vote.value == first.value) {
            (Some(first.value.clone()), 1.0)
        } else {
            (None, 0.0)
        }
    }

    fn threshold_based(&self, votes: &[Vote]) -> (Option<VoteValue>, f64) {
        let qualified: Vec<&Vote> = votes
            .iter()
            .filter(|vote| vote.confidence >= self.config.confidence_threshold)
            .collect();
        if qualified.len() < self.config.minimum_votes {
            return (None, 0.0);
        }

        let mut counts: HashMap<String, (usize, VoteValue)> = HashMap::new();
        for vote in &qualified {
            let slot = counts.entry(vote.value.key()).or_insert((0, vote.value.clone()));
            slot.0 += 1;
        }
        let Some((count, value)) = counts.into_values().max_by_key(|(count, _)| *count) else {
            return (None, 0.0);
        };
        let share = count as f64 / qualified.len() as f64;
        if share >= self.config.agreement_threshold {
            (Some(value), share)
        } else {
            (None, 0.0)
        }
    }

    /// Compute agreement, detect conflicts and capture minority opinions
    fn analyze_quality(&self, result: &mut ConsensusResult) {
        let votes = &result.votes;
        if votes.len() < 2 {
            result.agreement_level = 1.0;
            return;
        }

        let numeric: Option<Vec<f64>> = votes.iter().map(|v| v.value.as_number()).collect();
        result.agreement_level = match numeric {
            Some(values) => {
                // 1 - coefficient of variation, clamped into [0, 1]
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (values.len() - 1) as f64;
                let std_dev = variance.sqrt();
                if mean.abs() > f64::EPSILON {
                    (1.0 - std_dev / mean.abs()).clamp(0.0, 1.0)
                } else if std_dev == 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            None => {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for vote in votes {
                    *counts.entry(vote.value.key()).or_insert(0) += 1;
                }
                let modal = counts.values().copied().max().unwrap_or(0);
                modal as f64 / votes.len() as f64
            }
        };

        if result.agreement_level < self.config.conflict_threshold {
            result.conflicts.push("low agreement among voters".to_string());

            let mut counts: HashMap<String, usize> = HashMap::new();
            for vote in votes {
                *counts.entry(vote.value.key()).or_insert(0) += 1;
            }
            let minority_cutoff = votes.len() as f64 * 0.3;
            result.minority_opinions = votes
                .iter()
                .filter(|vote| {
                    counts.get(&vote.value.key()).copied().unwrap_or(0) as f64 <= minority_cutoff
                })
                .map(|vote| MinorityOpinion {
                    voter_id: vote.voter_id.clone(),
                    value: vote.value.clone(),
                    confidence: vote.confidence,
                    reasoning: vote.reasoning.clone(),
                })
                .collect();
        }
    }

    /// Recompute voter reliability from recent outcomes (background task)
    pub fn update_reliability(&self) {
        self.reliability.recompute();
    }

    /// Current trust level for a voter
    pub fn trust_level(&self, voter_id: &str) -> f64 {
        self.reliability.trust_level(voter_id)
    }

    /// Completed results, newest first
    pub fn history(&self, limit: usize) -> Vec<ConsensusResult> {
        let completed = self.completed.lock();
        let mut results: Vec<ConsensusResult> = completed.values().cloned().collect();
        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        results.truncate(limit);
        results
    }

    /// Number of consensus rounds still collecting votes
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
