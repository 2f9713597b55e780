//! Consensus-style quality evaluation
//!
//! A consensus collects weighted, confidence-scored votes from independent
//! voters and resolves them under one of six strategies. Agreement below the
//! conflict threshold records minority opinions; voter reliability is
//! adjusted over time from outcomes and feeds back into vote weights.

pub mod engine;
pub mod reliability;

pub use engine::{
    ConsensusConfig, ConsensusEngine, ConsensusResult, MinorityOpinion, Vote, VoteValue,
    VotingStrategy,
};
pub use reliability::VoterReliability;
