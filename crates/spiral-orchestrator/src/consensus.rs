//! Weighted voting over competing proposals.
//!
//! The winner is the option with the highest summed priority weight. Ties go
//! to the option proposed earliest (proposed before unproposed), then to the
//! option declared first. Weights are summed in agent-id order so the same
//! ballots always produce the same totals.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spiral_bus::Topic;
use spiral_core::{AgentId, ChoicePrimitive, OptionId, PrimitiveId};
use spiral_router::Proposal;

/// A vote for one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    /// The voting agent.
    pub agent_id: AgentId,

    /// The chosen option.
    pub option: OptionId,

    /// The agent's priority weight when the round opened.
    pub weight: f64,

    /// When the ballot was cast.
    pub cast_at: DateTime<Utc>,
}

/// Per-option totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionTally {
    pub option: OptionId,

    /// Summed ballot weight.
    pub weight: f64,

    /// Number of ballots.
    pub votes: usize,

    /// Earliest proposal for this option, if any.
    pub first_proposed: Option<DateTime<Utc>>,

    /// Position in the primitive's declared option order.
    pub position: usize,
}

/// Outcome of tallying a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyResult {
    pub primitive_id: PrimitiveId,

    /// The winning option; None when no ballot counted.
    pub winner: Option<OptionId>,

    /// Every option, best first.
    pub ranking: Vec<OptionTally>,

    /// Ballots that counted.
    pub ballots_counted: usize,
}

/// Tally ballots for a primitive.
///
/// Only the earliest ballot of each agent counts; ballots for options the
/// primitive does not offer are ignored.
pub fn tally(primitive: &ChoicePrimitive, ballots: &[Ballot], proposals: &[Proposal]) -> TallyResult {
    let mut first_ballots: BTreeMap<&str, &Ballot> = BTreeMap::new();
    for ballot in ballots.iter().filter(|b| primitive.has_option(&b.option)) {
        first_ballots
            .entry(ballot.agent_id.as_str())
            .and_modify(|current| {
                if (ballot.cast_at, &ballot.option) < (current.cast_at, &current.option) {
                    *current = ballot;
                }
            })
            .or_insert(ballot);
    }

    let mut first_proposed: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for p in proposals {
        first_proposed
            .entry(p.option.as_str())
            .and_modify(|t| *t = (*t).min(p.proposed_at))
            .or_insert(p.proposed_at);
    }

    let mut ranking: Vec<OptionTally> = primitive
        .options
        .iter()
        .enumerate()
        .map(|(position, option)| OptionTally {
            option: option.clone(),
            weight: 0.0,
            votes: 0,
            first_proposed: first_proposed.get(option.as_str()).copied(),
            position,
        })
        .collect();

    // BTreeMap iteration is in agent-id order.
    for ballot in first_ballots.values() {
        if let Some(t) = ranking.iter_mut().find(|t| t.option == ballot.option) {
            t.weight += ballot.weight;
            t.votes += 1;
        }
    }

    ranking.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| match (a.first_proposed, b.first_proposed) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.position.cmp(&b.position))
    });

    let ballots_counted = first_ballots.len();
    let winner = ranking
        .first()
        .filter(|_| ballots_counted > 0)
        .map(|t| t.option.clone());

    TallyResult {
        primitive_id: primitive.id,
        winner,
        ranking,
        ballots_counted,
    }
}

/// Call for ballots, broadcast to the primitive's context topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteCall {
    pub primitive_id: PrimitiveId,

    pub options: Vec<OptionId>,

    /// Competing proposals as (agent, option), in arrival order.
    pub proposals: Vec<(AgentId, OptionId)>,

    /// Ballots after this instant are ignored.
    pub closes_at: DateTime<Utc>,
}

/// A ballot as sent over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteCast {
    pub primitive_id: PrimitiveId,

    pub option: OptionId,
}

/// An open voting round.
#[derive(Debug, Clone)]
pub struct VotingRound {
    /// The contested primitive.
    pub primitive: ChoicePrimitive,

    /// Topic ballots arrive on.
    pub topic: Topic,

    /// Eligible voters and their weights.
    pub eligible: BTreeMap<AgentId, f64>,

    /// Competing proposals.
    pub proposals: Vec<Proposal>,

    pub opened_at: DateTime<Utc>,

    pub closes_at: DateTime<Utc>,

    ballots: Vec<Ballot>,
}

impl VotingRound {
    /// Open a round whose ballots arrive on `topic`.
    pub fn open(
        primitive: ChoicePrimitive,
        topic: Topic,
        eligible: BTreeMap<AgentId, f64>,
        proposals: Vec<Proposal>,
        window: chrono::Duration,
    ) -> Self {
        let opened_at = Utc::now();
        Self {
            topic,
            primitive,
            eligible,
            proposals,
            opened_at,
            closes_at: opened_at + window,
            ballots: Vec::new(),
        }
    }

    /// Record a ballot. Returns false if it does not count.
    pub fn cast(&mut self, agent_id: &str, option: &str, at: DateTime<Utc>) -> bool {
        let Some(&weight) = self.eligible.get(agent_id) else {
            return false;
        };
        if at > self.closes_at
            || !self.primitive.has_option(option)
            || self.ballots.iter().any(|b| b.agent_id == agent_id)
        {
            return false;
        }

        self.ballots.push(Ballot {
            agent_id: agent_id.to_string(),
            option: option.to_string(),
            weight,
            cast_at: at,
        });
        true
    }

    /// Add a late proposal from a losing CAS caller.
    pub fn add_proposal(&mut self, proposal: Proposal) {
        self.proposals.push(proposal);
    }

    /// Check if every eligible agent has voted.
    pub fn is_complete(&self) -> bool {
        self.ballots.len() >= self.eligible.len()
    }

    pub fn ballots(&self) -> &[Ballot] {
        &self.ballots
    }

    /// The call for ballots.
    pub fn call(&self) -> VoteCall {
        VoteCall {
            primitive_id: self.primitive.id,
            options: self.primitive.options.clone(),
            proposals: self
                .proposals
                .iter()
                .map(|p| (p.agent_id.clone(), p.option.clone()))
                .collect(),
            closes_at: self.closes_at,
        }
    }

    /// Tally the ballots.
    pub fn tally(&self) -> TallyResult {
        tally(&self.primitive, &self.ballots, &self.proposals)
    }
}
