//! # Spiral Orchestrator
//!
//! The explicit coordination context shared by every component:
//! - [`AgentRegistry`] - Agent lifecycle with per-record transitions
//! - [`VotingRound`] - Weighted voting with deterministic tie-breaks
//! - [`DelegationLedger`] - Delegation chains with cycle rejection
//! - [`Agent`] / [`AgentRunner`] - Capability interface driven from a mailbox
//! - [`Orchestrator`] - Ties kernel, router, bus and registry together

pub mod agent;
pub mod consensus;
pub mod delegation;
pub mod orchestrator;
pub mod registry;

pub use agent::{Agent, AgentRunner, DelegationDecision};
pub use consensus::{tally, Ballot, OptionTally, TallyResult, VoteCall, VoteCast, VotingRound};
pub use delegation::{DelegationHandOff, DelegationLedger, DelegationRecord};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, ProposalOutcome, TickReport, VoteOutcome,
};
pub use registry::{AgentRecord, AgentRegistry, AgentState, CapabilityDeclaration, RegistryConfig, SweepReport};
