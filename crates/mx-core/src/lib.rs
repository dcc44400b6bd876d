//! Core domain types and persistence for the muskox coding agent.
//!
//! Everything here is consumed by `mx-harness` (tool execution, safety,
//! LLM seam) and `mx-agents` (the workflow runner). This crate has no
//! knowledge of the agent loop itself — it defines the vocabulary the
//! run is described in, the durable run-state snapshot, and the two
//! storage surfaces (checkpoints, activity ledger) plus the git
//! capability.

pub mod checkpoint;
pub mod config;
pub mod git;
pub mod ledger;
pub mod state;
pub mod types;
