//! Execution harness for the muskox coding agent: the LLM provider seam,
//! the constrained tool executors with their JSON schemas, the safety
//! gate evaluated before every dispatch, and the retry helper used for
//! retryable units of work.

pub mod openrouter;
pub mod provider;
pub mod retry;
pub mod safety;
pub mod toolset;
