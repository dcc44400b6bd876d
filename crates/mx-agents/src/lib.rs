//! Agent orchestration: the plan generator, the bounded implementation
//! loop, the best-effort notification and activity side channels, and
//! the workflow runner that drives a task through the phase ladder.

pub mod agent_loop;
pub mod notify;
pub mod planner;
pub mod transcript;
pub mod workflow;
