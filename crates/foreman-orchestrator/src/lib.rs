//! Orchestration: task intake, complexity routing, and dependency-aware
//! dispatch over many short-lived, unreliable workers.
//!
//! The flow through this crate is linear. [`orchestrator::TaskOrchestrator`]
//! admits a task, [`decompose`] routes it into a subtask graph, and the
//! dispatch loop runs that graph through registered [`worker::Worker`]
//! implementations under admission control, retry strategies, and per-call
//! timeouts. Every pipeline ends in exactly one terminal
//! [`orchestrator::Verdict`]: complete, failed, or escalated to a human.

pub mod cancel;
pub mod decompose;
pub mod orchestrator;
pub mod worker;
