//! Pipeline state tracking: the authoritative record of what has been
//! tried for a task and what to try next.
//!
//! Attempt history is append-only; retry decisions are reconstructed by
//! scanning it, never from side-channel counters. Snapshots written by
//! [`store`] let an interrupted pipeline resume where it left off
//! instead of restarting strategy escalation from the top.

pub mod classify;
pub mod escalation;
pub mod store;
pub mod tracker;
