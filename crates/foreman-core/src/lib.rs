pub mod config;
pub mod events;
pub mod graph;
pub mod types;
