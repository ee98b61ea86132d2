//! Workload harness for knight-core.
//!
//! This crate provides:
//! - Seeded workloads that replay allocator traffic deterministically
//! - Scenario runners that check allocator invariants and report results
//! - The JSONL structured log contract shared by every harness run

#![forbid(unsafe_code)]

pub mod scenarios;
pub mod structured_log;
pub mod workload;

pub use scenarios::{HarnessError, RunOptions, Scenario, ScenarioReport, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel};
pub use workload::XorShift64;
