//! Host integration and verification harness for ionrs.
//!
//! This crate provides:
//! - Simulation heap: a capacity-bounded backend that records every hook call
//! - Terminators: real signal delivery and a recording stand-in for tests
//! - Structured logs: canonical JSONL records for scenario runs
//! - Scenarios: JSON operation sequences run over the control surface
//! - Stress: seeded multi-threaded allocate/share/free workloads
//! - Rendering: plain-text heap reports

#![deny(unsafe_code)]

pub mod render;
pub mod scenario;
pub mod sim_heap;
pub mod stress;
pub mod structured_log;
pub mod terminator;

pub use scenario::{Scenario, ScenarioError, ScenarioReport, ScenarioRunner};
pub use sim_heap::{SimHeap, SimHeapBuilder, SimStats};
pub use stress::{StressConfig, StressReport, XorShift};
pub use terminator::{RecordingTerminator, SignalTerminator, TerminationRecord};
