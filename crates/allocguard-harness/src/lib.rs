//! Drivers that exercise allocguard-tracker end to end.
//!
//! This crate provides:
//! - Scenario: the canary round trip, plus the double-free and guard
//!   corruption paths observed as errors
//! - Stress: seeded concurrent alloc/free through per-thread allocators
//! - Lifecycle: a start-up/shut-down model of a stack that owns per-controller
//!   command queues, ending in a leak checkpoint

#![deny(unsafe_code)]

pub mod error;
pub mod lifecycle;
pub mod scenario;
pub mod stress;

pub use error::HarnessError;
pub use lifecycle::{LifecycleConfig, LifecycleReport, run_lifecycle};
pub use scenario::{ScenarioCheck, ScenarioReport, run_scenario};
pub use stress::{StressConfig, StressReport, XorShift64, run_stress};
