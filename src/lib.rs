//! Synthetic-event replay harness.
//!
//! Generated events are paced against the wall clock, collected, then fanned
//! out to a broker by a fixed worker pool; a side-input batch follows on a
//! second topic. [`orchestrator::PhaseOrchestrator`] sequences the run.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod event;
pub mod generator;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod output;
pub mod pacing;
pub mod side_input;
pub mod transport;
