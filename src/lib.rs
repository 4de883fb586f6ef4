//! Event-sourced run engine.
//!
//! Records the execution of long-running, phased runs as an append-only log
//! of typed events (one JSON-Lines file per run under the run's workspace
//! root). Collaborators issue commands to the [`engine::Engine`]; the engine
//! validates each command against the run's cached state, durably records
//! the outcome through the run's [`io::event_log::EventLog`], and all
//! derived state is reconstructed by replaying events ([`core::replay`]).

pub mod core;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod test_support;
