//! gatherd - host metrics agent with pluggable collectors.
//!
//! Collectors are registered by name in a [`Registry`], instantiated once
//! per configured input, and driven by the [`Scheduler`]. Each gather writes
//! to an [`Accumulator`] that turns raw values into [`Measurement`]s named
//! after the owning plugin and forwards them to a [`Sink`].

pub mod agent;
pub mod collectors;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

pub use agent::Agent;
pub use collectors::{Accumulator, Collector, CollectorError, Measurement, Registry, Sink, Value};
pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::{FailureReport, GatherError, Instance, Scheduler};
