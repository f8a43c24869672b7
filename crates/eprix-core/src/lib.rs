//! Deterministic, stochastic, fixed-timestep race simulation kernel.
//!
//! The kernel advances a field of electric race cars around a closed circuit
//! in discrete ticks. Each tick runs the same pipeline: driver control
//! synthesis, per-car physics (forces, energy, tires, thermals, process
//! noise), position resolution, then the probabilistic event sweep
//! (overtakes, crashes, safety car, mechanical failures). Given an identical
//! [`config::Config`] and seed, two runs produce bit-identical car state and
//! event streams on any platform.
//!
//! Presentation, networking, qualifying, penalties, and weather evolution are
//! external collaborators; the kernel exposes read-only snapshots and a
//! drained event stream for them through [`engine::Simulation`].

pub mod config;
pub mod driver;
pub mod engine;
pub mod events;
pub mod leaderboard;
pub mod physics;
pub mod replay;
pub mod rng;
pub mod state;
pub mod weather;

pub use config::{Config, CornerCap, FailureModel};
pub use driver::{Controls, DriverPolicy};
pub use engine::{CancelToken, CarView, RaceSnapshot, RaceState, Simulation, TickOutcome};
pub use events::{EventData, EventKind, FailureCause, RaceEvent, SafetyCarReason};
pub use leaderboard::{FastestLap, StandingEntry, StandingsSnapshot};
pub use replay::{ReplayEntry, ReplayLog};
pub use state::{CarArena, CarId, CarState, DnfReason, DriverProfile, STATE_DIM};
pub use weather::WeatherView;

use thiserror::Error;

/// Errors surfaced across the kernel's public boundary.
///
/// Construction errors prevent any tick from running. A per-tick error leaves
/// the race state exactly as it was before the tick; the simulation refuses
/// further ticks until the caller acknowledges the fault.
#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The injected starting grid is not a permutation of the car ids.
    #[error("starting grid is not a permutation of the registered car ids")]
    BadGrid,
    /// The grid can only be injected before the first tick.
    #[error("starting grid can only be injected before the first tick")]
    GridAfterStart,
    /// A NaN or infinity was produced during tick `step`.
    #[error("numerical blow-up during tick {step}")]
    NumericalBlowup { step: u64 },
    /// A previous tick faulted and the caller has not acknowledged it yet.
    #[error("simulation is halted on an unacknowledged fault")]
    Halted,
}
