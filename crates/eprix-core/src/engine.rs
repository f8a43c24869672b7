//! The fixed-step integrator: owns the race state and advances it one tick at
//! a time through the control → physics → positions → events → metrics
//! pipeline.
//!
//! Cars are processed strictly in ascending id order and all cross-car reads
//! use the previous tick's committed values, so a run is bit-identical for a
//! given `(config, seed)` on any host. Physics runs on scratch copies of the
//! car field; nothing is committed until the whole sweep has produced finite
//! state, which is what lets a [`SimError::NumericalBlowup`] abort leave the
//! race exactly as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use eprix_track::Track;

use crate::config::Config;
use crate::driver::{self, RaceContext};
use crate::events::{sort_tick_events, EventData, EventEngine, RaceEvent};
use crate::leaderboard::{standings, StandingsSnapshot};
use crate::physics::{self, StepEffects};
use crate::replay::ReplayLog;
use crate::rng::{GlobalStream, RngService};
use crate::state::{CarArena, CarId, CarState, DnfReason, DriverProfile, STATE_DIM};
use crate::weather::WeatherView;
use crate::SimError;

/// Longitudinal spacing between grid slots, m. Keeps the starting order
/// unambiguous under the position bookkeeping.
const GRID_SPACING: f64 = 1.5;

/// Cooperative cancellation flag checked between ticks. Cancelling never
/// exposes a partially-updated tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; takes effect before the next tick.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// What a call to [`Simulation::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// One tick was integrated and committed.
    Advanced,
    /// The race has reached its terminal condition; the final tick, if any,
    /// was committed and no further ticks will run.
    Finished,
    /// The cancellation token fired; no state was changed.
    Cancelled,
}

/// Shared race-wide state: the car field, the clock, and the safety-car flag.
#[derive(Debug)]
pub struct RaceState {
    t: f64,
    step_index: u64,
    arena: CarArena,
    safety_car_active: bool,
    safety_car_until: f64,
}

impl RaceState {
    /// Simulated time, s.
    #[must_use]
    pub const fn t(&self) -> f64 {
        self.t
    }

    /// Ticks integrated since the start.
    #[must_use]
    pub const fn step_index(&self) -> u64 {
        self.step_index
    }

    /// The car field.
    #[must_use]
    pub const fn cars(&self) -> &CarArena {
        &self.arena
    }

    /// Whether the safety car is currently deployed.
    #[must_use]
    pub const fn safety_car_active(&self) -> bool {
        self.safety_car_active
    }

    /// When the current safety-car window ends, s.
    #[must_use]
    pub const fn safety_car_until(&self) -> f64 {
        self.safety_car_until
    }

    /// Number of cars still racing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.arena.states().iter().filter(|car| car.active).count()
    }

    /// Highest completed lap among running cars.
    #[must_use]
    pub fn leader_lap(&self) -> u32 {
        self.arena
            .states()
            .iter()
            .filter(|car| car.active)
            .map(|car| car.current_lap)
            .max()
            .unwrap_or(0)
    }
}

/// Read-only per-car projection handed to external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarView {
    pub id: CarId,
    pub driver: String,
    /// Canonical observation vector (see [`CarState::to_vector`]).
    pub vector: [f64; STATE_DIM],
    pub speed_kmh: f64,
    pub energy_efficiency: f64,
    pub last_lap_time: f64,
    pub best_lap_time: Option<f64>,
    pub attack_uses_left: u8,
    pub dnf_reason: DnfReason,
}

/// Consistent between-ticks snapshot: state views, standings, and the events
/// drained since the previous snapshot (in their total order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceSnapshot {
    pub t: f64,
    pub step_index: u64,
    pub safety_car_active: bool,
    pub finished: bool,
    pub cars: Vec<CarView>,
    pub standings: StandingsSnapshot,
    pub events: Vec<RaceEvent>,
}

/// The simulation kernel: configuration, track, race state, RNG service, and
/// the event machinery, advanced tick by tick.
pub struct Simulation {
    config: Config,
    track: Track,
    race: RaceState,
    rng: RngService,
    event_engine: EventEngine,
    event_buffer: Vec<RaceEvent>,
    replay: ReplayLog,
    weather: WeatherView,
    pending_weather: Option<WeatherView>,
    cancel: Option<CancelToken>,
    started: bool,
    finished: bool,
    faulted: bool,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("t", &self.race.t)
            .field("step_index", &self.race.step_index)
            .field("cars", &self.race.arena.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Simulation {
    /// Builds a simulation over `track` with one car per profile, placed on
    /// the grid in registration order.
    pub fn new(
        config: Config,
        track: Track,
        profiles: Vec<DriverProfile>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        if profiles.is_empty() {
            return Err(SimError::InvalidConfig("at least one car is required"));
        }
        let count = profiles.len();
        let mut arena = CarArena::new();
        for (slot, profile) in profiles.into_iter().enumerate() {
            let mut state = CarState::fresh(&config.physics);
            state.position = slot + 1;
            place_on_grid(&mut state, slot, count, &track);
            arena.insert(profile, state);
        }
        let rng = RngService::new(config.seed, count);
        Ok(Self {
            track,
            race: RaceState {
                t: 0.0,
                step_index: 0,
                arena,
                safety_car_active: false,
                safety_car_until: 0.0,
            },
            rng,
            event_engine: EventEngine::new(),
            event_buffer: Vec::new(),
            replay: ReplayLog::new(),
            weather: WeatherView::default(),
            pending_weather: None,
            cancel: None,
            started: false,
            finished: false,
            faulted: false,
            config,
        })
    }

    /// Builds a simulation from explicit initial car states instead of a
    /// fresh grid. Positions are assigned in entry order (first entry is P1);
    /// everything else in each state is taken verbatim. Intended for scenario
    /// setups and state restoration by external harnesses.
    pub fn with_field(
        config: Config,
        track: Track,
        entries: Vec<(DriverProfile, CarState)>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        if entries.is_empty() {
            return Err(SimError::InvalidConfig("at least one car is required"));
        }
        let count = entries.len();
        let mut arena = CarArena::new();
        for (slot, (profile, mut state)) in entries.into_iter().enumerate() {
            if !physics::state_is_finite(&state) {
                return Err(SimError::InvalidConfig(
                    "initial car state must be finite",
                ));
            }
            state.position = slot + 1;
            state.lap_distance = state.lap_distance.rem_euclid(track.total_length());
            let geometry = track.geometry_at(state.lap_distance);
            state.x = geometry.x;
            state.y = geometry.y;
            arena.insert(profile, state);
        }
        let rng = RngService::new(config.seed, count);
        Ok(Self {
            track,
            race: RaceState {
                t: 0.0,
                step_index: 0,
                arena,
                safety_car_active: false,
                safety_car_until: 0.0,
            },
            rng,
            event_engine: EventEngine::new(),
            event_buffer: Vec::new(),
            replay: ReplayLog::new(),
            weather: WeatherView::default(),
            pending_weather: None,
            cancel: None,
            started: false,
            finished: false,
            faulted: false,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The circuit being raced.
    #[must_use]
    pub const fn track(&self) -> &Track {
        &self.track
    }

    /// The race state (read-only).
    #[must_use]
    pub const fn race(&self) -> &RaceState {
        &self.race
    }

    /// Whether the race has reached a terminal condition.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// The deterministic replay log accumulated so far.
    #[must_use]
    pub const fn replay_log(&self) -> &ReplayLog {
        &self.replay
    }

    /// Car handles in ascending id order.
    #[must_use]
    pub fn car_ids(&self) -> Vec<CarId> {
        self.race.arena.iter_handles().collect()
    }

    /// Installs a cancellation token checked between ticks.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    /// Swaps in a new weather view; takes effect from the next tick.
    pub fn set_weather(&mut self, weather: WeatherView) {
        self.pending_weather = Some(weather);
    }

    /// Clears a fault raised by a failed tick, permitting further ticks.
    pub fn acknowledge_fault(&mut self) {
        self.faulted = false;
    }

    /// Reorders the starting grid. Only permitted before the first tick;
    /// `order` must be a permutation of the registered car ids, front of the
    /// grid first.
    pub fn inject_starting_grid(&mut self, order: &[CarId]) -> Result<(), SimError> {
        if self.started {
            return Err(SimError::GridAfterStart);
        }
        let count = self.race.arena.len();
        if order.len() != count {
            return Err(SimError::BadGrid);
        }
        let mut seen = vec![false; count];
        let mut indices = Vec::with_capacity(count);
        for id in order {
            let Some(index) = self.race.arena.index_of(*id) else {
                return Err(SimError::BadGrid);
            };
            if seen[index] {
                return Err(SimError::BadGrid);
            }
            seen[index] = true;
            indices.push(index);
        }
        for (slot, index) in indices.into_iter().enumerate() {
            let state = &mut self.race.arena.states_mut()[index];
            state.position = slot + 1;
            place_on_grid(state, slot, count, &self.track);
        }
        Ok(())
    }

    /// Advances the simulation by one tick, or reports why it did not.
    pub fn tick(&mut self) -> Result<TickOutcome, SimError> {
        if self.faulted {
            return Err(SimError::Halted);
        }
        if self.finished {
            return Ok(TickOutcome::Finished);
        }
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Ok(TickOutcome::Cancelled);
            }
        }
        if !self.started {
            self.started = true;
            info!(
                cars = self.race.arena.len(),
                laps = self.config.num_laps,
                seed = self.config.seed,
                "race start"
            );
        }
        if self.check_termination() {
            return Ok(TickOutcome::Finished);
        }

        if let Some(weather) = self.pending_weather.take() {
            self.weather = weather;
        }

        let dt = self.config.dt;
        let t_next = self.race.t + dt;
        let step_next = self.race.step_index + 1;
        let count = self.race.arena.len();
        let leader_lap = self.race.leader_lap();
        let race_progress = if self.config.num_laps > 0 {
            (f64::from(leader_lap) / f64::from(self.config.num_laps)).min(1.0)
        } else {
            1.0
        };

        // Stage 1+2: controls and physics per car, ascending id, on scratch
        // copies. Cross-car inputs (gaps, positions) are last tick's values.
        let mut next_states: Vec<CarState> = Vec::with_capacity(count);
        let mut effects: Vec<StepEffects> = Vec::with_capacity(count);
        let mut tick_events: Vec<RaceEvent> = Vec::new();
        for index in 0..count {
            let state = &self.race.arena.states()[index];
            if !state.active {
                next_states.push(state.clone());
                effects.push(StepEffects::default());
                continue;
            }
            let profile = &self.race.arena.profiles()[index];
            let ctx = RaceContext {
                step_index: self.race.step_index,
                laps_remaining: self.config.num_laps.saturating_sub(state.current_lap),
                race_progress,
                safety_car_active: self.race.safety_car_active,
            };
            let controls = driver::compute_controls(
                state,
                profile,
                &self.track,
                &self.weather,
                ctx,
                &self.config,
                self.rng.car(index),
            );

            let mut next = state.clone();
            if controls.request_attack
                && next.attack_uses_left > 0
                && !next.attack_active
                && self.track.in_attack_zone(next.lap_distance)
            {
                next.attack_active = true;
                next.attack_remaining = self.config.physics.attack_duration;
                next.attack_uses_left -= 1;
                debug!(car = index, remaining = next.attack_remaining, "attack mode armed");
                tick_events.push(RaceEvent {
                    t: t_next,
                    step: step_next,
                    data: EventData::AttackActivate {
                        car: self.race.arena.handle_at(index),
                        remaining: next.attack_remaining,
                    },
                });
            }

            let consistency = profile.consistency;
            let step_effects = physics::step_car(
                &mut next,
                consistency,
                &controls,
                &self.track,
                &self.weather,
                &self.config,
                self.rng.car(index),
                t_next,
            );
            if !physics::state_is_finite(&next) {
                warn!(car = index, step = step_next, "numerical blow-up, tick aborted");
                self.faulted = true;
                return Err(SimError::NumericalBlowup { step: step_next });
            }
            if step_effects.energy_exhausted {
                next.active = false;
                next.dnf_reason = DnfReason::EnergyEmpty;
                debug!(car = index, "battery exhausted, car retired");
            }
            next_states.push(next);
            effects.push(step_effects);
        }

        // Commit: the whole sweep was finite, so the tick becomes real.
        self.race.t = t_next;
        self.race.step_index = step_next;
        #[cfg(debug_assertions)]
        let previous_totals: Vec<f64> = self
            .race
            .arena
            .states()
            .iter()
            .map(|car| car.total_distance)
            .collect();
        for (index, next) in next_states.into_iter().enumerate() {
            self.race.arena.states_mut()[index] = next;
        }
        for (index, step_effects) in effects.iter().enumerate() {
            let id = self.race.arena.handle_at(index);
            if let Some(lap) = step_effects.lap_completed {
                tick_events.push(RaceEvent {
                    t: t_next,
                    step: step_next,
                    data: EventData::LapComplete {
                        car: id,
                        lap: lap.lap,
                        lap_time: lap.lap_time,
                    },
                });
            }
            if step_effects.attack_expired {
                tick_events.push(RaceEvent {
                    t: t_next,
                    step: step_next,
                    data: EventData::AttackExpire { car: id },
                });
            }
        }

        // Stage 3: rank maintenance. Ranks are sticky; retirements compress
        // the order, overtakes (below) are what swap running cars.
        normalize_positions(&mut self.race.arena);

        // Stage 4: event sweeps in fixed order.
        let leader_lap = self.race.leader_lap();
        if !self.race.safety_car_active {
            self.event_engine.overtake_sweep(
                &mut self.race.arena,
                &self.track,
                &self.config,
                t_next,
                step_next,
                self.rng.global(GlobalStream::Overtake),
                &mut tick_events,
            );
        }
        self.event_engine.crash_sweep(
            &mut self.race.arena,
            &self.track,
            &self.config,
            leader_lap,
            t_next,
            step_next,
            self.rng.global(GlobalStream::Crash),
            &mut tick_events,
        );
        if self.config.safety_car_enabled {
            if self.race.safety_car_active {
                if t_next >= self.race.safety_car_until {
                    self.race.safety_car_active = false;
                    info!(t = t_next, "safety car withdrawn");
                    tick_events.push(RaceEvent {
                        t: t_next,
                        step: step_next,
                        data: EventData::SafetyCarWithdraw,
                    });
                }
            } else if let Some(reason) = self.event_engine.safety_car_check(
                leader_lap,
                &self.config,
                self.rng.global(GlobalStream::SafetyCar),
            ) {
                self.race.safety_car_active = true;
                self.race.safety_car_until = t_next + self.config.events.safety_car_duration;
                info!(t = t_next, ?reason, until = self.race.safety_car_until, "safety car deployed");
                tick_events.push(RaceEvent {
                    t: t_next,
                    step: step_next,
                    data: EventData::SafetyCarDeploy { reason },
                });
            }
        }
        self.event_engine.mechanical_sweep(
            &mut self.race.arena,
            &self.config,
            t_next,
            step_next,
            self.rng.global(GlobalStream::Mechanical),
            &mut tick_events,
        );

        // Retirements during the sweeps also compress the ranks.
        normalize_positions(&mut self.race.arena);

        // Stage 5: derived metrics off the committed field.
        self.refresh_metrics();

        #[cfg(debug_assertions)]
        self.debug_check_invariants(&previous_totals);

        // Publish this tick's events in their total order.
        sort_tick_events(&mut tick_events, &self.race.arena);
        for event in &tick_events {
            let subject = event
                .data
                .subject()
                .and_then(|id| self.race.arena.index_of(id))
                .map(|index| index as u32);
            self.replay.record(event.step, event.data.kind(), subject);
        }
        self.event_buffer.extend(tick_events);

        if self.check_termination() {
            return Ok(TickOutcome::Finished);
        }
        Ok(TickOutcome::Advanced)
    }

    /// Runs ticks until the race finishes or is cancelled.
    pub fn run_to_completion(&mut self) -> Result<TickOutcome, SimError> {
        loop {
            match self.tick()? {
                TickOutcome::Advanced => {}
                outcome => return Ok(outcome),
            }
        }
    }

    /// Consistent snapshot for external consumers. Buffered events are
    /// drained: each event is observed exactly once across snapshots.
    pub fn race_snapshot(&mut self) -> RaceSnapshot {
        let cars = (0..self.race.arena.len())
            .map(|index| {
                let id = self.race.arena.handle_at(index);
                let state = &self.race.arena.states()[index];
                let profile = &self.race.arena.profiles()[index];
                CarView {
                    id,
                    driver: profile.name.clone(),
                    vector: state.to_vector(),
                    speed_kmh: state.speed() * 3.6,
                    energy_efficiency: state.energy_efficiency(),
                    last_lap_time: state.last_lap_time,
                    best_lap_time: state.best_lap_time,
                    attack_uses_left: state.attack_uses_left,
                    dnf_reason: state.dnf_reason,
                }
            })
            .collect();
        RaceSnapshot {
            t: self.race.t,
            step_index: self.race.step_index,
            safety_car_active: self.race.safety_car_active,
            finished: self.finished,
            cars,
            standings: standings(&self.race.arena, self.config.physics.battery_capacity),
            events: std::mem::take(&mut self.event_buffer),
        }
    }

    fn check_termination(&mut self) -> bool {
        if self.finished {
            return true;
        }
        let active = self.race.active_count();
        let leader_done =
            self.config.num_laps == 0 || self.race.leader_lap() >= self.config.num_laps;
        let budget_spent = self
            .config
            .max_ticks
            .is_some_and(|budget| self.race.step_index >= budget);
        if active == 0 || leader_done || budget_spent {
            self.finished = true;
            info!(
                t = self.race.t,
                steps = self.race.step_index,
                active,
                "race finished"
            );
        }
        self.finished
    }

    fn refresh_metrics(&mut self) {
        let states = self.race.arena.states();
        let leader = states
            .iter()
            .filter(|car| car.active)
            .min_by_key(|car| car.position)
            .map(|car| car.total_distance);
        let mut ahead_distance: Vec<Option<f64>> = vec![None; states.len()];
        for (index, car) in states.iter().enumerate() {
            if !car.active || car.position <= 1 {
                continue;
            }
            ahead_distance[index] = states
                .iter()
                .find(|other| other.active && other.position == car.position - 1)
                .map(|other| other.total_distance);
        }
        let physics = self.config.physics.clone();
        for (index, car) in self.race.arena.states_mut().iter_mut().enumerate() {
            if !car.active {
                car.gap_to_leader = f64::INFINITY;
                car.gap_to_ahead = f64::INFINITY;
                continue;
            }
            let speed = car.speed().max(1.0);
            car.gap_to_leader = leader
                .map(|distance| (distance - car.total_distance).max(0.0) / speed)
                .unwrap_or(0.0);
            car.gap_to_ahead = ahead_distance[index]
                .map(|distance| (distance - car.total_distance).max(0.0) / speed)
                .unwrap_or(0.0);
            car.performance_index = car.compute_performance_index(&physics);
        }
    }

    #[cfg(debug_assertions)]
    fn debug_check_invariants(&self, previous_totals: &[f64]) {
        let length = self.track.total_length();
        let capacity = self.config.physics.battery_capacity;
        let mu_max = self.config.physics.mu_max;
        let mu_min = self.config.physics.mu_min;
        let mut active_positions: Vec<usize> = Vec::new();
        for (index, car) in self.race.arena.states().iter().enumerate() {
            debug_assert!(
                car.lap_distance >= 0.0 && car.lap_distance < length,
                "lap_distance out of range: {}",
                car.lap_distance
            );
            debug_assert!(
                car.total_distance + 1e-9 >= previous_totals[index],
                "total_distance regressed"
            );
            debug_assert!(car.battery_energy >= 0.0 && car.battery_energy <= capacity);
            debug_assert!((0.0..=1.0).contains(&car.tire_wear));
            let expected_grip = mu_max - (mu_max - mu_min) * car.tire_wear;
            debug_assert!((car.grip_coefficient - expected_grip).abs() < 1e-12);
            debug_assert!(!car.attack_active || car.attack_remaining > 0.0);
            if car.active {
                active_positions.push(car.position);
            }
        }
        active_positions.sort_unstable();
        for (rank, position) in active_positions.iter().enumerate() {
            debug_assert_eq!(*position, rank + 1, "positions are not a 1..K permutation");
        }
    }
}

/// Stagger a grid slot a little way up the road so the starting order is
/// reflected in the longitudinal ordering (slot 0 is pole, furthest along).
fn place_on_grid(state: &mut CarState, slot: usize, count: usize, track: &Track) {
    let stagger = (count - 1 - slot) as f64 * GRID_SPACING;
    state.lap_distance = stagger;
    state.total_distance = stagger;
    let geometry = track.geometry_at(stagger);
    state.x = geometry.x;
    state.y = geometry.y;
}

/// Reassigns ranks 1..K over the active cars, preserving their relative
/// order. Retired cars keep their last rank and drop out of the ordering.
fn normalize_positions(arena: &mut CarArena) {
    let mut active: Vec<usize> = (0..arena.len())
        .filter(|&index| arena.states()[index].active)
        .collect();
    active.sort_by_key(|&index| arena.states()[index].position);
    for (rank, index) in active.into_iter().enumerate() {
        arena.states_mut()[index].position = rank + 1;
    }
}
