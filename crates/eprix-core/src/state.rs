//! Per-car state records and the dense arena that owns them.

use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::config::PhysicsParams;
use crate::driver::DriverPolicy;

new_key_type! {
    /// Stable generational handle for a competitor.
    pub struct CarId;
}

/// Dimension of the canonical observation vector.
pub const STATE_DIM: usize = 20;

/// Why a car stopped racing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DnfReason {
    #[default]
    None,
    Crash,
    EnergyEmpty,
    Mechanical,
    Disqualified,
}

/// Immutable driver descriptor. Skill, aggression, and consistency are
/// normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    pub name: String,
    pub skill: f64,
    pub aggression: f64,
    pub consistency: f64,
    pub policy: DriverPolicy,
}

impl DriverProfile {
    /// Builds a profile, clamping the traits into their calibrated range.
    #[must_use]
    pub fn new(name: impl Into<String>, skill: f64, aggression: f64, consistency: f64) -> Self {
        Self {
            name: name.into(),
            skill: skill.clamp(0.0, 1.0),
            aggression: aggression.clamp(0.0, 1.0),
            consistency: consistency.clamp(0.0, 1.0),
            policy: DriverPolicy::Baseline,
        }
    }

    /// Same profile under a different control policy.
    #[must_use]
    pub fn with_policy(mut self, policy: DriverPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Complete mutable state of one competitor.
///
/// Mutators live in the physics and engine modules and are crate-private; the
/// public surface is read-only plus the vector codec used by external
/// observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarState {
    // Kinematics.
    pub vx: f64,
    pub vy: f64,
    pub x: f64,
    pub y: f64,
    pub lateral_acc: f64,
    pub long_acc: f64,
    pub steering: f64,
    pub throttle: f64,
    pub brake: f64,

    // Circuit bookkeeping.
    pub lap_distance: f64,
    pub total_distance: f64,
    pub current_lap: u32,
    /// Race position, 1-based.
    pub position: usize,

    // Energy.
    pub battery_energy: f64,
    pub battery_temperature: f64,

    // Tires.
    pub tire_wear: f64,
    pub grip_coefficient: f64,
    pub tire_temperature: f64,

    // Attack mode.
    pub attack_active: bool,
    pub attack_remaining: f64,
    pub attack_uses_left: u8,

    // Liveness.
    pub active: bool,
    pub dnf_reason: DnfReason,

    // Derived race metrics, refreshed once per tick.
    pub gap_to_leader: f64,
    pub gap_to_ahead: f64,
    pub performance_index: f64,

    // Accumulated statistics.
    pub lap_start_time: f64,
    pub last_lap_time: f64,
    pub best_lap_time: Option<f64>,
    pub total_energy_consumed: f64,
    pub total_energy_regenerated: f64,
    pub max_speed: f64,
    pub overtakes_made: u32,
    pub overtakes_received: u32,
}

impl CarState {
    /// Fresh race-start state: full battery, new tires, grid position 1.
    #[must_use]
    pub fn fresh(physics: &PhysicsParams) -> Self {
        Self {
            vx: 0.0,
            vy: 0.0,
            x: 0.0,
            y: 0.0,
            lateral_acc: 0.0,
            long_acc: 0.0,
            steering: 0.0,
            throttle: 0.0,
            brake: 0.0,
            lap_distance: 0.0,
            total_distance: 0.0,
            current_lap: 0,
            position: 1,
            battery_energy: physics.battery_capacity,
            battery_temperature: 40.0,
            tire_wear: 0.0,
            grip_coefficient: physics.mu_max,
            tire_temperature: 70.0,
            attack_active: false,
            attack_remaining: 0.0,
            attack_uses_left: physics.attack_uses,
            active: true,
            dnf_reason: DnfReason::None,
            gap_to_leader: 0.0,
            gap_to_ahead: 0.0,
            performance_index: 0.0,
            lap_start_time: 0.0,
            last_lap_time: 0.0,
            best_lap_time: None,
            total_energy_consumed: 0.0,
            total_energy_regenerated: 0.0,
            max_speed: 0.0,
            overtakes_made: 0,
            overtakes_received: 0,
        }
    }

    /// Speed magnitude, m/s.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    /// Battery charge as a percentage of `capacity`.
    #[must_use]
    pub fn energy_pct(&self, capacity: f64) -> f64 {
        if capacity > 0.0 {
            self.battery_energy / capacity * 100.0
        } else {
            0.0
        }
    }

    /// Distance covered per unit energy, km/kWh. Zero until energy is spent.
    #[must_use]
    pub fn energy_efficiency(&self) -> f64 {
        if self.total_energy_consumed > 0.0 {
            (self.total_distance / 1000.0) / (self.total_energy_consumed / 3.6e6)
        } else {
            0.0
        }
    }

    /// Instantaneous competitiveness score in `[0, 1]`: weighted blend of
    /// normalized speed, longitudinal acceleration, remaining energy, tire
    /// life, and a strategy factor.
    #[must_use]
    pub fn compute_performance_index(&self, physics: &PhysicsParams) -> f64 {
        let v_norm = (self.speed() / physics.v_max).clamp(0.0, 1.0);
        let a_norm = ((self.long_acc / physics.brake_decel_max).clamp(-1.0, 1.0) + 1.0) * 0.5;
        let e_norm = (self.battery_energy / physics.battery_capacity).clamp(0.0, 1.0);
        let tire_life = 1.0 - self.tire_wear;
        let strategy = (v_norm + e_norm + tire_life) / 3.0;
        0.30 * v_norm + 0.15 * a_norm + 0.25 * e_norm + 0.20 * tire_life + 0.10 * strategy
    }

    /// Encodes the canonical 20-component observation vector.
    ///
    /// Layout (indices): 0 `x`, 1 `y`, 2 `vx`, 3 `vy`, 4 `battery_energy`,
    /// 5 `battery_temperature`, 6 `tire_wear`, 7 `grip_coefficient`,
    /// 8 `attack_active`, 9 `attack_remaining`, 10 `current_lap`,
    /// 11 `lap_distance`, 12 `long_acc`, 13 `steering`, 14 `throttle`,
    /// 15 `brake`, 16 `active`, 17 `position`, 18 `gap_to_leader`,
    /// 19 `total_distance`.
    #[must_use]
    pub fn to_vector(&self) -> [f64; STATE_DIM] {
        [
            self.x,
            self.y,
            self.vx,
            self.vy,
            self.battery_energy,
            self.battery_temperature,
            self.tire_wear,
            self.grip_coefficient,
            f64::from(u8::from(self.attack_active)),
            self.attack_remaining,
            f64::from(self.current_lap),
            self.lap_distance,
            self.long_acc,
            self.steering,
            self.throttle,
            self.brake,
            f64::from(u8::from(self.active)),
            self.position as f64,
            self.gap_to_leader,
            self.total_distance,
        ]
    }

    /// Rebuilds a state from [`Self::to_vector`] output. Fields outside the
    /// canonical vector (statistics, lap timing, identity) take their
    /// defaults; the encoded numeric fields round-trip exactly.
    #[must_use]
    pub fn from_vector(vector: &[f64; STATE_DIM], physics: &PhysicsParams) -> Self {
        let mut state = Self::fresh(physics);
        state.x = vector[0];
        state.y = vector[1];
        state.vx = vector[2];
        state.vy = vector[3];
        state.battery_energy = vector[4];
        state.battery_temperature = vector[5];
        state.tire_wear = vector[6];
        state.grip_coefficient = vector[7];
        state.attack_active = vector[8] != 0.0;
        state.attack_remaining = vector[9];
        state.current_lap = vector[10] as u32;
        state.lap_distance = vector[11];
        state.long_acc = vector[12];
        state.steering = vector[13];
        state.throttle = vector[14];
        state.brake = vector[15];
        state.active = vector[16] != 0.0;
        state.position = vector[17] as usize;
        state.gap_to_leader = vector[18];
        state.total_distance = vector[19];
        state
    }
}

/// Dense car storage addressed by generational handles.
///
/// Insertion order doubles as the ascending-id iteration order the integrator
/// relies on. Cars are never removed: a DNF flips `active` and keeps the row.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CarArena {
    slots: SlotMap<CarId, usize>,
    handles: Vec<CarId>,
    states: Vec<CarState>,
    profiles: Vec<DriverProfile>,
}

impl CarArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered cars (active or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when no cars are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Registers a car, returning its handle.
    pub fn insert(&mut self, profile: DriverProfile, state: CarState) -> CarId {
        let index = self.states.len();
        let id = self.slots.insert(index);
        self.handles.push(id);
        self.states.push(state);
        self.profiles.push(profile);
        self.debug_assert_coherent();
        id
    }

    /// Handles in ascending-id order.
    pub fn iter_handles(&self) -> impl Iterator<Item = CarId> + '_ {
        self.handles.iter().copied()
    }

    /// Dense index for `id`, if registered.
    #[must_use]
    pub fn index_of(&self, id: CarId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Handle at dense index `index`.
    #[must_use]
    pub fn handle_at(&self, index: usize) -> CarId {
        self.handles[index]
    }

    /// Read a car's state by handle.
    #[must_use]
    pub fn state(&self, id: CarId) -> Option<&CarState> {
        self.index_of(id).map(|index| &self.states[index])
    }

    /// Read a car's profile by handle.
    #[must_use]
    pub fn profile(&self, id: CarId) -> Option<&DriverProfile> {
        self.index_of(id).map(|index| &self.profiles[index])
    }

    /// All states in dense order.
    #[must_use]
    pub fn states(&self) -> &[CarState] {
        &self.states
    }

    /// All profiles in dense order.
    #[must_use]
    pub fn profiles(&self) -> &[DriverProfile] {
        &self.profiles
    }

    pub(crate) fn states_mut(&mut self) -> &mut [CarState] {
        &mut self.states
    }

    pub(crate) fn state_mut(&mut self, id: CarId) -> Option<&mut CarState> {
        let index = self.index_of(id)?;
        Some(&mut self.states[index])
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.handles.len(), self.states.len());
        debug_assert_eq!(self.handles.len(), self.profiles.len());
        debug_assert_eq!(self.handles.len(), self.slots.len());
    }
}
