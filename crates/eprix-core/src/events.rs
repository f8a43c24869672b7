//! Typed race events and the probabilistic models that fire them.
//!
//! The sweeps run after physics and position resolution, in a fixed order
//! (overtakes, crashes, safety car, mechanical), drawing only from their
//! dedicated global streams so the models stay independent of each other and
//! of the per-car noise.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, FailureModel};
use crate::rng::RngStream;
use crate::state::{CarArena, CarId, DnfReason};
use eprix_track::{SegmentKind, Track};

/// Discriminant of an event, ordered by its rank within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    LapComplete,
    Overtake,
    Crash,
    SafetyCarDeploy,
    SafetyCarWithdraw,
    AttackActivate,
    AttackExpire,
    MechanicalFailure,
}

impl EventKind {
    /// Total order of kinds within one tick.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::LapComplete => 0,
            Self::Overtake => 1,
            Self::Crash => 2,
            Self::SafetyCarDeploy => 3,
            Self::SafetyCarWithdraw => 4,
            Self::AttackActivate => 5,
            Self::AttackExpire => 6,
            Self::MechanicalFailure => 7,
        }
    }
}

/// Why the safety car came out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyCarReason {
    /// Random track hazard under a green flag.
    TrackHazard,
    /// Elevated hazard after recent crashes.
    CrashCluster,
}

/// Failed component reported with a mechanical DNF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    Powertrain,
    Suspension,
    Brakes,
    Steering,
}

const FAILURE_CAUSES: [FailureCause; 4] = [
    FailureCause::Powertrain,
    FailureCause::Suspension,
    FailureCause::Brakes,
    FailureCause::Steering,
];

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    LapComplete {
        car: CarId,
        lap: u32,
        lap_time: f64,
    },
    Overtake {
        attacker: CarId,
        defender: CarId,
        at_s: f64,
    },
    Crash {
        car: CarId,
        risk: f64,
    },
    SafetyCarDeploy {
        reason: SafetyCarReason,
    },
    SafetyCarWithdraw,
    AttackActivate {
        car: CarId,
        remaining: f64,
    },
    AttackExpire {
        car: CarId,
    },
    MechanicalFailure {
        car: CarId,
        cause: FailureCause,
    },
}

impl EventData {
    /// The kind discriminant for this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::LapComplete { .. } => EventKind::LapComplete,
            Self::Overtake { .. } => EventKind::Overtake,
            Self::Crash { .. } => EventKind::Crash,
            Self::SafetyCarDeploy { .. } => EventKind::SafetyCarDeploy,
            Self::SafetyCarWithdraw => EventKind::SafetyCarWithdraw,
            Self::AttackActivate { .. } => EventKind::AttackActivate,
            Self::AttackExpire { .. } => EventKind::AttackExpire,
            Self::MechanicalFailure { .. } => EventKind::MechanicalFailure,
        }
    }

    /// The car the event is about; `None` for race-wide events. Overtakes
    /// order by their attacker.
    #[must_use]
    pub const fn subject(&self) -> Option<CarId> {
        match self {
            Self::LapComplete { car, .. }
            | Self::Crash { car, .. }
            | Self::AttackActivate { car, .. }
            | Self::AttackExpire { car }
            | Self::MechanicalFailure { car, .. } => Some(*car),
            Self::Overtake { attacker, .. } => Some(*attacker),
            Self::SafetyCarDeploy { .. } | Self::SafetyCarWithdraw => None,
        }
    }
}

/// One timestamped entry of the race event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceEvent {
    /// Simulated time the event fired, s.
    pub t: f64,
    /// Tick index the event fired on.
    pub step: u64,
    pub data: EventData,
}

/// Stable within-tick ordering: `(kind_rank, subject id)`.
pub(crate) fn sort_tick_events(events: &mut [RaceEvent], arena: &CarArena) {
    events.sort_by_key(|event| {
        let subject = event
            .data
            .subject()
            .and_then(|id| arena.index_of(id))
            .unwrap_or(usize::MAX);
        (event.data.kind().rank(), subject)
    });
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Stateful event generator: owns the crash history and safety-car spacing
/// bookkeeping that the hazard models need across ticks.
#[derive(Debug, Default)]
pub(crate) struct EventEngine {
    last_deploy_lap: Option<u32>,
    /// Leader lap at the time of each crash so far.
    crash_laps: Vec<u32>,
}

impl EventEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Logistic overtake model over every close pair, challenger iterated by
    /// ascending id, then defender by ascending id. A success swaps the two
    /// rank positions immediately, so later pairs see the updated order.
    pub(crate) fn overtake_sweep(
        &mut self,
        arena: &mut CarArena,
        track: &Track,
        config: &Config,
        t: f64,
        step: u64,
        rng: &mut RngStream,
        out: &mut Vec<RaceEvent>,
    ) {
        let e = &config.events;
        let capacity = config.physics.battery_capacity;
        let n = arena.len();
        for attacker_idx in 0..n {
            for defender_idx in 0..n {
                if attacker_idx == defender_idx {
                    continue;
                }
                let attacker = &arena.states()[attacker_idx];
                let defender = &arena.states()[defender_idx];
                if !attacker.active || !defender.active {
                    continue;
                }
                let distance_gap = attacker.total_distance - defender.total_distance;
                if distance_gap <= 0.0
                    || distance_gap >= e.overtake_proximity
                    || attacker.position <= defender.position
                {
                    continue;
                }
                let (segment, _) = track.segment_at(attacker.lap_distance);
                let segment_factor = match segment.kind {
                    SegmentKind::Straight => e.k_straight,
                    SegmentKind::Chicane => e.k_chicane,
                    _ => e.k_corner,
                };
                let z = e.z_speed * (attacker.speed() - defender.speed())
                    + e.z_energy * (attacker.energy_pct(capacity) - defender.energy_pct(capacity))
                    + if attacker.attack_active {
                        e.z_attack_attacker
                    } else {
                        0.0
                    }
                    - if defender.attack_active {
                        e.z_attack_defender
                    } else {
                        0.0
                    }
                    + e.z_tire * (defender.tire_wear - attacker.tire_wear)
                    + segment_factor;
                if rng.uniform01() < sigmoid(z) * e.overtake_scale {
                    let attacker_id = arena.handle_at(attacker_idx);
                    let defender_id = arena.handle_at(defender_idx);
                    let at_s = attacker.lap_distance;
                    let states = arena.states_mut();
                    let defender_position = states[defender_idx].position;
                    states[defender_idx].position = states[attacker_idx].position;
                    states[attacker_idx].position = defender_position;
                    states[attacker_idx].overtakes_made += 1;
                    states[defender_idx].overtakes_received += 1;
                    out.push(RaceEvent {
                        t,
                        step,
                        data: EventData::Overtake {
                            attacker: attacker_id,
                            defender: defender_id,
                            at_s,
                        },
                    });
                }
            }
        }
    }

    /// Sigmoid-scaled crash risk per active car.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn crash_sweep(
        &mut self,
        arena: &mut CarArena,
        track: &Track,
        config: &Config,
        leader_lap: u32,
        t: f64,
        step: u64,
        rng: &mut RngStream,
        out: &mut Vec<RaceEvent>,
    ) {
        let e = &config.events;
        let p = &config.physics;
        let track_length = track.total_length();
        let n = arena.len();
        for index in 0..n {
            if !arena.states()[index].active {
                continue;
            }
            let nearby = (0..n)
                .filter(|&other| other != index && arena.states()[other].active)
                .filter(|&other| {
                    let a = arena.states()[index].total_distance.rem_euclid(track_length);
                    let b = arena.states()[other].total_distance.rem_euclid(track_length);
                    let gap = (a - b).abs();
                    gap.min(track_length - gap) < e.crash_proximity_radius
                })
                .count();
            let car = &arena.states()[index];
            let aggression = arena.profiles()[index].aggression;
            let risk = 0.30 * (car.speed() / p.v_max)
                + 0.25 * car.tire_wear
                + 0.20 * aggression
                + 0.15 * (nearby as f64 / 5.0).min(1.0)
                + 0.10 * (1.0 - car.energy_pct(p.battery_capacity) / 100.0).max(0.0);
            let probability = e.crash_base_probability * (1.0 + e.crash_risk_scale * risk);
            if rng.uniform01() < probability {
                let id = arena.handle_at(index);
                let state = &mut arena.states_mut()[index];
                state.active = false;
                state.dnf_reason = DnfReason::Crash;
                self.crash_laps.push(leader_lap);
                debug!(car = index, risk, "crash");
                out.push(RaceEvent {
                    t,
                    step,
                    data: EventData::Crash { car: id, risk },
                });
            }
        }
    }

    /// Poisson-process deployment check. Returns the reason when the hazard
    /// fires this tick; spacing and first-lap rules are enforced here.
    pub(crate) fn safety_car_check(
        &mut self,
        leader_lap: u32,
        config: &Config,
        rng: &mut RngStream,
    ) -> Option<SafetyCarReason> {
        let e = &config.events;
        if leader_lap < e.safety_car_earliest_lap {
            return None;
        }
        if let Some(last) = self.last_deploy_lap {
            if leader_lap.saturating_sub(last) < e.safety_car_min_gap_laps {
                return None;
            }
        }
        let recent_crashes = self
            .crash_laps
            .iter()
            .filter(|&&lap| lap + 2 > leader_lap)
            .count();
        let rate = e.safety_car_rate * (1.0 + e.safety_car_crash_boost * recent_crashes as f64);
        let probability = 1.0 - (-rate * config.dt / e.nominal_lap_time).exp();
        if rng.uniform01() < probability {
            self.last_deploy_lap = Some(leader_lap);
            Some(if recent_crashes > 0 {
                SafetyCarReason::CrashCluster
            } else {
                SafetyCarReason::TrackHazard
            })
        } else {
            None
        }
    }

    /// Weibull wear-out hazard over stress-scaled race age.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mechanical_sweep(
        &mut self,
        arena: &mut CarArena,
        config: &Config,
        t: f64,
        step: u64,
        rng: &mut RngStream,
        out: &mut Vec<RaceEvent>,
    ) {
        let FailureModel::Weibull { shape, scale } = config.failure_model else {
            return;
        };
        let n = arena.len();
        for index in 0..n {
            let car = &arena.states()[index];
            if !car.active {
                continue;
            }
            let stress = 0.5 * arena.profiles()[index].aggression + 0.5 * car.tire_wear;
            let effective_age = t * (1.0 + stress);
            if effective_age <= 0.0 {
                continue;
            }
            let hazard = (shape / scale) * (effective_age / scale).powf(shape - 1.0);
            if rng.uniform01() < hazard * config.dt {
                let cause_draw = rng.uniform01();
                let cause = FAILURE_CAUSES
                    [((cause_draw * FAILURE_CAUSES.len() as f64) as usize).min(3)];
                let id = arena.handle_at(index);
                let state = &mut arena.states_mut()[index];
                state.active = false;
                state.dnf_reason = DnfReason::Mechanical;
                debug!(car = index, ?cause, "mechanical failure");
                out.push(RaceEvent {
                    t,
                    step,
                    data: EventData::MechanicalFailure { car: id, cause },
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{GlobalStream, RngService};
    use crate::state::{CarState, DriverProfile};
    use eprix_track::Segment;

    fn sprint_track() -> Track {
        Track::new(vec![Segment::straight(2000.0, 89.0)]).expect("track")
    }

    fn arena_with(cars: Vec<CarState>) -> CarArena {
        let mut arena = CarArena::new();
        for (i, car) in cars.into_iter().enumerate() {
            arena.insert(
                DriverProfile::new(format!("Driver {i}"), 0.8, 0.5, 0.9),
                car,
            );
        }
        arena
    }

    #[test]
    fn kind_ranks_follow_the_contract() {
        let ordered = [
            EventKind::LapComplete,
            EventKind::Overtake,
            EventKind::Crash,
            EventKind::SafetyCarDeploy,
            EventKind::SafetyCarWithdraw,
            EventKind::AttackActivate,
            EventKind::AttackExpire,
            EventKind::MechanicalFailure,
        ];
        for window in ordered.windows(2) {
            assert!(window[0].rank() < window[1].rank());
        }
    }

    #[test]
    fn overtake_fires_for_faster_challenger() {
        let config = {
            let mut c = Config::default();
            // Force the draw: a big logit and no per-tick scaling loss.
            c.events.overtake_scale = 1.0;
            c
        };
        let track = sprint_track();
        let physics = &config.physics;

        let mut leader = CarState::fresh(physics);
        leader.vx = 60.0;
        leader.position = 1;
        leader.total_distance = 105.0;
        leader.lap_distance = 105.0;

        let mut challenger = CarState::fresh(physics);
        challenger.vx = 75.0;
        challenger.position = 2;
        challenger.total_distance = 106.0; // already alongside
        challenger.lap_distance = 106.0;

        let mut arena = arena_with(vec![leader, challenger]);
        let mut rng = RngService::new(1, 2);
        let mut engine = EventEngine::new();
        let mut out = Vec::new();
        engine.overtake_sweep(
            &mut arena,
            &track,
            &config,
            1.0,
            100,
            rng.global(GlobalStream::Overtake),
            &mut out,
        );

        assert_eq!(out.len(), 1);
        let EventData::Overtake {
            attacker, defender, ..
        } = out[0].data.clone()
        else {
            panic!("expected overtake, got {:?}", out[0]);
        };
        assert_eq!(arena.index_of(attacker), Some(1));
        assert_eq!(arena.index_of(defender), Some(0));
        assert_eq!(arena.states()[1].position, 1);
        assert_eq!(arena.states()[0].position, 2);
        assert_eq!(arena.states()[1].overtakes_made, 1);
        assert_eq!(arena.states()[0].overtakes_received, 1);
    }

    #[test]
    fn overtake_requires_proximity_and_rank_inversion() {
        let config = {
            let mut c = Config::default();
            c.events.overtake_scale = 1.0;
            c
        };
        let track = sprint_track();
        let physics = &config.physics;

        // Challenger 50 m back: out of range, nothing may fire.
        let mut leader = CarState::fresh(physics);
        leader.position = 1;
        leader.total_distance = 150.0;
        let mut challenger = CarState::fresh(physics);
        challenger.position = 2;
        challenger.total_distance = 100.0;
        let mut arena = arena_with(vec![leader, challenger]);
        let mut rng = RngService::new(2, 2);
        let mut engine = EventEngine::new();
        let mut out = Vec::new();
        engine.overtake_sweep(
            &mut arena,
            &track,
            &config,
            1.0,
            1,
            rng.global(GlobalStream::Overtake),
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn crash_risk_combines_the_five_factors() {
        let mut config = Config::default();
        config.events.crash_base_probability = 1.0; // always fires
        let track = sprint_track();
        let mut car = CarState::fresh(&config.physics);
        car.vx = config.physics.v_max;
        car.tire_wear = 1.0;
        car.battery_energy = 0.0;
        let mut arena = arena_with(vec![car]);
        let mut rng = RngService::new(3, 1);
        let mut engine = EventEngine::new();
        let mut out = Vec::new();
        engine.crash_sweep(
            &mut arena,
            &track,
            &config,
            3,
            10.0,
            1000,
            rng.global(GlobalStream::Crash),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        let EventData::Crash { risk, .. } = out[0].data else {
            panic!("expected crash");
        };
        // speed 0.30 + wear 0.25 + aggression 0.20*0.5 + proximity 0 + energy 0.10
        assert!((risk - 0.75).abs() < 1e-9, "risk {risk}");
        assert!(!arena.states()[0].active);
        assert_eq!(arena.states()[0].dnf_reason, DnfReason::Crash);
    }

    #[test]
    fn safety_car_respects_lap_gating() {
        let mut config = Config::default();
        config.events.safety_car_rate = f64::INFINITY; // hazard saturates to 1
        let mut rng = RngService::new(4, 1);
        let mut engine = EventEngine::new();

        // Never on the opening laps.
        assert!(engine
            .safety_car_check(1, &config, rng.global(GlobalStream::SafetyCar))
            .is_none());

        let reason = engine
            .safety_car_check(2, &config, rng.global(GlobalStream::SafetyCar))
            .expect("deploys once eligible");
        assert_eq!(reason, SafetyCarReason::TrackHazard);

        // Cooldown window blocks a redeploy.
        assert!(engine
            .safety_car_check(4, &config, rng.global(GlobalStream::SafetyCar))
            .is_none());
        assert!(engine
            .safety_car_check(7, &config, rng.global(GlobalStream::SafetyCar))
            .is_some());
    }

    #[test]
    fn crash_history_raises_the_deploy_rate() {
        let config = Config::default();
        let mut engine = EventEngine::new();
        engine.crash_laps.push(3);
        let mut rng = RngService::new(5, 1);
        // With a crash on the books the reason is attributed to it.
        let mut config_hot = config.clone();
        config_hot.events.safety_car_rate = f64::INFINITY;
        let reason = engine
            .safety_car_check(3, &config_hot, rng.global(GlobalStream::SafetyCar))
            .expect("deploys");
        assert_eq!(reason, SafetyCarReason::CrashCluster);
    }

    #[test]
    fn mechanical_model_is_off_by_default() {
        let config = Config::default();
        let mut arena = arena_with(vec![CarState::fresh(&config.physics)]);
        let mut rng = RngService::new(6, 1);
        let mut engine = EventEngine::new();
        let mut out = Vec::new();
        engine.mechanical_sweep(
            &mut arena,
            &config,
            1e6,
            1,
            rng.global(GlobalStream::Mechanical),
            &mut out,
        );
        assert!(out.is_empty());
        assert!(arena.states()[0].active);
    }

    #[test]
    fn weibull_hazard_grows_with_age_and_fires() {
        let mut config = Config::default();
        config.failure_model = FailureModel::Weibull {
            shape: 2.5,
            scale: 5000.0,
        };
        // Hazard at 5000 s effective age: (2.5/5000) * 1 = 5e-4 per second.
        let FailureModel::Weibull { shape, scale } = config.failure_model else {
            unreachable!();
        };
        let young = (shape / scale) * (100.0_f64 / scale).powf(shape - 1.0);
        let old = (shape / scale) * (5000.0_f64 / scale).powf(shape - 1.0);
        assert!(old > young * 100.0);

        // Force a failure by stretching dt so hazard*dt ~ 1.
        config.dt = 1.0e4;
        let mut arena = arena_with(vec![CarState::fresh(&config.physics)]);
        let mut rng = RngService::new(7, 1);
        let mut engine = EventEngine::new();
        let mut out = Vec::new();
        engine.mechanical_sweep(
            &mut arena,
            &config,
            10_000.0,
            1,
            rng.global(GlobalStream::Mechanical),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(arena.states()[0].dnf_reason, DnfReason::Mechanical);
    }

    #[test]
    fn tick_events_sort_by_rank_then_subject() {
        let config = Config::default();
        let arena = arena_with(vec![
            CarState::fresh(&config.physics),
            CarState::fresh(&config.physics),
        ]);
        let a = arena.handle_at(0);
        let b = arena.handle_at(1);
        let mut events = vec![
            RaceEvent {
                t: 1.0,
                step: 1,
                data: EventData::AttackExpire { car: a },
            },
            RaceEvent {
                t: 1.0,
                step: 1,
                data: EventData::LapComplete {
                    car: b,
                    lap: 2,
                    lap_time: 88.0,
                },
            },
            RaceEvent {
                t: 1.0,
                step: 1,
                data: EventData::LapComplete {
                    car: a,
                    lap: 2,
                    lap_time: 87.5,
                },
            },
            RaceEvent {
                t: 1.0,
                step: 1,
                data: EventData::SafetyCarDeploy {
                    reason: SafetyCarReason::TrackHazard,
                },
            },
        ];
        sort_tick_events(&mut events, &arena);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.data.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::LapComplete,
                EventKind::LapComplete,
                EventKind::SafetyCarDeploy,
                EventKind::AttackExpire,
            ]
        );
        assert_eq!(events[0].data.subject(), Some(a));
        assert_eq!(events[1].data.subject(), Some(b));
    }
}
