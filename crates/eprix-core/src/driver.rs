//! Closed-form driver model: target-speed synthesis, lookahead braking,
//! steering, and the attack-mode request policy.
//!
//! The controller is a pure function of the car, race situation, track, and
//! weather, plus a handful of draws from the car's own noise stream. It never
//! mutates simulation state; the integrator applies its output.

use eprix_track::{corner_speed_limit, Segment, SegmentKind, Track};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::physics::effective_grip;
use crate::rng::RngStream;
use crate::state::{CarState, DriverProfile};
use crate::weather::WeatherView;

/// Control outputs for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Controls {
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    /// The driver wants attack mode; the integrator arms it only inside an
    /// activation zone.
    pub request_attack: bool,
}

/// Behavioural variant selected per driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum DriverPolicy {
    /// Drive to the profile traits as-is.
    #[default]
    Baseline,
    /// Push harder: effective aggression raised, conservation delayed.
    Aggressive,
    /// Protect energy and tires: conservation starts earlier.
    Conservative,
    /// Replay a recorded control sequence verbatim (holds the last entry once
    /// exhausted). Used by external agents driving the kernel open-loop.
    Scripted(Vec<Controls>),
}

/// Per-tick race situation handed to the controller by the integrator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RaceContext {
    pub step_index: u64,
    pub laps_remaining: u32,
    /// Leader progress through the race, 0..1.
    pub race_progress: f64,
    pub safety_car_active: bool,
}

/// Trait values after the policy tag is applied.
struct EffectiveTraits {
    skill: f64,
    aggression: f64,
    consistency: f64,
    conserve_early: f64,
}

fn effective_traits(profile: &DriverProfile) -> EffectiveTraits {
    let (aggression, conserve_early) = match profile.policy {
        DriverPolicy::Aggressive => ((profile.aggression + 0.15).min(1.0), -5.0),
        DriverPolicy::Conservative => ((profile.aggression - 0.15).max(0.0), 10.0),
        _ => (profile.aggression, 0.0),
    };
    EffectiveTraits {
        skill: profile.skill,
        aggression,
        consistency: profile.consistency,
        conserve_early,
    }
}

/// Baseline speed for a segment: the corner-speed limit for curved segments,
/// the top speed on straights, boosted while attack mode is live.
fn baseline_speed(
    segment: &Segment,
    grip_coefficient: f64,
    weather: &WeatherView,
    v: f64,
    attack_active: bool,
    config: &Config,
) -> f64 {
    let v_max = config.physics.v_max;
    let mut base = if segment.kind.is_curved() {
        let mu = effective_grip(grip_coefficient, segment, weather, v);
        corner_speed_limit(segment.radius, mu, segment.banking, v_max)
    } else {
        v_max
    };
    if attack_active {
        // The boost is worth ~8% on the straights but barely helps mid-corner.
        base *= if segment.kind.is_curved() { 1.02 } else { 1.08 };
    }
    base.min(v_max)
}

/// Synthesizes one tick of controls for `car`.
pub(crate) fn compute_controls(
    car: &CarState,
    profile: &DriverProfile,
    track: &Track,
    weather: &WeatherView,
    ctx: RaceContext,
    config: &Config,
    rng: &mut RngStream,
) -> Controls {
    if let DriverPolicy::Scripted(sequence) = &profile.policy {
        let index = (ctx.step_index as usize).min(sequence.len().saturating_sub(1));
        return sequence.get(index).copied().unwrap_or_default();
    }

    let traits = effective_traits(profile);
    let gains = &config.controller;
    let v = car.speed();
    let (segment, local_s) = track.segment_at(car.lap_distance);

    // Lookahead: read the track where the car will be in `lookahead_time`
    // seconds so braking starts before the corner, not inside it.
    let look_s = car.lap_distance + v * gains.lookahead_time;
    let (look_segment, _) = track.segment_at(look_s);

    let here = baseline_speed(
        segment,
        car.grip_coefficient,
        weather,
        v,
        car.attack_active,
        config,
    );
    let ahead = baseline_speed(
        look_segment,
        car.grip_coefficient,
        weather,
        v,
        car.attack_active,
        config,
    );
    let mut target = here.min(ahead);

    target *= 0.95 + 0.10 * traits.skill;

    let mut factor = 0.92 + 0.06 * traits.aggression;
    let chasing = car.position > 1 && car.gap_to_ahead < gains.chase_gap;
    let cruising = car.position == 1 && car.gap_to_ahead > gains.lead_gap;
    if chasing {
        factor = (factor + gains.chase_bonus).min(1.0);
    } else if cruising {
        factor *= 1.0 - gains.lead_derate;
    }

    let energy_pct = car.energy_pct(config.physics.battery_capacity);
    if energy_pct < gains.low_energy_pct + traits.conserve_early {
        factor *= 0.92;
    } else if energy_pct < gains.mid_energy_pct + traits.conserve_early {
        factor *= 0.95;
    }
    if car.tire_wear > gains.worn_tire_threshold {
        factor *= 0.95;
    }
    factor *= 1.0 - gains.rain_derate * weather.rain_intensity;

    target *= factor;
    if ctx.safety_car_active {
        target = target.min(config.events.safety_car_speed);
    }
    target = target.min(config.physics.v_max);

    // Steering: noise-only corrections on straights, geometric lock for the
    // segment under the car. The lookahead shapes braking, not steering, so
    // the car does not turn in before the corner arrives.
    let steering = if segment.kind.is_curved() {
        let mut base = (config.physics.wheelbase / segment.radius).atan();
        base *= match segment.kind {
            SegmentKind::LeftCorner => 1.0,
            SegmentKind::RightCorner => -1.0,
            // Weave through the chicane, alternating with progress.
            SegmentKind::Chicane => (local_s / 10.0).sin(),
            SegmentKind::Straight => 0.0,
        };
        base + rng.gauss(0.0, (1.0 - traits.skill) * 0.03)
    } else {
        rng.gauss(0.0, (1.0 - traits.consistency) * 0.01)
    }
    .clamp(-config.physics.max_steering, config.physics.max_steering);

    // Proportional throttle/brake with a deadband around the target.
    let delta_v = target - v;
    let in_corner = segment.kind.is_curved();
    let (mut throttle, mut brake) = if delta_v > gains.deadband {
        let mut throttle =
            (delta_v / gains.throttle_error_span).min(1.0) * (0.7 + 0.3 * traits.aggression);
        if in_corner {
            throttle *= gains.corner_throttle_scale;
        }
        (throttle, 0.0)
    } else if delta_v < -gains.deadband {
        let overspeed = -delta_v;
        let brake = if in_corner {
            if overspeed > gains.panic_brake_overspeed {
                1.0
            } else {
                (overspeed / gains.corner_brake_span).min(1.0)
            }
        } else {
            (overspeed / gains.straight_brake_span).min(1.0)
        };
        (0.0, brake)
    } else {
        (gains.maintenance_throttle, 0.0)
    };

    let request_attack = decide_attack(car, segment, energy_pct, ctx, config, rng);

    // Execution jitter: the gap between intended and applied inputs.
    let control_std = config.noise.control_std * (1.0 - traits.consistency);
    throttle += rng.gauss(0.0, control_std);
    brake += rng.gauss(0.0, control_std);
    let steering = (steering
        + rng.gauss(0.0, config.noise.steering_std * (1.0 - traits.consistency)))
    .clamp(-config.physics.max_steering, config.physics.max_steering);

    Controls {
        throttle: throttle.clamp(0.0, 1.0),
        brake: brake.clamp(0.0, 1.0),
        steering,
        request_attack,
    }
}

/// Attack-mode strategy: worth requesting only when at least two of the key
/// race situations line up, and even then with a small per-tick probability
/// so activations spread out over the window.
fn decide_attack(
    car: &CarState,
    segment: &Segment,
    energy_pct: f64,
    ctx: RaceContext,
    config: &Config,
    rng: &mut RngStream,
) -> bool {
    let gains = &config.controller;
    if car.attack_uses_left == 0 || car.attack_active {
        return false;
    }
    if energy_pct < gains.attack_min_energy_pct {
        return false;
    }
    let close_battle = car.gap_to_ahead.abs() < gains.attack_close_gap;
    let on_straight = !segment.kind.is_curved();
    let conditions = [
        ctx.race_progress > 0.7,
        close_battle && on_straight,
        (2..=6).contains(&car.position) && close_battle,
        energy_pct > 60.0 && ctx.laps_remaining <= 3,
    ];
    if conditions.iter().filter(|&&met| met).count() < 2 {
        return false;
    }
    rng.bernoulli(gains.attack_request_probability)
}
