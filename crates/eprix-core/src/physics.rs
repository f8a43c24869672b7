//! Per-car force balance, integration, and the energy/thermal/tire sub-models.
//!
//! [`step_car`] advances one car by one tick. It is written gather-style: the
//! integrator hands it a scratch copy of the car, collects the returned
//! effects (lap completions, attack expiry, energy exhaustion), and commits
//! the whole field only once every car has stepped cleanly.

use eprix_track::{corner_speed_limit, Segment, Track};

use crate::config::{Config, CornerCap};
use crate::driver::Controls;
use crate::rng::RngStream;
use crate::state::CarState;
use crate::weather::WeatherView;

/// Lateral velocity is clamped to this band, m/s.
const LATERAL_V_LIMIT: f64 = 20.0;

/// Discrete outcomes of one physics step, applied by the integrator.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StepEffects {
    pub lap_completed: Option<LapCompletion>,
    pub attack_expired: bool,
    pub energy_exhausted: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LapCompletion {
    /// Count of completed laps after this crossing.
    pub lap: u32,
    pub lap_time: f64,
}

/// Effective friction coefficient: tire grip composed with the segment
/// surface, the weather multiplier, and a mild speed-dependent downforce
/// bonus (up to 5% approaching 80 m/s).
#[must_use]
pub(crate) fn effective_grip(
    grip_coefficient: f64,
    segment: &Segment,
    weather: &WeatherView,
    v: f64,
) -> f64 {
    let downforce_bonus = 1.0 + 0.05 * (v / 80.0).min(1.0);
    grip_coefficient * segment.grip_multiplier * weather.grip_multiplier * downforce_bonus
}

/// Advances `car` by one tick ending at simulated time `t_next`.
pub(crate) fn step_car(
    car: &mut CarState,
    consistency: f64,
    controls: &Controls,
    track: &Track,
    weather: &WeatherView,
    config: &Config,
    rng: &mut RngStream,
    t_next: f64,
) -> StepEffects {
    let mut effects = StepEffects::default();
    let p = &config.physics;
    let dt = config.dt;

    car.throttle = controls.throttle;
    car.brake = controls.brake;
    car.steering = controls.steering;

    let v = car.speed();
    let (segment, _) = track.segment_at(car.lap_distance);
    let mu_eff = effective_grip(car.grip_coefficient, segment, weather, v);

    // Motor power: throttle fraction of the available envelope, derated as
    // the battery approaches empty.
    let mut power = (p.max_power
        + if car.attack_active {
            p.attack_power_boost
        } else {
            0.0
        })
        * controls.throttle;
    let energy_pct = car.energy_pct(p.battery_capacity);
    if energy_pct < 10.0 {
        power *= energy_pct / 10.0;
    }
    let f_motor = power * p.motor_efficiency / v.max(p.min_force_speed);

    // Aerodynamic and resistive loads.
    let dynamic_pressure = 0.5 * p.air_density * p.frontal_area * v * v;
    let f_drag = dynamic_pressure * p.drag_coefficient;
    let f_down = dynamic_pressure * p.downforce_coefficient;
    let normal_load = p.mass * eprix_track::GRAVITY + f_down;
    let f_roll = p.rolling_resistance * normal_load;
    let f_grad = p.mass * eprix_track::GRAVITY * segment.gradient_angle().sin();

    // Braking and regeneration. Up to 70% of the brake force can be turned
    // into charge, limited by the regen power ceiling and battery headroom.
    let f_brake = controls.brake * p.mass * p.brake_decel_max;
    let energy_regen = if f_brake > 0.0 && v > 0.0 {
        let f_regen = (0.7 * f_brake).min(p.regen_power_max / v.max(p.min_force_speed));
        let recovered = f_regen * v * p.regen_efficiency * dt;
        recovered.min((p.battery_capacity - car.battery_energy).max(0.0))
    } else {
        0.0
    };

    // Longitudinal balance, clipped to what the contact patch can transmit.
    let traction_limit = mu_eff * normal_load;
    let f_net =
        (f_motor - f_drag - f_roll - f_brake - f_grad).clamp(-traction_limit, traction_limit);
    let accel = f_net / p.mass;

    let advance = (v * dt + 0.5 * accel * dt * dt).max(0.0);
    let mut v_new = (v + accel * dt).clamp(0.0, p.v_max);

    // Advance along the circuit; a wrap past the start line completes a lap.
    car.total_distance += advance;
    car.lap_distance += advance;
    if car.lap_distance >= track.total_length() {
        car.lap_distance -= track.total_length();
        car.current_lap += 1;
        let lap_time = t_next - car.lap_start_time;
        car.last_lap_time = lap_time;
        if car.best_lap_time.map_or(true, |best| lap_time < best) {
            car.best_lap_time = Some(lap_time);
        }
        car.lap_start_time = t_next;
        effects.lap_completed = Some(LapCompletion {
            lap: car.current_lap,
            lap_time,
        });
    }
    let geometry = track.geometry_at(car.lap_distance);
    car.x = geometry.x;
    car.y = geometry.y;

    // Corner-speed cap at the segment the car just moved into.
    let (segment_now, local_now) = track.segment_at(car.lap_distance);
    let curvature = segment_now.curvature_at(local_now);
    if curvature != 0.0 {
        let mu_now = effective_grip(car.grip_coefficient, segment_now, weather, v_new);
        let v_corner = corner_speed_limit(
            curvature.abs().recip(),
            mu_now,
            segment_now.banking,
            p.v_max,
        );
        if v_new > v_corner {
            v_new = match config.corner_cap {
                CornerCap::Hard => v_corner,
                CornerCap::Soft => (v_new - p.brake_decel_max * dt).max(v_corner),
            };
        }
    }

    // Lateral dynamics from the steering angle, bounded by grip.
    let mu_now = effective_grip(car.grip_coefficient, segment_now, weather, v_new);
    let lateral_acc = if controls.steering.abs() > 1e-3 {
        let raw = v_new * v_new * controls.steering.tan() / p.wheelbase;
        let limit = mu_now * eprix_track::GRAVITY;
        let a_lat = raw.clamp(-limit, limit);
        car.vy = (car.vy + a_lat * dt).clamp(-LATERAL_V_LIMIT, LATERAL_V_LIMIT);
        a_lat
    } else {
        car.vy *= 0.9;
        0.0
    };
    car.vx = v_new;
    car.long_acc = accel;
    car.lateral_acc = lateral_acc;

    // Tire wear: load-, speed-, and temperature-driven accumulation with a
    // lock-up spike, plus multiplicative noise that grows with hot tires.
    let w = &config.tire_wear;
    let locking = controls.brake > 0.95 && v_new > 20.0;
    let mut wear_inc = (w.k_base
        + w.k_temp * (car.tire_temperature - config.thermal.tire_opt_temp).abs()
        + w.k_speed * v_new * v_new
        + w.k_lat * lateral_acc * lateral_acc
        + if locking { w.k_lock } else { 0.0 })
        * dt;
    let wear_noise_std =
        (config.noise.tire_wear_frac * wear_inc * (1.0 + (car.tire_temperature - 70.0) / 100.0))
            .max(0.0);
    wear_inc = (wear_inc + rng.gauss(0.0, wear_noise_std)).max(0.0);
    car.tire_wear = (car.tire_wear + wear_inc).min(1.0);
    car.grip_coefficient = p.mu_max - (p.mu_max - p.mu_min) * car.tire_wear;

    // Tire temperature: friction heating against convective cooling.
    let th = &config.thermal;
    let heating = th.tire_heating * (0.5 * lateral_acc.abs() + 0.3 * accel.abs());
    let cooling = th.tire_cooling * (car.tire_temperature - weather.temperature);
    car.tire_temperature = (car.tire_temperature + (heating - cooling) * dt)
        .clamp(weather.temperature, th.tire_temp_max);

    // Energy draw with temperature-dependent noise, then the battery update.
    let attack_multiplier = if car.attack_active {
        p.attack_energy_multiplier
    } else {
        1.0
    };
    let energy_used = power / p.motor_efficiency * dt * attack_multiplier;
    let energy_noise_std = (config.noise.energy_base_frac
        + config.noise.energy_temp_frac * (car.battery_temperature - th.batt_opt_temp).abs())
        * energy_used;
    let energy_used = (energy_used + rng.gauss(0.0, energy_noise_std)).max(0.0);
    car.battery_energy =
        (car.battery_energy + energy_regen - energy_used).clamp(0.0, p.battery_capacity);
    car.total_energy_consumed += energy_used;
    car.total_energy_regenerated += energy_regen;
    if car.battery_energy <= 0.0 && car.active {
        effects.energy_exhausted = true;
    }

    // Battery temperature: ohmic heating, active cooling above the optimum,
    // passive cooling towards ambient.
    let heat = (1.0 - p.motor_efficiency) * (energy_used - energy_regen).abs()
        / (th.batt_thermal_mass * th.batt_heat_capacity);
    car.battery_temperature += heat;
    if car.battery_temperature > th.batt_opt_temp {
        car.battery_temperature -=
            (car.battery_temperature - th.batt_opt_temp) * th.batt_active_cooling * dt;
    }
    if car.battery_temperature > weather.temperature {
        car.battery_temperature -=
            (car.battery_temperature - weather.temperature) * th.batt_passive_cooling * dt;
    }
    car.battery_temperature = car
        .battery_temperature
        .clamp(th.batt_temp_min, th.batt_temp_max);

    // Attack-mode countdown.
    if car.attack_active {
        car.attack_remaining -= dt;
        if car.attack_remaining <= 0.0 {
            car.attack_active = false;
            car.attack_remaining = 0.0;
            effects.attack_expired = true;
        }
    }

    // Process noise: √dt-scaled diffusion on the kinematic and thermal state.
    let n = &config.noise;
    let scale = dt.sqrt();
    let inconsistency = 1.0 - consistency;
    car.vx = (car.vx + rng.gauss(0.0, n.vx_std * inconsistency * scale)).clamp(0.0, p.v_max);
    car.vy = (car.vy + rng.gauss(0.0, n.vy_std * inconsistency * scale))
        .clamp(-LATERAL_V_LIMIT, LATERAL_V_LIMIT);
    car.x += rng.gauss(0.0, n.position_std * scale);
    car.y += rng.gauss(0.0, n.position_std * scale);
    car.long_acc += rng.gauss(0.0, n.accel_std * inconsistency * scale);
    car.tire_temperature = (car.tire_temperature + rng.gauss(0.0, n.tire_temp_std * scale))
        .clamp(weather.temperature, th.tire_temp_max);
    car.battery_temperature = (car.battery_temperature
        + rng.gauss(0.0, n.batt_temp_std * scale))
    .clamp(th.batt_temp_min, th.batt_temp_max);

    let speed_now = car.speed();
    if speed_now > car.max_speed {
        car.max_speed = speed_now;
    }

    effects
}

/// True when every field that feeds back into the dynamics is finite.
pub(crate) fn state_is_finite(car: &CarState) -> bool {
    [
        car.vx,
        car.vy,
        car.x,
        car.y,
        car.lateral_acc,
        car.long_acc,
        car.lap_distance,
        car.total_distance,
        car.battery_energy,
        car.battery_temperature,
        car.tire_wear,
        car.grip_coefficient,
        car.tire_temperature,
        car.attack_remaining,
    ]
    .iter()
    .all(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RngService;
    use eprix_track::SegmentKind;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.noise = crate::config::NoiseParams {
            control_std: 0.0,
            steering_std: 0.0,
            vx_std: 0.0,
            vy_std: 0.0,
            position_std: 0.0,
            accel_std: 0.0,
            tire_temp_std: 0.0,
            batt_temp_std: 0.0,
            tire_wear_frac: 0.0,
            energy_base_frac: 0.0,
            energy_temp_frac: 0.0,
        };
        config
    }

    fn sprint_track() -> Track {
        Track::new(vec![Segment::straight(2000.0, 89.0)]).expect("track")
    }

    fn full_throttle() -> Controls {
        Controls {
            throttle: 1.0,
            ..Controls::default()
        }
    }

    #[test]
    fn full_throttle_accelerates_and_drains_battery() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(1, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 10.0;
        let charge_before = car.battery_energy;

        let effects = step_car(
            &mut car,
            1.0,
            &full_throttle(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(car.vx > 10.0);
        assert!(car.long_acc > 0.0);
        assert!(car.battery_energy < charge_before);
        assert!(car.total_distance > 0.0);
        assert!(effects.lap_completed.is_none());
        assert!(!effects.energy_exhausted);
    }

    #[test]
    fn braking_regenerates_into_headroom() {
        let mut config = quiet_config();
        config.physics.battery_capacity = 100.0e6;
        let track = sprint_track();
        let mut rng = RngService::new(2, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 60.0;
        car.battery_energy = 50.0e6;
        let controls = Controls {
            brake: 1.0,
            ..Controls::default()
        };
        step_car(
            &mut car,
            1.0,
            &controls,
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(car.vx < 60.0);
        assert!(car.total_energy_regenerated > 0.0);
        assert!(car.battery_energy > 50.0e6);

        // A full battery rejects further regen.
        car.battery_energy = config.physics.battery_capacity;
        let regen_before = car.total_energy_regenerated;
        step_car(
            &mut car,
            1.0,
            &controls,
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert_eq!(car.total_energy_regenerated, regen_before);
        assert_eq!(car.battery_energy, config.physics.battery_capacity);
    }

    #[test]
    fn empty_battery_produces_no_motor_force() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(3, 1);
        let mut car = CarState::fresh(&config.physics);
        car.battery_energy = 0.0;
        car.vx = 0.0;
        let effects = step_car(
            &mut car,
            1.0,
            &full_throttle(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert_eq!(car.vx, 0.0, "no charge, no thrust");
        assert!(effects.energy_exhausted);
    }

    #[test]
    fn lap_wrap_records_time_and_increments_lap() {
        let config = quiet_config();
        let track = Track::new(vec![Segment::straight(2500.0, 89.0)]).expect("track");
        let mut rng = RngService::new(4, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 50.0;
        car.lap_distance = 2499.9;
        car.lap_start_time = 0.0;
        let t_next = 49.99;
        let effects = step_car(
            &mut car,
            1.0,
            &full_throttle(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            t_next,
        );
        let completion = effects.lap_completed.expect("lap wrap");
        assert_eq!(completion.lap, 1);
        assert!((completion.lap_time - t_next).abs() < 1e-9);
        assert_eq!(car.current_lap, 1);
        assert!(car.lap_distance < 1.0, "lap_distance {}", car.lap_distance);
        assert_eq!(car.last_lap_time, completion.lap_time);
        assert_eq!(car.best_lap_time, Some(completion.lap_time));
        assert_eq!(car.lap_start_time, t_next);
    }

    #[test]
    fn hard_corner_cap_clamps_speed() {
        let mut config = quiet_config();
        config.corner_cap = CornerCap::Hard;
        let quarter = 50.0 * std::f64::consts::FRAC_PI_2;
        let track = Track::new(vec![
            Segment::corner(SegmentKind::LeftCorner, quarter, 50.0, 24.0),
            Segment::corner(SegmentKind::LeftCorner, quarter, 50.0, 24.0),
            Segment::corner(SegmentKind::LeftCorner, quarter, 50.0, 24.0),
            Segment::corner(SegmentKind::LeftCorner, quarter, 50.0, 24.0),
        ])
        .expect("track");
        let mut rng = RngService::new(5, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 60.0;
        step_car(
            &mut car,
            1.0,
            &Controls::default(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        // mu_eff at the cap includes the 5% downforce bonus ceiling.
        let cap = (1.2 * 1.05 * eprix_track::GRAVITY * 50.0).sqrt();
        assert!(car.vx <= cap + 1e-9, "v {} cap {}", car.vx, cap);

        // Soft cap bleeds speed instead of clamping outright.
        config.corner_cap = CornerCap::Soft;
        let mut car2 = CarState::fresh(&config.physics);
        car2.vx = 60.0;
        step_car(
            &mut car2,
            1.0,
            &Controls::default(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(car2.vx > cap, "soft cap converges over several ticks");
        assert!(car2.vx < 60.0);
    }

    #[test]
    fn steering_builds_bounded_lateral_acceleration() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(6, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 70.0;
        let controls = Controls {
            throttle: 0.2,
            steering: 0.4,
            ..Controls::default()
        };
        step_car(
            &mut car,
            1.0,
            &controls,
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        let limit = effective_grip(car.grip_coefficient, &track.segments()[0], &WeatherView::default(), car.vx)
            * eprix_track::GRAVITY;
        assert!(car.lateral_acc > 0.0);
        assert!(car.lateral_acc <= limit + 1e-3);

        // Neutral steering decays the lateral component.
        let vy = car.vy;
        step_car(
            &mut car,
            1.0,
            &Controls::default(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(car.vy.abs() < vy.abs() + 1e-12);
    }

    #[test]
    fn attack_timer_counts_down_and_expires() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(7, 1);
        let mut car = CarState::fresh(&config.physics);
        car.attack_active = true;
        car.attack_remaining = config.dt * 1.5;

        let effects = step_car(
            &mut car,
            1.0,
            &Controls::default(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(car.attack_active);
        assert!((car.attack_remaining - config.dt * 0.5).abs() < 1e-12);
        assert!(!effects.attack_expired);

        let effects = step_car(
            &mut car,
            1.0,
            &Controls::default(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt * 2.0,
        );
        assert!(!car.attack_active);
        assert_eq!(car.attack_remaining, 0.0);
        assert!(effects.attack_expired);
    }

    #[test]
    fn attack_mode_draws_more_energy() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(8, 1);

        let mut plain = CarState::fresh(&config.physics);
        plain.vx = 50.0;
        step_car(
            &mut plain,
            1.0,
            &full_throttle(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );

        let mut boosted = CarState::fresh(&config.physics);
        boosted.vx = 50.0;
        boosted.attack_active = true;
        boosted.attack_remaining = 100.0;
        step_car(
            &mut boosted,
            1.0,
            &full_throttle(),
            &track,
            &WeatherView::default(),
            &config,
            rng.car(0),
            config.dt,
        );
        assert!(boosted.total_energy_consumed > plain.total_energy_consumed * 1.2);
        assert!(boosted.long_acc > plain.long_acc);
    }

    #[test]
    fn wear_reduces_grip_linearly() {
        let config = quiet_config();
        let track = sprint_track();
        let mut rng = RngService::new(9, 1);
        let mut car = CarState::fresh(&config.physics);
        car.vx = 80.0;
        for _ in 0..1000 {
            step_car(
                &mut car,
                1.0,
                &full_throttle(),
                &track,
                &WeatherView::default(),
                &config,
                rng.car(0),
                config.dt,
            );
        }
        assert!(car.tire_wear > 0.0);
        assert!(car.tire_wear < 0.01, "race-length calibration wears slowly");
        let expected = config.physics.mu_max
            - (config.physics.mu_max - config.physics.mu_min) * car.tire_wear;
        assert_eq!(car.grip_coefficient, expected);
    }

    #[test]
    fn nan_detection_flags_poisoned_state() {
        let config = quiet_config();
        let car = CarState::fresh(&config.physics);
        assert!(state_is_finite(&car));
        let mut bad = car;
        bad.vx = f64::NAN;
        assert!(!state_is_finite(&bad));
    }
}
