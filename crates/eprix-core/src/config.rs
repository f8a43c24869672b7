//! Runtime configuration: every tunable of the kernel in one validated record.

use serde::{Deserialize, Serialize};

use crate::SimError;

/// Vehicle and environment constants. Defaults are calibrated to a Gen3-class
/// electric race car; all units SI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsParams {
    /// Air density, kg/m³.
    pub air_density: f64,
    /// Aerodynamic drag coefficient.
    pub drag_coefficient: f64,
    /// Downforce (negative lift) coefficient.
    pub downforce_coefficient: f64,
    /// Frontal area, m².
    pub frontal_area: f64,
    /// Car plus driver mass, kg.
    pub mass: f64,
    /// Rolling resistance coefficient.
    pub rolling_resistance: f64,
    /// Wheelbase, m.
    pub wheelbase: f64,
    /// Race-mode motor power, W.
    pub max_power: f64,
    /// Additional power while attack mode is active, W.
    pub attack_power_boost: f64,
    /// Motor efficiency, 0..1.
    pub motor_efficiency: f64,
    /// Peak regenerative braking power, W.
    pub regen_power_max: f64,
    /// Fraction of braking energy recovered, 0..1.
    pub regen_efficiency: f64,
    /// Usable battery capacity, J.
    pub battery_capacity: f64,
    /// Top speed, m/s.
    pub v_max: f64,
    /// Steering lock, rad.
    pub max_steering: f64,
    /// Fresh-tire grip coefficient.
    pub mu_max: f64,
    /// Fully-worn grip coefficient.
    pub mu_min: f64,
    /// Peak braking deceleration, m/s².
    pub brake_decel_max: f64,
    /// Energy draw multiplier while attack mode is active.
    pub attack_energy_multiplier: f64,
    /// Attack mode duration per activation, s.
    pub attack_duration: f64,
    /// Attack mode activations available per race.
    pub attack_uses: u8,
    /// Floor speed used when converting power to force, m/s.
    pub min_force_speed: f64,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            air_density: 1.225,
            drag_coefficient: 0.32,
            downforce_coefficient: 1.8,
            frontal_area: 1.5,
            mass: 920.0,
            rolling_resistance: 0.015,
            wheelbase: 2.97,
            max_power: 350e3,
            attack_power_boost: 50e3,
            motor_efficiency: 0.97,
            regen_power_max: 600e3,
            regen_efficiency: 0.40,
            battery_capacity: 51.0 * 3.6e6,
            v_max: 322.0 / 3.6,
            max_steering: 0.52,
            mu_max: 1.2,
            mu_min: 0.9,
            brake_decel_max: 5.5,
            attack_energy_multiplier: 1.3,
            attack_duration: 240.0,
            attack_uses: 2,
            min_force_speed: 1.0,
        }
    }
}

/// Tire and battery thermal model coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalParams {
    /// Optimal tire operating temperature, °C.
    pub tire_opt_temp: f64,
    /// Friction-heating gain applied to the lateral/longitudinal load mix.
    pub tire_heating: f64,
    /// Convective cooling coefficient towards ambient, 1/s.
    pub tire_cooling: f64,
    /// Tire temperature ceiling, °C.
    pub tire_temp_max: f64,
    /// Optimal battery temperature, °C.
    pub batt_opt_temp: f64,
    /// Effective battery thermal mass, kg.
    pub batt_thermal_mass: f64,
    /// Battery heat capacity, J/(kg·K).
    pub batt_heat_capacity: f64,
    /// Active cooling coefficient above the optimum, 1/s.
    pub batt_active_cooling: f64,
    /// Passive cooling coefficient towards ambient, 1/s.
    pub batt_passive_cooling: f64,
    /// Battery temperature floor, °C.
    pub batt_temp_min: f64,
    /// Battery temperature ceiling, °C.
    pub batt_temp_max: f64,
}

impl Default for ThermalParams {
    fn default() -> Self {
        Self {
            tire_opt_temp: 90.0,
            tire_heating: 1.0,
            tire_cooling: 0.1,
            tire_temp_max: 130.0,
            batt_opt_temp: 40.0,
            batt_thermal_mass: 200.0,
            batt_heat_capacity: 850.0,
            batt_active_cooling: 0.8,
            batt_passive_cooling: 0.05,
            batt_temp_min: 20.0,
            batt_temp_max: 60.0,
        }
    }
}

/// Tire wear accumulation coefficients, per second.
///
/// An earlier calibration of this model shipped with coefficients three
/// orders of magnitude larger, wearing tires out in seconds; the defaults
/// below are the corrected race-length values. Both live here so a caller can
/// reproduce either behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TireWearParams {
    pub k_base: f64,
    /// Per degree of deviation from the optimal tire temperature.
    pub k_temp: f64,
    /// Per (m/s)².
    pub k_speed: f64,
    /// Per (m/s²)² of lateral load.
    pub k_lat: f64,
    /// Flat spike while braking near lock-up at speed.
    pub k_lock: f64,
}

impl Default for TireWearParams {
    fn default() -> Self {
        Self {
            k_base: 2.0e-6,
            k_temp: 5.0e-8,
            k_speed: 3.0e-8,
            k_lat: 4.0e-7,
            k_lock: 1.0e-5,
        }
    }
}

/// Driver-model gains and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerParams {
    /// How far ahead (seconds of travel) the driver reads the track.
    pub lookahead_time: f64,
    /// Speed-error deadband, m/s.
    pub deadband: f64,
    /// Speed error (m/s) mapping to full throttle.
    pub throttle_error_span: f64,
    /// Throttle multiplier while inside a curved segment.
    pub corner_throttle_scale: f64,
    /// Speed error mapping to full brake inside corners.
    pub corner_brake_span: f64,
    /// Speed error mapping to full brake on straights.
    pub straight_brake_span: f64,
    /// Corner overspeed (m/s) that triggers a full panic brake.
    pub panic_brake_overspeed: f64,
    /// Throttle held when speed error sits inside the deadband.
    pub maintenance_throttle: f64,
    /// Gap (s) below which a non-leader is considered chasing.
    pub chase_gap: f64,
    /// Target-speed bonus applied while chasing.
    pub chase_bonus: f64,
    /// Gap (s) above which a leader cruises.
    pub lead_gap: f64,
    /// Target-speed derate applied while cruising in the lead.
    pub lead_derate: f64,
    /// Battery percentage below which hard conservation kicks in.
    pub low_energy_pct: f64,
    /// Battery percentage below which mild conservation kicks in.
    pub mid_energy_pct: f64,
    /// Tire wear fraction above which the driver protects the tires.
    pub worn_tire_threshold: f64,
    /// Target-speed derate per unit of rain intensity.
    pub rain_derate: f64,
    /// Minimum battery percentage to arm attack mode.
    pub attack_min_energy_pct: f64,
    /// Gap (s) counting as a close battle for attack-mode strategy.
    pub attack_close_gap: f64,
    /// Per-tick probability of requesting attack mode once conditions hold.
    pub attack_request_probability: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            lookahead_time: 2.0,
            deadband: 1.0,
            throttle_error_span: 15.0,
            corner_throttle_scale: 0.5,
            corner_brake_span: 30.0,
            straight_brake_span: 50.0,
            panic_brake_overspeed: 20.0,
            maintenance_throttle: 0.3,
            chase_gap: 1.5,
            chase_bonus: 0.05,
            lead_gap: 5.0,
            lead_derate: 0.05,
            low_energy_pct: 15.0,
            mid_energy_pct: 30.0,
            worn_tire_threshold: 0.7,
            rain_derate: 0.2,
            attack_min_energy_pct: 40.0,
            attack_close_gap: 2.0,
            attack_request_probability: 0.05,
        }
    }
}

/// Standard deviations of the stochastic layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseParams {
    /// Throttle/brake execution jitter (scaled by driver inconsistency).
    pub control_std: f64,
    /// Steering execution jitter (scaled by driver inconsistency).
    pub steering_std: f64,
    /// Process noise on longitudinal velocity, m/s per √s.
    pub vx_std: f64,
    /// Process noise on lateral velocity, m/s per √s.
    pub vy_std: f64,
    /// Position drift, m per √s.
    pub position_std: f64,
    /// Longitudinal acceleration noise, m/s² per √s.
    pub accel_std: f64,
    /// Tire temperature fluctuation, °C per √s.
    pub tire_temp_std: f64,
    /// Battery temperature fluctuation, °C per √s.
    pub batt_temp_std: f64,
    /// Tire wear noise as a fraction of the deterministic increment.
    pub tire_wear_frac: f64,
    /// Baseline energy-draw noise fraction.
    pub energy_base_frac: f64,
    /// Additional energy-noise fraction per °C off the battery optimum.
    pub energy_temp_frac: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            control_std: 0.02,
            steering_std: 0.005,
            vx_std: 0.15,
            vy_std: 0.075,
            position_std: 0.05,
            accel_std: 0.08,
            tire_temp_std: 0.5,
            batt_temp_std: 0.3,
            tire_wear_frac: 0.15,
            energy_base_frac: 0.02,
            energy_temp_frac: 0.001,
        }
    }
}

/// Coefficients of the probabilistic event models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventParams {
    /// Gap (m) within which an overtake attempt is evaluated.
    pub overtake_proximity: f64,
    /// Per-tick scaling of the logistic overtake probability.
    pub overtake_scale: f64,
    /// Logit weight on the speed differential.
    pub z_speed: f64,
    /// Logit weight on the battery-percentage differential.
    pub z_energy: f64,
    /// Logit bonus when the attacker is in attack mode.
    pub z_attack_attacker: f64,
    /// Logit penalty when the defender is in attack mode.
    pub z_attack_defender: f64,
    /// Logit weight on the tire wear differential.
    pub z_tire: f64,
    /// Segment logit offsets.
    pub k_straight: f64,
    pub k_corner: f64,
    pub k_chicane: f64,
    /// Baseline crash probability per tick.
    pub crash_base_probability: f64,
    /// Multiplier applied to the combined risk factor.
    pub crash_risk_scale: f64,
    /// Radius (m) used for the crash proximity term.
    pub crash_proximity_radius: f64,
    /// Safety-car deployments per leader lap under a green track.
    pub safety_car_rate: f64,
    /// Rate boost per crash in the last two laps.
    pub safety_car_crash_boost: f64,
    /// Nominal lap time (s) converting the per-lap rate into a hazard.
    pub nominal_lap_time: f64,
    /// Safety-car window length, s.
    pub safety_car_duration: f64,
    /// Enforced speed while the safety car is out, m/s.
    pub safety_car_speed: f64,
    /// Laps that must pass after a deployment before the next one.
    pub safety_car_min_gap_laps: u32,
    /// Earliest leader lap on which a deployment may fire.
    pub safety_car_earliest_lap: u32,
}

impl Default for EventParams {
    fn default() -> Self {
        Self {
            overtake_proximity: 10.0,
            overtake_scale: 0.1,
            z_speed: 0.5,
            z_energy: 0.02,
            z_attack_attacker: 0.3,
            z_attack_defender: 0.2,
            z_tire: 0.4,
            k_straight: 0.8,
            k_corner: 0.3,
            k_chicane: 0.5,
            crash_base_probability: 1e-7,
            crash_risk_scale: 50.0,
            crash_proximity_radius: 20.0,
            safety_car_rate: 0.1,
            safety_car_crash_boost: 0.5,
            nominal_lap_time: 90.0,
            safety_car_duration: 180.0,
            safety_car_speed: 80.0 / 3.6,
            safety_car_min_gap_laps: 5,
            safety_car_earliest_lap: 2,
        }
    }
}

/// How overspeed through a corner is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CornerCap {
    /// Clamp speed to the corner limit outright. Stable, and rarely binding
    /// because the lookahead controller brakes early.
    #[default]
    Hard,
    /// Pull speed towards the limit at the car's peak braking rate.
    Soft,
}

/// Mechanical-failure hazard model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum FailureModel {
    /// Failures disabled.
    #[default]
    None,
    /// Weibull wear-out hazard over stress-scaled race time.
    Weibull { shape: f64, scale: f64 },
}

impl FailureModel {
    /// Standard wear-out calibration (k = 2.5, λ = 5000 s).
    #[must_use]
    pub const fn weibull_default() -> Self {
        Self::Weibull {
            shape: 2.5,
            scale: 5000.0,
        }
    }
}

/// Full kernel configuration. One record, one validation pass, no hidden
/// state anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub physics: PhysicsParams,
    pub thermal: ThermalParams,
    pub tire_wear: TireWearParams,
    pub controller: ControllerParams,
    pub noise: NoiseParams,
    pub events: EventParams,
    pub corner_cap: CornerCap,
    pub failure_model: FailureModel,
    /// Integration step, s.
    pub dt: f64,
    /// Race length in laps of the leader.
    pub num_laps: u32,
    /// Master seed for every stochastic draw in the run.
    pub seed: u64,
    /// Fail-safe tick budget; `None` disables it.
    pub max_ticks: Option<u64>,
    /// Whether the safety-car model runs at all.
    pub safety_car_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            physics: PhysicsParams::default(),
            thermal: ThermalParams::default(),
            tire_wear: TireWearParams::default(),
            controller: ControllerParams::default(),
            noise: NoiseParams::default(),
            events: EventParams::default(),
            corner_cap: CornerCap::default(),
            failure_model: FailureModel::default(),
            dt: 0.01,
            num_laps: 10,
            seed: 42,
            max_ticks: Some(20_000_000),
            safety_car_enabled: true,
        }
    }
}

impl Config {
    /// Rejects out-of-range parameters before any tick can run.
    pub fn validate(&self) -> Result<(), SimError> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(SimError::InvalidConfig("dt must be positive and finite"));
        }
        let p = &self.physics;
        if p.mass <= 0.0 || p.frontal_area <= 0.0 || p.wheelbase <= 0.0 {
            return Err(SimError::InvalidConfig(
                "mass, frontal_area, and wheelbase must be positive",
            ));
        }
        if p.mu_max < p.mu_min || p.mu_min <= 0.0 {
            return Err(SimError::InvalidConfig(
                "grip range requires 0 < mu_min <= mu_max",
            ));
        }
        if !(0.0..=1.0).contains(&p.motor_efficiency)
            || !(0.0..=1.0).contains(&p.regen_efficiency)
        {
            return Err(SimError::InvalidConfig(
                "motor and regen efficiencies must lie in 0..=1",
            ));
        }
        if p.battery_capacity <= 0.0 || p.v_max <= 0.0 || p.max_power < 0.0 {
            return Err(SimError::InvalidConfig(
                "battery capacity, v_max, and max_power must be positive",
            ));
        }
        if p.min_force_speed <= 0.0 {
            return Err(SimError::InvalidConfig("min_force_speed must be positive"));
        }
        let n = &self.noise;
        for std in [
            n.control_std,
            n.steering_std,
            n.vx_std,
            n.vy_std,
            n.position_std,
            n.accel_std,
            n.tire_temp_std,
            n.batt_temp_std,
            n.tire_wear_frac,
            n.energy_base_frac,
            n.energy_temp_frac,
        ] {
            if std < 0.0 || !std.is_finite() {
                return Err(SimError::InvalidConfig(
                    "noise standard deviations must be non-negative and finite",
                ));
            }
        }
        let w = &self.tire_wear;
        if w.k_base < 0.0 || w.k_temp < 0.0 || w.k_speed < 0.0 || w.k_lat < 0.0 || w.k_lock < 0.0
        {
            return Err(SimError::InvalidConfig(
                "tire wear coefficients must be non-negative",
            ));
        }
        let e = &self.events;
        if e.crash_base_probability < 0.0
            || e.overtake_scale < 0.0
            || e.safety_car_rate < 0.0
            || e.nominal_lap_time <= 0.0
            || e.safety_car_duration <= 0.0
            || e.safety_car_speed <= 0.0
        {
            return Err(SimError::InvalidConfig(
                "event coefficients must be non-negative with positive timings",
            ));
        }
        let c = &self.controller;
        if c.lookahead_time < 0.0
            || c.deadband < 0.0
            || c.throttle_error_span <= 0.0
            || c.corner_brake_span <= 0.0
            || c.straight_brake_span <= 0.0
        {
            return Err(SimError::InvalidConfig(
                "controller spans must be positive and thresholds non-negative",
            ));
        }
        if let FailureModel::Weibull { shape, scale } = self.failure_model {
            if shape <= 0.0 || scale <= 0.0 {
                return Err(SimError::InvalidConfig(
                    "Weibull failure model needs positive shape and scale",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_dt_and_grip_range() {
        let mut config = Config::default();
        config.dt = 0.0;
        assert_eq!(
            config.validate(),
            Err(SimError::InvalidConfig("dt must be positive and finite"))
        );

        let mut config = Config::default();
        config.physics.mu_max = 0.5;
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_negative_noise_std() {
        let mut config = Config::default();
        config.noise.vx_std = -0.1;
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_degenerate_weibull() {
        let mut config = Config::default();
        config.failure_model = FailureModel::Weibull {
            shape: 0.0,
            scale: 5000.0,
        };
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn calibrated_defaults_match_the_gen3_car() {
        let p = PhysicsParams::default();
        assert!((p.battery_capacity - 183.6e6).abs() < 1.0);
        assert!((p.v_max - 89.44).abs() < 0.01);
        assert_eq!(p.attack_uses, 2);
        assert!((TireWearParams::default().k_base - 2.0e-6).abs() < 1e-18);
    }
}
