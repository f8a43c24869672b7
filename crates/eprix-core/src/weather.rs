//! Read-only weather view supplied by an external forecaster.

use serde::{Deserialize, Serialize};

/// Atmospheric and surface conditions consumed once per tick.
///
/// The kernel never evolves this record; a collaborator swaps in a new one
/// through [`crate::Simulation::set_weather`] and the change takes effect on
/// the next tick. `grip_multiplier` composes multiplicatively with per-segment
/// surface grip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherView {
    /// Ambient air temperature, °C.
    pub temperature: f64,
    /// Relative humidity, 0..1.
    pub humidity: f64,
    /// 0 dry .. 1 heavy rain.
    pub rain_intensity: f64,
    /// Wind speed, m/s.
    pub wind_speed: f64,
    /// Wind direction, radians.
    pub wind_dir: f64,
    /// Standing-water fraction on the racing line, 0..1.
    pub track_wetness: f64,
    /// Surface grip multiplier relative to dry baseline.
    pub grip_multiplier: f64,
}

impl Default for WeatherView {
    fn default() -> Self {
        Self {
            temperature: 25.0,
            humidity: 0.5,
            rain_intensity: 0.0,
            wind_speed: 0.0,
            wind_dir: 0.0,
            track_wetness: 0.0,
            grip_multiplier: 1.0,
        }
    }
}

impl WeatherView {
    /// A flat dry baseline at the given ambient temperature.
    #[must_use]
    pub fn dry(temperature: f64) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}
