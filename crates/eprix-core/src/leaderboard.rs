//! Standings and timing bookkeeping, computed as pure functions of the
//! current car field.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::state::{CarArena, CarId};

/// One classified row of the standings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub position: usize,
    pub car: CarId,
    pub driver: String,
    pub current_lap: u32,
    /// Time gap to the car one place ahead, s. Zero for the leader,
    /// infinite for retired cars.
    pub interval: f64,
    pub gap_to_leader: f64,
    pub last_lap_time: f64,
    pub best_lap_time: Option<f64>,
    pub battery_pct: f64,
    pub tire_wear: f64,
    pub attack_active: bool,
    pub attack_uses_left: u8,
    /// Current speed, m/s.
    pub speed: f64,
    pub overtakes_made: u32,
    pub overtakes_received: u32,
    pub energy_efficiency: f64,
    pub active: bool,
}

/// Fastest lap seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastestLap {
    pub car: CarId,
    pub driver: String,
    pub time: f64,
}

/// Immutable standings view suitable for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingsSnapshot {
    /// Running cars by race position, then retired cars by race progress.
    pub entries: Vec<StandingEntry>,
    pub fastest_lap: Option<FastestLap>,
}

impl StandingsSnapshot {
    /// Entry for `car`, if registered.
    #[must_use]
    pub fn entry(&self, car: CarId) -> Option<&StandingEntry> {
        self.entries.iter().find(|entry| entry.car == car)
    }

    /// Top `n` classified rows.
    #[must_use]
    pub fn top(&self, n: usize) -> &[StandingEntry] {
        &self.entries[..n.min(self.entries.len())]
    }
}

/// Builds the standings snapshot from the car field.
///
/// Running cars are ordered by their race position; retired cars are
/// classified behind them by how far they got. Intervals are time-based
/// estimates from the distance delta at each car's current speed.
#[must_use]
pub fn standings(arena: &CarArena, battery_capacity: f64) -> StandingsSnapshot {
    let mut order: Vec<usize> = (0..arena.len()).collect();
    order.sort_by_key(|&index| {
        let car = &arena.states()[index];
        if car.active {
            (0, car.position, OrderedFloat(0.0))
        } else {
            (
                1,
                0,
                OrderedFloat(-(f64::from(car.current_lap) * 1e9 + car.lap_distance)),
            )
        }
    });

    let leader = order
        .first()
        .map(|&index| &arena.states()[index])
        .filter(|car| car.active);
    let leader_distance = leader.map_or(0.0, |car| car.total_distance);

    let mut entries = Vec::with_capacity(order.len());
    let mut fastest: Option<FastestLap> = None;
    let mut ahead_distance = leader_distance;
    for (rank, &index) in order.iter().enumerate() {
        let car = &arena.states()[index];
        let profile = &arena.profiles()[index];
        let speed = car.speed().max(1.0);
        let (interval, gap_to_leader) = if rank == 0 {
            (0.0, 0.0)
        } else if car.active {
            (
                (ahead_distance - car.total_distance).max(0.0) / speed,
                (leader_distance - car.total_distance).max(0.0) / speed,
            )
        } else {
            (f64::INFINITY, f64::INFINITY)
        };
        if car.active {
            ahead_distance = car.total_distance;
        }

        if let Some(best) = car.best_lap_time {
            let better = fastest.as_ref().map_or(true, |f| best < f.time);
            if better {
                fastest = Some(FastestLap {
                    car: arena.handle_at(index),
                    driver: profile.name.clone(),
                    time: best,
                });
            }
        }

        entries.push(StandingEntry {
            position: if car.active { car.position } else { rank + 1 },
            car: arena.handle_at(index),
            driver: profile.name.clone(),
            current_lap: car.current_lap,
            interval,
            gap_to_leader,
            last_lap_time: car.last_lap_time,
            best_lap_time: car.best_lap_time,
            battery_pct: car.energy_pct(battery_capacity),
            tire_wear: car.tire_wear,
            attack_active: car.attack_active,
            attack_uses_left: car.attack_uses_left,
            speed: car.speed(),
            overtakes_made: car.overtakes_made,
            overtakes_received: car.overtakes_received,
            energy_efficiency: car.energy_efficiency(),
            active: car.active,
        });
    }

    StandingsSnapshot {
        entries,
        fastest_lap: fastest,
    }
}
