//! Machine power consumption and energy accounting.

use crate::common::{PerformanceLevel, PowerState, Time};

/// Linear power model.
///
/// An active machine consumes `idle_power + load * (max_power - idle_power)` watts, with the dynamic part scaled down
/// by the performance level of its cores. Sleeping machines consume a fraction of the idle power, powered off
/// machines consume nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPowerModel {
    idle_power: f64,
    max_power: f64,
}

impl LinearPowerModel {
    pub fn new(idle_power: f64, max_power: f64) -> Self {
        Self { idle_power, max_power }
    }

    /// Returns the power consumption in watts.
    ///
    /// - `state` - machine power state.
    /// - `level` - performance level of the machine cores.
    /// - `cpu_load` - ratio of busy cores, clamped to `[0, 1]`.
    pub fn get_power(&self, state: PowerState, level: PerformanceLevel, cpu_load: f64) -> f64 {
        let standby_factor = match state {
            PowerState::S0 => {
                let factor = self.max_power - self.idle_power;
                return self.idle_power + cpu_load.clamp(0., 1.) * factor * frequency_factor(level);
            }
            PowerState::S0i1 => 0.5,
            PowerState::S1 => 0.2,
            PowerState::S2 | PowerState::S3 | PowerState::S4 => 0.1,
            PowerState::S5 => 0.,
        };
        self.idle_power * standby_factor
    }
}

/// Share of the dynamic power consumed at the performance level.
fn frequency_factor(level: PerformanceLevel) -> f64 {
    match level {
        PerformanceLevel::P0 => 1.,
        PerformanceLevel::P1 => 0.8,
        PerformanceLevel::P2 => 0.6,
        PerformanceLevel::P3 => 0.45,
    }
}

/// Integrates power consumption over time.
#[derive(Debug, Clone, Default)]
pub struct EnergyMeter {
    energy_consumed: f64,
    current_power: f64,
    prev_time: Time,
}

impl EnergyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked each time the power consumption changes, accounts the energy consumed since the previous update.
    pub fn update(&mut self, time: Time, power: f64) {
        if time > self.prev_time {
            self.energy_consumed += (time - self.prev_time) * self.current_power;
            self.prev_time = time;
        }
        self.current_power = power;
    }

    /// Returns the consumed energy in joules.
    pub fn energy_consumed(&self) -> f64 {
        self.energy_consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_by_state() {
        let model = LinearPowerModel::new(100., 200.);
        assert_eq!(model.get_power(PowerState::S0, PerformanceLevel::P0, 0.), 100.);
        assert_eq!(model.get_power(PowerState::S0, PerformanceLevel::P0, 0.5), 150.);
        assert_eq!(model.get_power(PowerState::S0, PerformanceLevel::P0, 3.), 200.);
        assert_eq!(model.get_power(PowerState::S1, PerformanceLevel::P0, 0.), 20.);
        assert_eq!(model.get_power(PowerState::S5, PerformanceLevel::P0, 1.), 0.);
        assert!(model.get_power(PowerState::S0, PerformanceLevel::P3, 1.) < 200.);
    }

    #[test]
    fn test_energy_meter() {
        let mut meter = EnergyMeter::new();
        meter.update(0., 100.);
        meter.update(10., 50.);
        meter.update(20., 0.);
        assert_eq!(meter.energy_consumed(), 1500.);
    }
}
