//! Physics of the simulated pool: how fast the water warms while the
//! heater runs and how fast it bleeds heat back to the air when it
//! doesn't.

use tracing::warn;

use crate::config::ThermalParams;

pub struct ThermalModel {
    params: ThermalParams,
}

impl ThermalModel {
    pub fn new(params: ThermalParams) -> ThermalModel {
        ThermalModel { params }
    }

    /// Temperature of the water leaving the heater. The heater only
    /// transfers heat when both it and the pump are on; the output is
    /// intake plus the heater delta, capped at the fixture's safe
    /// output limit.
    pub fn heater_output_temp(
        &self,
        intake: f64,
        heater_on: bool,
        pump_on: bool,
    ) -> f64 {
        if !heater_on || !pump_on {
            return intake;
        }

        let heated = intake + self.params.heater_delta;

        if heated > self.params.max_heater_output_temp {
            warn!(
                "heater output capped at {}C (would be {:.1}C)",
                self.params.max_heater_output_temp, heated
            );
            self.params.max_heater_output_temp
        } else {
            heated
        }
    }

    /// Change in pool temperature over `elapsed_secs`. Heating wins
    /// when both devices run; otherwise the pool cools toward ambient
    /// and never below it.
    pub fn pool_temp_change(
        &self,
        pool: f64,
        ambient: f64,
        heater_on: bool,
        pump_on: bool,
        elapsed_secs: f64,
    ) -> f64 {
        let elapsed_hours = elapsed_secs / 3600.0;

        if heater_on && pump_on {
            return self.params.pool_heating_rate_per_hour * elapsed_hours;
        }

        if pool > ambient {
            let change =
                -self.params.pool_heat_loss_rate_per_hour * elapsed_hours;

            // Clamp at ambient: the pool can't radiate itself colder
            // than the air.

            return change.max(ambient - pool);
        }

        0.0
    }
}
