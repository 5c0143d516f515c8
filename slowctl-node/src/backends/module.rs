//! # Simulated Target Modules
//!
//! Temperature, supply voltage and current of a chain of camera target modules.
use slowctl_control::{DeviceBackend, error::BackendError};
use slowctl_protocol::{CommandRecord, DeviceSettings, Readings};

pub const DEFAULT_MODULES: usize = 4;

const AMBIENT: f64 = 21.0;

#[derive(Debug)]
pub struct SimulatedModules {
    voltage: Vec<f64>,
}

impl SimulatedModules {
    pub fn new(modules: usize) -> SimulatedModules {
        SimulatedModules {
            voltage: vec![3.3; modules],
        }
    }

    fn selected(&self, command: &CommandRecord) -> Result<Vec<usize>, BackendError> {
        if command.int_args.is_empty() {
            return Ok((0..self.voltage.len()).collect());
        }
        command
            .int_args
            .iter()
            .map(|&index| {
                let index = index as usize;
                if index < self.voltage.len() {
                    Ok(index)
                } else {
                    Err(BackendError::InvalidArguments {
                        command: command.name.clone(),
                        reason: format!("there is no module {index}"),
                    })
                }
            })
            .collect()
    }
}

impl Default for SimulatedModules {
    fn default() -> Self {
        SimulatedModules::new(DEFAULT_MODULES)
    }
}

impl DeviceBackend for SimulatedModules {
    /// Every command takes optional `INT` module indices; none selects all modules.
    fn execute(&mut self, command: &CommandRecord) -> Result<Readings, BackendError> {
        let modules = self.selected(command)?;
        let readings = match command.name.as_str() {
            "read_temperature" => Readings::default()
                .with_channel(
                    "temperature",
                    modules
                        .iter()
                        .map(|&m| AMBIENT + 2.0 * self.voltage[m] + 0.1 * m as f64)
                        .collect(),
                )
                .with_settings(
                    "temperature",
                    DeviceSettings {
                        desired: 28.0,
                        min: 15.0,
                        max: 35.0,
                        critical_min: 5.0,
                        critical_max: 45.0,
                    },
                ),
            "read_voltage" => Readings::default().with_channel(
                "voltage",
                modules.iter().map(|&m| self.voltage[m]).collect(),
            ),
            "read_current" => Readings::default().with_channel(
                "current",
                modules.iter().map(|&m| self.voltage[m] / 4.7).collect(),
            ),
            "set_voltage" => {
                let &[volts] = command.float_args.as_slice() else {
                    return Err(BackendError::InvalidArguments {
                        command: command.name.clone(),
                        reason: "expected one FLT voltage".to_string(),
                    });
                };
                for &m in &modules {
                    self.voltage[m] = f64::from(volts);
                }
                Readings::default().with_channel("voltage", vec![f64::from(volts); modules.len()])
            }
            other => return Err(BackendError::Unsupported(other.to_string())),
        };
        Ok(readings)
    }
}
