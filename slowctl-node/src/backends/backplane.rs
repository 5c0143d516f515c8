//! # Simulated Backplane
//!
//! Stands in for the housekeeping FPGA behind the backplane's SPI bus. Every command
//! answers with plausible values for the 32 front-end electronics modules (FEEs) together
//! with the SPI command/data words a real exchange would have produced.
//!
//! | Command | Arguments | Channels |
//! |---|---|---|
//! | `read_voltages` | | `voltage` |
//! | `read_currents` | | `current` |
//! | `read_present` | | `present` |
//! | `set_trigger_mask` | `INT fee INT mask` pairs | `trigger_mask` |
//! | `power_control_modules` | `INT fee INT on` pairs | `powered` |
//! | `enable_disable_trigger` | `INT on` | |
//! | `set_holdoff_time` | `INT ticks` | |
//! | `set_trigger`, `set_tack_type_and_mode` | any `INT`s | |
//! | `read_nstimer_trigger_rate` | | `trigger_rate` |
//! | `reset_trigger_and_nstimer` | | |
//! | `sync` | | |
use slowctl_control::{DeviceBackend, error::BackendError};
use slowctl_protocol::{CommandRecord, DeviceSettings, Readings, SpiTransfer};

/// Number of front-end modules on the backplane.
pub const N_FEES: usize = 32;
/// Words in one SPI message.
pub const SPI_WORDS: usize = 11;

const NOMINAL_VOLTAGE: f64 = 12.0;
const NOMINAL_CURRENT: f64 = 0.8;

#[derive(Debug)]
pub struct SimulatedBackplane {
    present: [bool; N_FEES],
    powered: [bool; N_FEES],
    trigger_mask: [u16; N_FEES],
    trigger_enabled: bool,
    holdoff_time: u16,
    triggers: u32,
}

impl Default for SimulatedBackplane {
    fn default() -> Self {
        SimulatedBackplane {
            present: [true; N_FEES],
            powered: [true; N_FEES],
            trigger_mask: [0; N_FEES],
            trigger_enabled: false,
            holdoff_time: 0,
            triggers: 0,
        }
    }
}

impl SimulatedBackplane {
    pub fn new() -> SimulatedBackplane {
        SimulatedBackplane::default()
    }

    /// Simulates `messages` SPI exchanges for command code `code`, carrying `words` as data.
    fn spi(code: u16, messages: usize, words: &[u16]) -> Vec<SpiTransfer> {
        (0..messages * SPI_WORDS)
            .map(|i| SpiTransfer {
                command: (code << 8) | i as u16,
                data: words.get(i).copied().unwrap_or(0),
            })
            .collect()
    }

    fn per_fee(&self, value: impl Fn(usize) -> f64) -> Vec<f64> {
        (0..N_FEES)
            .map(|fee| if self.powered[fee] { value(fee) } else { 0.0 })
            .collect()
    }

    fn execute_named(&mut self, command: &CommandRecord) -> Result<Readings, BackendError> {
        let words = words(command)?;
        let readings = match command.name.as_str() {
            "read_voltages" => Readings {
                spi: Self::spi(1, 4, &[]),
                ..Default::default()
            }
            .with_channel(
                "voltage",
                self.per_fee(|fee| NOMINAL_VOLTAGE + 0.01 * (fee % 5) as f64),
            )
            .with_settings(
                "voltage",
                DeviceSettings {
                    desired: NOMINAL_VOLTAGE,
                    min: 11.5,
                    max: 12.5,
                    critical_min: 11.0,
                    critical_max: 13.0,
                },
            ),
            "read_currents" => Readings {
                spi: Self::spi(2, 4, &[]),
                ..Default::default()
            }
            .with_channel(
                "current",
                self.per_fee(|fee| NOMINAL_CURRENT + 0.002 * (fee % 7) as f64),
            ),
            "read_present" => Readings {
                spi: Self::spi(3, 1, &[]),
                ..Default::default()
            }
            .with_channel("present", flags(&self.present)),
            "reset_trigger_and_nstimer" => {
                self.triggers = 0;
                Readings {
                    spi: Self::spi(4, 1, &[]),
                    ..Default::default()
                }
            }
            "set_trigger" => Readings {
                spi: Self::spi(5, 1, &words),
                ..Default::default()
            },
            "read_nstimer_trigger_rate" => {
                let rate = if self.trigger_enabled {
                    self.triggers = self.triggers.wrapping_add(1);
                    1000.0 / f64::from(self.holdoff_time.max(1))
                } else {
                    0.0
                };
                Readings {
                    spi: Self::spi(6, 1, &[]),
                    ..Default::default()
                }
                .with_channel("trigger_rate", vec![rate])
            }
            "enable_disable_trigger" => {
                let [on] = expect_args::<1>(command, &words)?;
                self.trigger_enabled = on != 0;
                Readings {
                    spi: Self::spi(7, 1, &words),
                    ..Default::default()
                }
            }
            "set_holdoff_time" => {
                let [ticks] = expect_args::<1>(command, &words)?;
                self.holdoff_time = ticks;
                Readings {
                    spi: Self::spi(8, 1, &words),
                    ..Default::default()
                }
            }
            "set_tack_type_and_mode" => Readings {
                spi: Self::spi(9, 1, &words),
                ..Default::default()
            },
            "power_control_modules" => {
                for (fee, on) in fee_pairs(command, &words)? {
                    self.powered[fee] = on != 0;
                }
                Readings {
                    spi: Self::spi(10, 1, &words),
                    ..Default::default()
                }
                .with_channel("powered", flags(&self.powered))
            }
            "sync" => Readings {
                spi: Self::spi(11, 4, &[]),
                ..Default::default()
            },
            "set_trigger_mask" => {
                for (fee, mask) in fee_pairs(command, &words)? {
                    self.trigger_mask[fee] = mask;
                }
                Readings {
                    spi: Self::spi(12, 4, &self.trigger_mask),
                    ..Default::default()
                }
                .with_channel(
                    "trigger_mask",
                    self.trigger_mask.iter().map(|&m| f64::from(m)).collect(),
                )
            }
            other => return Err(BackendError::Unsupported(other.to_string())),
        };
        Ok(readings)
    }
}

impl DeviceBackend for SimulatedBackplane {
    fn execute(&mut self, command: &CommandRecord) -> Result<Readings, BackendError> {
        self.execute_named(command)
    }
}

fn flags(values: &[bool]) -> Vec<f64> {
    values.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect()
}

/// Integer arguments as 16 bit SPI data words.
fn words(command: &CommandRecord) -> Result<Vec<u16>, BackendError> {
    command
        .int_args
        .iter()
        .map(|&value| {
            u16::try_from(value).map_err(|_| BackendError::InvalidArguments {
                command: command.name.clone(),
                reason: format!("{value} does not fit in an SPI word"),
            })
        })
        .collect()
}

fn expect_args<const N: usize>(
    command: &CommandRecord,
    words: &[u16],
) -> Result<[u16; N], BackendError> {
    <[u16; N]>::try_from(words).map_err(|_| BackendError::InvalidArguments {
        command: command.name.clone(),
        reason: format!("expected {N} integer arguments, got {}", words.len()),
    })
}

/// `(fee, value)` pairs with the FEE index checked.
fn fee_pairs(command: &CommandRecord, words: &[u16]) -> Result<Vec<(usize, u16)>, BackendError> {
    let invalid = |reason: String| BackendError::InvalidArguments {
        command: command.name.clone(),
        reason,
    };
    if words.len() % 2 != 0 {
        return Err(invalid("expected FEE/value pairs".to_string()));
    }
    words
        .chunks_exact(2)
        .map(|pair| {
            let fee = usize::from(pair[0]);
            if fee < N_FEES {
                Ok((fee, pair[1]))
            } else {
                Err(invalid(format!("there is no FEE {fee}")))
            }
        })
        .collect()
}
