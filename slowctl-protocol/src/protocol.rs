use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};

/// The logical peer type a process plays in the slow control network.
///
/// Every process runs exactly one role. All roles except the [`Role::Coordinator`]
/// connect out to the coordinator, which relays payloads between them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Role {
    /// Manages the backplane (SPI-attached housekeeping FPGA).
    ControlNode,
    /// Relays commands and telemetry between all other roles.
    Coordinator,
    /// Operator interface issuing macro invocations and displaying telemetry.
    InterfaceNode,
    /// Manages the target modules.
    ModuleNode,
}

impl Role {
    /// Default port of the link between the coordinator and a control node.
    pub const CONTROL_PORT: u16 = 3141;
    /// Default port of the link between the coordinator and a module node.
    pub const MODULE_PORT: u16 = 2718;
    /// Default port of the link between the coordinator and an interface node.
    pub const INTERFACE_PORT: u16 = 5926;

    pub const ALL: [Role; 4] = [
        Role::ControlNode,
        Role::Coordinator,
        Role::InterfaceNode,
        Role::ModuleNode,
    ];

    /// Resolves the device code used in the command configuration file.
    ///
    /// Only roles that can be the target of an atomic command have a device code.
    pub fn from_device_code(code: &str) -> Option<Role> {
        match code {
            "PI" => Some(Role::ControlNode),
            "TM" => Some(Role::ModuleNode),
            "RC" => Some(Role::Coordinator),
            _ => None,
        }
    }

    /// The device code of this role, if it can be targeted by commands.
    pub fn device_code(&self) -> Option<&'static str> {
        match self {
            Role::ControlNode => Some("PI"),
            Role::ModuleNode => Some("TM"),
            Role::Coordinator => Some("RC"),
            Role::InterfaceNode => None,
        }
    }

    /// Roles that run on device controllers and answer commands with telemetry.
    pub fn is_device(&self) -> bool {
        matches!(self, Role::ControlNode | Role::ModuleNode)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::ControlNode => "control",
            Role::Coordinator => "coordinator",
            Role::InterfaceNode => "interface",
            Role::ModuleNode => "module",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Role::ControlNode),
            "coordinator" => Ok(Role::Coordinator),
            "interface" => Ok(Role::InterfaceNode),
            "module" => Ok(Role::ModuleNode),
            other => Role::from_device_code(other).ok_or_else(|| format!("unknown role {other}")),
        }
    }
}

/// Request from the interface to run a named macro.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MacroInvocation {
    pub name: String,
    /// Free-form parameter entered by the operator. Not interpreted by the coordinator.
    #[serde(default)]
    pub parameter: String,
}

impl MacroInvocation {
    pub fn new(name: impl Into<String>, parameter: impl Into<String>) -> MacroInvocation {
        MacroInvocation {
            name: name.into(),
            parameter: parameter.into(),
        }
    }
}

/// Wire form of an atomic command.
///
/// The coordinator sends this to the device named in `device`, which echoes it back
/// unchanged inside its [`Telemetry`] so the coordinator can release the command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    pub device: Role,
    pub priority: u8,
    #[serde(default)]
    pub int_args: Vec<u32>,
    #[serde(default)]
    pub float_args: Vec<f32>,
    #[serde(default)]
    pub string_args: Vec<String>,
}

/// A single SPI exchange with the housekeeping FPGA, kept for logging.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpiTransfer {
    pub command: u16,
    pub data: u16,
}

/// How a reading compares against the [`DeviceSettings`] of its channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Condition {
    Nominal,
    OutOfRange,
    Critical,
}

/// Operating window of one device channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub desired: f64,
    pub min: f64,
    pub max: f64,
    pub critical_min: f64,
    pub critical_max: f64,
}

impl DeviceSettings {
    pub fn check(&self, value: f64) -> Condition {
        if value < self.critical_min || value > self.critical_max {
            Condition::Critical
        } else if value < self.min || value > self.max {
            Condition::OutOfRange
        } else {
            Condition::Nominal
        }
    }
}

/// Values produced by a device while executing a command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    #[serde(default)]
    pub spi: Vec<SpiTransfer>,
    /// Named value series, e.g. `voltage` with one entry per front-end module.
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub settings: BTreeMap<String, DeviceSettings>,
}

impl Readings {
    pub fn with_channel(mut self, name: impl Into<String>, values: Vec<f64>) -> Readings {
        self.channels.insert(name.into(), values);
        self
    }

    pub fn with_settings(mut self, name: impl Into<String>, settings: DeviceSettings) -> Readings {
        self.settings.insert(name.into(), settings);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }
}

/// Report sent by a device after executing a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub source: Role,
    /// Echo of the command this report answers.
    pub command: CommandRecord,
    #[serde(default)]
    pub readings: Readings,
}

macro_rules! json_payload {
    ($($ty:ty),*) => {
        $(
            impl $ty {
                pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
                    Ok(serde_json::to_vec(self)?)
                }

                pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
                    Ok(serde_json::from_slice(data)?)
                }
            }
        )*
    };
}

json_payload!(MacroInvocation, CommandRecord, Telemetry);
