use std::fmt::{self, Display, Formatter};

use slowctl_protocol::{CommandRecord, Role};

use crate::error::InvalidPriority;

/// Scheduling class of an atomic command.
///
/// A command is held back while an earlier command of a conflicting class is still
/// waiting for its echo.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    /// Never blocks anything.
    #[default]
    Free,
    /// Blocks later commands for the same device.
    Device,
    /// Blocks every later command.
    Global,
}

impl Priority {
    pub fn level(self) -> u8 {
        match self {
            Priority::Free => 0,
            Priority::Device => 1,
            Priority::Global => 2,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Priority::Free),
            1 => Ok(Priority::Device),
            2 => Ok(Priority::Global),
            other => Err(InvalidPriority(other)),
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Signature of an atomic command a device understands.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CommandDefinition {
    pub name: String,
    pub device: Role,
    pub n_ints: usize,
    pub n_floats: usize,
    pub n_strings: usize,
}

impl CommandDefinition {
    pub fn new(
        device: Role,
        name: impl Into<String>,
        n_ints: usize,
        n_floats: usize,
        n_strings: usize,
    ) -> CommandDefinition {
        CommandDefinition {
            name: name.into(),
            device,
            n_ints,
            n_floats,
            n_strings,
        }
    }

    pub fn accepts(&self, device: Role, name: &str, arity: (usize, usize, usize)) -> bool {
        self.device == device
            && self.name == name
            && (self.n_ints, self.n_floats, self.n_strings) == arity
    }
}

/// An atomic command with concrete arguments.
///
/// Two commands are the same command when every field is equal. The scheduler relies on
/// this to match a device's echo to the command it releases.
#[derive(Clone, Debug, PartialEq)]
pub struct LowLevelCommand {
    pub definition: CommandDefinition,
    pub priority: Priority,
    pub int_args: Vec<u32>,
    pub float_args: Vec<f32>,
    pub string_args: Vec<String>,
}

impl LowLevelCommand {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn device(&self) -> Role {
        self.definition.device
    }

    /// Whether an active command `self` keeps `next` from being dispatched.
    pub fn blocks(&self, next: &LowLevelCommand) -> bool {
        match self.priority {
            Priority::Global => true,
            Priority::Device => self.device() == next.device(),
            Priority::Free => false,
        }
    }
}

impl Display for LowLevelCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let code = self.device().device_code().unwrap_or("??");
        write!(f, "{} {} CHK {}", code, self.name(), self.priority)?;
        for value in &self.int_args {
            write!(f, " INT {value}")?;
        }
        for value in &self.float_args {
            write!(f, " FLT {value}")?;
        }
        for value in &self.string_args {
            write!(f, " STR {value}")?;
        }
        Ok(())
    }
}

impl From<&LowLevelCommand> for CommandRecord {
    fn from(command: &LowLevelCommand) -> Self {
        CommandRecord {
            name: command.definition.name.clone(),
            device: command.definition.device,
            priority: command.priority.level(),
            int_args: command.int_args.clone(),
            float_args: command.float_args.clone(),
            string_args: command.string_args.clone(),
        }
    }
}

/// Rebuilds the command a device echoed. The definition follows from the argument counts.
impl TryFrom<CommandRecord> for LowLevelCommand {
    type Error = InvalidPriority;

    fn try_from(record: CommandRecord) -> Result<Self, Self::Error> {
        let priority = Priority::try_from(record.priority)?;
        let definition = CommandDefinition::new(
            record.device,
            record.name,
            record.int_args.len(),
            record.float_args.len(),
            record.string_args.len(),
        );
        Ok(LowLevelCommand {
            definition,
            priority,
            int_args: record.int_args,
            float_args: record.float_args,
            string_args: record.string_args,
        })
    }
}

/// A named, ordered sequence of atomic commands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HighLevelCommand {
    pub name: String,
    pub commands: Vec<LowLevelCommand>,
}
