//! # Slow Control Command Plane
//!
//! Everything above the transport: the command catalogue, the scheduler that decides when
//! a command may go out and the loops each role runs.
//!
//! ## Commands
//!
//! A [`Registry`] is loaded once at startup from a definition file. It holds
//! [`CommandDefinition`]s (what a device understands) and [`HighLevelCommand`]s (named
//! sequences of concrete [`LowLevelCommand`]s). A file that does not parse completely is
//! rejected as a whole.
//!
//! ## Scheduling
//!
//! The [`Scheduler`] owns a FIFO of pending commands and the set of commands waiting for
//! their echo. Every command carries a [`Priority`]:
//!
//! - [`Priority::Free`] never holds anything back.
//! - [`Priority::Device`] holds back later commands for the same device.
//! - [`Priority::Global`] holds back every later command.
//!
//! A held-back head of the queue is never overtaken.
//!
//! ## Loops
//!
//! - [`Coordinator`]: expands invocations from the interface, dispatches commands to the
//!   devices, releases them when their telemetry returns and forwards that telemetry to the
//!   interface. Telemetry is also handed to a [`TelemetrySink`].
//! - [`DeviceNode`]: executes commands through a [`DeviceBackend`] and echoes them back.
//! - [`InterfaceNode`]: sends invocations and collects forwarded telemetry.
//!
//! Each loop owns its transport and is driven by repeated calls to `step`, or `run` to loop
//! forever.
//!
//! ```no_run
//! use slowctl_control::{Coordinator, LogSink, Registry};
//! use slowctl_net::Builder;
//! use slowctl_protocol::Role;
//!
//! let registry = Registry::load("commands.config")?;
//! let mut transport = Builder::new(Role::Coordinator).build();
//! transport.establish()?;
//! Coordinator::new(transport, registry, LogSink).run();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod command;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod interface;
pub mod registry;
pub mod scheduler;
pub mod sink;

pub use command::{CommandDefinition, HighLevelCommand, LowLevelCommand, Priority};
pub use coordinator::Coordinator;
pub use device::{DeviceBackend, DeviceNode};
pub use interface::InterfaceNode;
pub use registry::Registry;
pub use scheduler::Scheduler;
pub use sink::{JsonLinesSink, LogSink, TelemetrySink};
