//! Shared fixtures for the multi-process tests: a loopback coordinator, clients wired to
//! it and a device backend that records what it executed.
use std::net::{IpAddr, Ipv4Addr};

use slowctl_control::{Coordinator, DeviceBackend, LogSink, Registry, error::BackendError};
use slowctl_net::{Builder, TransportContext};
use slowctl_protocol::{CommandRecord, Readings, Role};

pub const COMMANDS: &str = "\
BEGIN DEFINITIONS
PI read_voltage 1 0 0
PI set_voltage 1 1 0
TM read_temperature 0 0 0
RC mark 0 0 1
END DEFINITIONS

BEGIN SEQUENCE
poll_voltage
PI read_voltage INT 0
END SEQUENCE

BEGIN SEQUENCE
housekeeping
PI set_voltage CHK 1 INT 0 FLT 12
RC mark STR ramped
PI read_voltage INT 0
TM read_temperature
END SEQUENCE
";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A coordinator listening on ephemeral loopback ports.
pub fn coordinator(required: &[Role]) -> Coordinator<LogSink> {
    init_logging();
    let mut transport = Builder::new(Role::Coordinator)
        .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .control_port(0)
        .module_port(0)
        .interface_port(0)
        .required_peers(required.iter().copied())
        .build();
    transport.establish().expect("loopback listeners");
    let registry = Registry::parse(COMMANDS).expect("fixture commands");
    Coordinator::new(transport, registry, LogSink).poll_timeout_ms(5)
}

/// A transport for `role` connected to `coordinator`.
pub fn client(role: Role, coordinator: &TransportContext) -> TransportContext {
    let port = |peer| {
        coordinator
            .local_addr(peer)
            .map(|addr| addr.port())
            .expect("coordinator is listening")
    };
    let mut transport = Builder::new(role)
        .host("127.0.0.1")
        .control_port(port(Role::ControlNode))
        .module_port(port(Role::ModuleNode))
        .interface_port(port(Role::InterfaceNode))
        .build();
    transport.establish().expect("coordinator accepts");
    transport
}

/// Answers every command with the number of commands executed so far.
#[derive(Debug, Default)]
pub struct Recorder {
    pub executed: Vec<CommandRecord>,
}

impl DeviceBackend for Recorder {
    fn execute(&mut self, command: &CommandRecord) -> Result<Readings, BackendError> {
        self.executed.push(command.clone());
        Ok(Readings::default().with_channel("executed", vec![self.executed.len() as f64]))
    }
}
