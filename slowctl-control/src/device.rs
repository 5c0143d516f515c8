use slowctl_net::TransportContext;
use slowctl_protocol::{CommandRecord, Readings, Role, Telemetry};

use crate::error::BackendError;

/// Hardware access of a device node.
///
/// Implementors execute one command and report what they read back. Commands are
/// identified by name; the argument lists follow the command's definition.
pub trait DeviceBackend {
    fn execute(&mut self, command: &CommandRecord) -> Result<Readings, BackendError>;
}

impl<B: DeviceBackend + ?Sized> DeviceBackend for Box<B> {
    fn execute(&mut self, command: &CommandRecord) -> Result<Readings, BackendError> {
        (**self).execute(command)
    }
}

/// Loop of a control or module node: executes what the coordinator sends and echoes every
/// command back together with its readings.
pub struct DeviceNode<B: DeviceBackend> {
    transport: TransportContext,
    backend: B,
    outgoing: Vec<Vec<u8>>,
    poll_timeout_ms: i32,
}

impl<B: DeviceBackend> DeviceNode<B> {
    pub fn new(transport: TransportContext, backend: B) -> DeviceNode<B> {
        DeviceNode {
            transport,
            backend,
            outgoing: Vec::new(),
            poll_timeout_ms: 100,
        }
    }

    pub fn poll_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn role(&self) -> Role {
        self.transport.role()
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs one iteration. Returns false if the coordinator link was down.
    pub fn step(&mut self) -> bool {
        let outgoing = self.outgoing.drain(..).map(|p| (Role::Coordinator, p));
        let tick = self.transport.tick(outgoing, self.poll_timeout_ms);
        for inbound in tick.incoming {
            self.handle(&inbound.payload);
        }
        tick.ok
    }

    pub fn run(&mut self) -> ! {
        log::info!("{} node running", self.role());
        loop {
            self.step();
        }
    }

    fn handle(&mut self, payload: &[u8]) {
        let command = match CommandRecord::from_bytes(payload) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Discarding undecodable command: {}", e);
                return;
            }
        };
        let role = self.role();
        if command.device != role {
            log::warn!(
                "Rejecting {} addressed to the {} node",
                command.name,
                command.device
            );
            return;
        }
        log::debug!("Executing {}", command.name);
        let readings = self.backend.execute(&command).unwrap_or_else(|e| {
            log::error!("{} failed: {}", command.name, e);
            Readings::default()
        });
        let telemetry = Telemetry {
            source: role,
            command,
            readings,
        };
        match telemetry.to_bytes() {
            Ok(payload) => self.outgoing.push(payload),
            Err(e) => log::error!("Dropping telemetry of {}: {}", telemetry.command.name, e),
        }
    }
}
