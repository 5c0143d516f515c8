use slowctl_net::{TransportContext, TransportError};
use slowctl_protocol::{MacroInvocation, Role, Telemetry};

/// Loop of the operator interface: sends macro invocations and collects the telemetry
/// the coordinator forwards.
pub struct InterfaceNode {
    transport: TransportContext,
    outgoing: Vec<Vec<u8>>,
    poll_timeout_ms: i32,
}

impl InterfaceNode {
    pub fn new(transport: TransportContext) -> InterfaceNode {
        InterfaceNode {
            transport,
            outgoing: Vec::new(),
            poll_timeout_ms: 100,
        }
    }

    pub fn poll_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    /// Queues `invocation` for the next step.
    pub fn invoke(&mut self, invocation: MacroInvocation) {
        log::info!("Invoking {}", invocation.name);
        match invocation.to_bytes() {
            Ok(payload) => self.outgoing.push(payload),
            Err(e) => log::error!("Could not invoke {}: {}", invocation.name, e),
        }
    }

    /// Runs one iteration, handing every decoded telemetry record to `on_telemetry`.
    ///
    /// Returns false if the coordinator link was down.
    pub fn step(&mut self, mut on_telemetry: impl FnMut(Telemetry)) -> bool {
        let outgoing = self.outgoing.drain(..).map(|p| (Role::Coordinator, p));
        let tick = self.transport.tick(outgoing, self.poll_timeout_ms);
        for inbound in tick.incoming {
            match Telemetry::from_bytes(&inbound.payload) {
                Ok(telemetry) => on_telemetry(telemetry),
                Err(e) => log::warn!("Discarding undecodable telemetry: {}", e),
            }
        }
        tick.ok
    }

    /// Closes the link to the coordinator.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        self.transport.shutdown()
    }
}
