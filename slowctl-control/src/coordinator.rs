use slowctl_net::{Inbound, TransportContext};
use slowctl_protocol::{CommandRecord, MacroInvocation, Role, Telemetry};

use crate::{
    command::LowLevelCommand, registry::Registry, scheduler::Scheduler, sink::TelemetrySink,
};

/// Poll timeout of one coordinator iteration.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 100;

/// The relay loop of the coordinator.
///
/// Each [`step`](Coordinator::step) ticks the transport once, turns interface invocations
/// into queued commands, releases commands whose telemetry came back, forwards that
/// telemetry to the interface and dispatches at most one new command.
pub struct Coordinator<S: TelemetrySink> {
    transport: TransportContext,
    registry: Registry,
    scheduler: Scheduler,
    sink: S,
    outgoing: Vec<(Role, Vec<u8>)>,
    poll_timeout_ms: i32,
}

impl<S: TelemetrySink> Coordinator<S> {
    pub fn new(transport: TransportContext, registry: Registry, sink: S) -> Coordinator<S> {
        Coordinator {
            transport,
            registry,
            scheduler: Scheduler::new(),
            sink,
            outgoing: Vec::new(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }

    pub fn poll_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut TransportContext {
        &mut self.transport
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs one iteration. Returns false if a mandatory link was down during the tick.
    pub fn step(&mut self) -> bool {
        let tick = self
            .transport
            .tick(self.outgoing.drain(..), self.poll_timeout_ms);
        for (role, payload) in tick.dropped {
            self.release_undelivered(role, &payload);
        }
        for inbound in tick.incoming {
            self.handle(inbound);
        }
        self.dispatch();
        tick.ok
    }

    /// Runs forever.
    pub fn run(&mut self) -> ! {
        log::info!("Coordinator running");
        loop {
            self.step();
        }
    }

    fn handle(&mut self, inbound: Inbound) {
        match inbound.role {
            Role::InterfaceNode => self.handle_invocation(&inbound.payload),
            role if role.is_device() => self.handle_telemetry(role, inbound.payload),
            role => log::warn!("Ignoring payload from a {} peer", role),
        }
    }

    /// A command the transport discarded will never be echoed, so it leaves the active set.
    fn release_undelivered(&mut self, role: Role, payload: &[u8]) {
        if !role.is_device() {
            return;
        }
        let command = CommandRecord::from_bytes(payload)
            .map_err(|e| e.to_string())
            .and_then(|record| LowLevelCommand::try_from(record).map_err(|e| e.to_string()));
        match command {
            Ok(command) => {
                log::error!("{} never reached the {} node, releasing it", command, role);
                self.scheduler.acknowledge(&command);
            }
            Err(e) => log::warn!("Discarded payload for the {} node: {}", role, e),
        }
    }

    fn handle_invocation(&mut self, payload: &[u8]) {
        let invocation = match MacroInvocation::from_bytes(payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                log::warn!("Discarding undecodable invocation from the interface: {}", e);
                return;
            }
        };
        log::info!("Operator invoked {}", invocation.name);
        match self.scheduler.enqueue_macro(&self.registry, &invocation.name) {
            Ok(count) => log::debug!("{} expands to {} commands", invocation.name, count),
            Err(e) => log::error!("{}", e),
        }
        if let Err(e) = self.sink.record_invocation(&invocation) {
            log::warn!("Could not persist invocation of {}: {}", invocation.name, e);
        }
    }

    fn handle_telemetry(&mut self, role: Role, payload: Vec<u8>) {
        let telemetry = match Telemetry::from_bytes(&payload) {
            Ok(telemetry) => telemetry,
            Err(e) => {
                log::warn!("Discarding undecodable telemetry from {}: {}", role, e);
                return;
            }
        };
        if telemetry.source != role {
            log::warn!(
                "Telemetry claims to come from {} but arrived on the {} link",
                telemetry.source,
                role
            );
        }
        match LowLevelCommand::try_from(telemetry.command.clone()) {
            Ok(echo) => {
                if !self.scheduler.acknowledge(&echo) {
                    log::warn!("Echo of {} matches no active command", echo);
                }
            }
            Err(e) => log::warn!("Echo of {} has an {}", telemetry.command.name, e),
        }

        self.outgoing.push((Role::InterfaceNode, payload));
        if let Err(e) = self.sink.record_telemetry(&telemetry) {
            log::warn!("Could not persist telemetry from {}: {}", role, e);
        }
    }

    fn dispatch(&mut self) {
        let Some(command) = self.scheduler.try_dispatch() else {
            return;
        };
        match command.device() {
            Role::Coordinator => {
                log::info!("Executing {} locally", command);
                self.scheduler.acknowledge(&command);
            }
            device => match CommandRecord::from(&command).to_bytes() {
                Ok(payload) => {
                    log::info!("Dispatching {} to the {} node", command, device);
                    self.outgoing.push((device, payload));
                }
                Err(e) => {
                    log::error!("Could not dispatch {}: {}", command, e);
                    self.scheduler.acknowledge(&command);
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        net::{IpAddr, Ipv4Addr, TcpStream},
        time::Duration,
    };

    use slowctl_net::Builder;
    use slowctl_protocol::{
        Readings,
        codec::{read_frame, write_frame},
    };

    use super::*;
    use crate::{command::Priority, error::SinkError, sink::LogSink};

    const COMMANDS: &str = "\
BEGIN DEFINITIONS
PI read_voltage 0 0 0
PI set_voltage 1 1 0
RC wait 0 1 0
END DEFINITIONS
BEGIN SEQUENCE
poll_voltage
PI read_voltage
END SEQUENCE
BEGIN SEQUENCE
ramp
PI set_voltage CHK 1 INT 0 FLT 12
RC wait FLT 1
PI read_voltage
END SEQUENCE
";

    #[derive(Default)]
    struct MemorySink {
        invocations: Vec<MacroInvocation>,
        telemetry: Vec<Telemetry>,
        fail: bool,
    }

    impl TelemetrySink for MemorySink {
        fn record_invocation(&mut self, invocation: &MacroInvocation) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.invocations.push(invocation.clone());
            Ok(())
        }

        fn record_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.telemetry.push(telemetry.clone());
            Ok(())
        }
    }

    struct Peers {
        pi: TcpStream,
        gui: TcpStream,
    }

    fn coordinator(sink: MemorySink) -> (Coordinator<MemorySink>, Peers) {
        let mut transport = Builder::new(Role::Coordinator)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .control_port(0)
            .module_port(0)
            .interface_port(0)
            .build();
        transport.establish().unwrap();
        let connect = |role| {
            let stream = TcpStream::connect(transport.local_addr(role).unwrap()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        };
        let peers = Peers {
            pi: connect(Role::ControlNode),
            gui: connect(Role::InterfaceNode),
        };
        let mut coordinator = Coordinator::new(
            transport,
            Registry::parse(COMMANDS).unwrap(),
            sink,
        )
        .poll_timeout_ms(10);
        step_until(&mut coordinator, |c| {
            c.transport().count(Role::ControlNode) == 1
                && c.transport().count(Role::InterfaceNode) == 1
        });
        (coordinator, peers)
    }

    fn step_until(
        coordinator: &mut Coordinator<MemorySink>,
        mut done: impl FnMut(&Coordinator<MemorySink>) -> bool,
    ) {
        for _ in 0..200 {
            coordinator.step();
            if done(coordinator) {
                return;
            }
        }
        panic!("condition never reached");
    }

    fn invoke(peers: &mut Peers, name: &str) {
        let payload = MacroInvocation::new(name, "").to_bytes().unwrap();
        write_frame(&mut peers.gui, &payload).unwrap();
    }

    /// Steps until nothing is left to send.
    fn flush(coordinator: &mut Coordinator<MemorySink>) {
        step_until(coordinator, |c| {
            c.transport().queued(Role::ControlNode) == 0
                && c.transport().queued(Role::InterfaceNode) == 0
        });
    }

    fn receive_command(coordinator: &mut Coordinator<MemorySink>, peers: &mut Peers) -> CommandRecord {
        flush(coordinator);
        CommandRecord::from_bytes(&read_frame(&mut peers.pi).unwrap()).unwrap()
    }

    fn reply(peers: &mut Peers, command: CommandRecord) -> Vec<u8> {
        let telemetry = Telemetry {
            source: Role::ControlNode,
            command,
            readings: Readings::default().with_channel("voltage", vec![12.0]),
        };
        let bytes = telemetry.to_bytes().unwrap();
        write_frame(&mut peers.pi, &bytes).unwrap();
        bytes
    }

    #[test]
    fn invocation_round_trip() {
        let (mut coordinator, mut peers) = coordinator(MemorySink::default());
        assert!(coordinator.step());

        invoke(&mut peers, "poll_voltage");
        step_until(&mut coordinator, |c| c.scheduler().active().len() == 1);
        assert_eq!(coordinator.sink().invocations[0].name, "poll_voltage");

        let command = receive_command(&mut coordinator, &mut peers);
        assert_eq!(command.name, "read_voltage");
        assert_eq!(command.device, Role::ControlNode);

        let sent = reply(&mut peers, command);
        step_until(&mut coordinator, |c| c.scheduler().is_idle());
        assert_eq!(coordinator.sink().telemetry.len(), 1);

        // forwarded byte for byte
        flush(&mut coordinator);
        assert_eq!(read_frame(&mut peers.gui).unwrap(), sent);
    }

    #[test]
    fn local_commands_are_released_immediately() {
        let (mut coordinator, mut peers) = coordinator(MemorySink::default());
        invoke(&mut peers, "ramp");
        step_until(&mut coordinator, |c| c.scheduler().active().len() == 1);

        let set_voltage = receive_command(&mut coordinator, &mut peers);
        assert_eq!(set_voltage.priority, Priority::Device.level());
        for _ in 0..5 {
            coordinator.step();
        }
        // wait runs on the coordinator, read_voltage stays behind the device lock
        assert_eq!(coordinator.scheduler().pending().count(), 1);
        assert_eq!(coordinator.scheduler().active().len(), 1);

        reply(&mut peers, set_voltage);
        step_until(&mut coordinator, |c| {
            c.scheduler().pending().count() == 0 && c.scheduler().active().len() == 1
        });
        let read = receive_command(&mut coordinator, &mut peers);
        assert_eq!(read.name, "read_voltage");
    }

    #[test]
    fn bad_payloads_are_discarded() {
        let (mut coordinator, mut peers) = coordinator(MemorySink::default());
        write_frame(&mut peers.gui, b"not json").unwrap();
        write_frame(&mut peers.pi, b"{}").unwrap();
        invoke(&mut peers, "no_such_macro");
        for _ in 0..20 {
            coordinator.step();
        }
        assert!(coordinator.scheduler().is_idle());
        assert_eq!(coordinator.transport().count(Role::ControlNode), 1);
        assert_eq!(coordinator.transport().count(Role::InterfaceNode), 1);
        // the unknown invocation is still recorded
        assert_eq!(coordinator.sink().invocations.len(), 1);
        assert!(coordinator.sink().telemetry.is_empty());
    }

    #[test]
    fn unmatched_echo_is_still_forwarded() {
        let (mut coordinator, mut peers) = coordinator(MemorySink::default());
        let stray = CommandRecord {
            name: "read_voltage".to_string(),
            device: Role::ControlNode,
            priority: 0,
            int_args: vec![],
            float_args: vec![],
            string_args: vec![],
        };
        let sent = reply(&mut peers, stray);
        step_until(&mut coordinator, |c| !c.sink().telemetry.is_empty());
        flush(&mut coordinator);
        assert_eq!(read_frame(&mut peers.gui).unwrap(), sent);
    }

    #[test]
    fn failing_sink_does_not_block_relay() {
        let sink = MemorySink {
            fail: true,
            ..MemorySink::default()
        };
        let (mut coordinator, mut peers) = coordinator(sink);
        invoke(&mut peers, "poll_voltage");
        step_until(&mut coordinator, |c| c.scheduler().active().len() == 1);
        let command = receive_command(&mut coordinator, &mut peers);
        let sent = reply(&mut peers, command);
        step_until(&mut coordinator, |c| c.scheduler().is_idle());
        flush(&mut coordinator);
        assert_eq!(read_frame(&mut peers.gui).unwrap(), sent);
    }

    #[test]
    fn commands_dropped_by_a_full_outbox_are_released() {
        let mut transport = Builder::new(Role::Coordinator)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .control_port(0)
            .module_port(0)
            .interface_port(0)
            .required_peers([Role::InterfaceNode])
            .outbox_limit(1)
            .build();
        transport.establish().unwrap();
        let interface_addr = transport.local_addr(Role::InterfaceNode).unwrap();
        let mut gui = TcpStream::connect(interface_addr).unwrap();
        let mut coordinator = Coordinator::new(
            transport,
            Registry::parse(COMMANDS).unwrap(),
            MemorySink::default(),
        )
        .poll_timeout_ms(10);

        // no control node is connected, so both reads wait in its outbox
        for _ in 0..2 {
            let payload = MacroInvocation::new("poll_voltage", "").to_bytes().unwrap();
            write_frame(&mut gui, &payload).unwrap();
        }
        step_until(&mut coordinator, |c| {
            c.sink().invocations.len() == 2 && c.scheduler().pending().count() == 0
        });
        for _ in 0..5 {
            coordinator.step();
        }
        assert_eq!(coordinator.transport().queued(Role::ControlNode), 1);
        assert_eq!(coordinator.scheduler().active().len(), 1);
    }

    #[test]
    fn missing_interface_fails_step() {
        let mut transport = Builder::new(Role::Coordinator)
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .control_port(0)
            .module_port(0)
            .interface_port(0)
            .build();
        transport.establish().unwrap();
        let mut coordinator = Coordinator::new(transport, Registry::default(), LogSink)
            .poll_timeout_ms(0);
        assert!(!coordinator.step());
    }
}
