//! # Slow Control Node
//!
//! One executable for every process of the slow control network. The subcommand selects
//! the role:
//!
//! - `slowctl coordinator` loads the command definitions, listens for all other roles and
//!   relays between them.
//! - `slowctl backplane <host>` and `slowctl module <host>` run a device node against
//!   simulated hardware.
//! - `slowctl interface <host> --invoke <sequence>` sends sequence invocations and prints
//!   the telemetry that comes back.
//!
//! Every role exits with a non-zero status if it cannot set up its mandatory link at
//! startup. Once running, lost links are retried forever.
pub mod backends;

use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use env_logger::Env;
use slowctl_control::{
    Coordinator, DeviceBackend, DeviceNode, InterfaceNode, JsonLinesSink, LogSink, Registry,
    TelemetrySink,
};
use slowctl_net::Builder;
use slowctl_protocol::{MacroInvocation, Role};

use crate::backends::{backplane::SimulatedBackplane, module::SimulatedModules};

#[derive(Subcommand, Clone)]
enum Process {
    /// Relay between all other roles and schedule device commands
    Coordinator {
        #[arg(short, long, default_value = "commands.config")]
        commands: PathBuf,
        #[arg(
            long = "require",
            value_name = "ROLE",
            help = "Peer role that must be connected (repeatable, default: control and interface)"
        )]
        require: Vec<Role>,
        #[arg(long, help = "Append every invocation and telemetry record to this file")]
        log_file: Option<PathBuf>,
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,
    },
    /// Control node for the backplane (simulated)
    Backplane { host: String },
    /// Module node for the target modules (simulated)
    Module {
        host: String,
        #[arg(long, default_value_t = backends::module::DEFAULT_MODULES)]
        modules: usize,
    },
    /// Operator interface
    Interface {
        host: String,
        #[arg(
            short,
            long = "invoke",
            value_name = "SEQUENCE[=PARAMETER]",
            help = "Sequence to invoke once connected (repeatable)"
        )]
        invoke: Vec<String>,
        #[arg(short = 'n', long, help = "Exit after this many telemetry records")]
        count: Option<usize>,
    },
}

#[derive(Parser)]
#[command(about = "Slow control network node", long_about = None)]
struct Args {
    #[arg(long, global = true, default_value_t = Role::CONTROL_PORT)]
    control_port: u16,

    #[arg(long, global = true, default_value_t = Role::MODULE_PORT)]
    module_port: u16,

    #[arg(long, global = true, default_value_t = Role::INTERFACE_PORT)]
    interface_port: u16,

    #[arg(
        short,
        long,
        global = true,
        default_value = "100",
        help = "Poll timeout of one loop iteration in milliseconds"
    )]
    timeout_ms: i32,

    #[clap(subcommand)]
    process: Process,
}

impl Args {
    fn transport(&self, role: Role) -> Builder {
        Builder::new(role)
            .control_port(self.control_port)
            .module_port(self.module_port)
            .interface_port(self.interface_port)
    }
}

fn run_device<B: DeviceBackend>(
    builder: Builder,
    backend: B,
    timeout_ms: i32,
) -> Result<(), Box<dyn Error>> {
    let mut transport = builder.build();
    transport.establish()?;
    DeviceNode::new(transport, backend)
        .poll_timeout_ms(timeout_ms)
        .run()
}

fn parse_invocation(text: &str) -> MacroInvocation {
    match text.split_once('=') {
        Some((name, parameter)) => MacroInvocation::new(name, parameter),
        None => MacroInvocation::new(text, ""),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!(
        "Ports: control={}, module={}, interface={}",
        args.control_port,
        args.module_port,
        args.interface_port
    );

    match args.process.clone() {
        Process::Coordinator {
            commands,
            require,
            log_file,
            bind,
        } => {
            let registry = Registry::load(&commands)?;
            let mut builder = args.transport(Role::Coordinator).bind_addr(bind);
            if !require.is_empty() {
                builder = builder.required_peers(require);
            }
            let mut transport = builder.build();
            transport.establish()?;

            let sink: Box<dyn TelemetrySink> = match log_file {
                Some(path) => {
                    log::info!("Recording telemetry to {}", path.display());
                    Box::new(JsonLinesSink::open(&path)?)
                }
                None => Box::new(LogSink),
            };
            Coordinator::new(transport, registry, sink)
                .poll_timeout_ms(args.timeout_ms)
                .run()
        }
        Process::Backplane { host } => run_device(
            args.transport(Role::ControlNode).host(host),
            SimulatedBackplane::new(),
            args.timeout_ms,
        ),
        Process::Module { host, modules } => run_device(
            args.transport(Role::ModuleNode).host(host),
            SimulatedModules::new(modules),
            args.timeout_ms,
        ),
        Process::Interface {
            host,
            invoke,
            count,
        } => {
            let mut transport = args.transport(Role::InterfaceNode).host(host).build();
            transport.establish()?;
            let mut gui = InterfaceNode::new(transport).poll_timeout_ms(args.timeout_ms);
            for text in &invoke {
                gui.invoke(parse_invocation(text));
            }

            let mut received = 0;
            while count.is_none_or(|limit| received < limit) {
                gui.step(|telemetry| {
                    received += 1;
                    match serde_json::to_string(&telemetry) {
                        Ok(line) => println!("{line}"),
                        Err(e) => log::error!("Could not print telemetry: {}", e),
                    }
                });
            }
            gui.shutdown()?;
            Ok(())
        }
    }
}
