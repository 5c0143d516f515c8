use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use slowctl_protocol::{MacroInvocation, Telemetry};

use crate::error::SinkError;

/// Where the coordinator persists what passes through it.
///
/// A failing sink never stops the relay; the coordinator logs the error and moves on.
pub trait TelemetrySink {
    fn record_invocation(&mut self, invocation: &MacroInvocation) -> Result<(), SinkError>;

    fn record_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), SinkError>;
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn record_invocation(&mut self, invocation: &MacroInvocation) -> Result<(), SinkError> {
        (**self).record_invocation(invocation)
    }

    fn record_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), SinkError> {
        (**self).record_telemetry(telemetry)
    }
}

/// Writes every event to the log at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record_invocation(&mut self, invocation: &MacroInvocation) -> Result<(), SinkError> {
        log::info!(
            "Operator invoked {} ({})",
            invocation.name,
            invocation.parameter
        );
        Ok(())
    }

    fn record_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), SinkError> {
        let channels: Vec<&str> = telemetry.readings.channels.keys().map(String::as_str).collect();
        log::info!(
            "Telemetry from {} for {}: channels [{}], {} SPI transfers",
            telemetry.source,
            telemetry.command.name,
            channels.join(", "),
            telemetry.readings.spi.len()
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Entry<'a> {
    Invocation {
        timestamp_ms: u64,
        #[serde(flatten)]
        invocation: &'a MacroInvocation,
    },
    Telemetry {
        timestamp_ms: u64,
        #[serde(flatten)]
        telemetry: &'a Telemetry,
    },
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<JsonLinesSink, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesSink {
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, entry: &Entry<'_>) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

impl TelemetrySink for JsonLinesSink {
    fn record_invocation(&mut self, invocation: &MacroInvocation) -> Result<(), SinkError> {
        self.append(&Entry::Invocation {
            timestamp_ms: now_ms(),
            invocation,
        })
    }

    fn record_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), SinkError> {
        self.append(&Entry::Telemetry {
            timestamp_ms: now_ms(),
            telemetry,
        })
    }
}
