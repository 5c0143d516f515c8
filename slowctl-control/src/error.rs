use std::{io, path::PathBuf};

use thiserror::Error;

/// A rejected line of a command definition file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct GrammarError {
    /// 1-based line number.
    pub line: usize,
    pub kind: GrammarErrorKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrammarErrorKind {
    #[error("expected `BEGIN DEFINITIONS` or `BEGIN SEQUENCE`, found `{0}`")]
    UnexpectedLine(String),
    #[error("a definition needs five fields `<device> <name> <ints> <floats> <strings>`, found `{0}`")]
    MalformedDefinition(String),
    #[error("unknown device code `{0}`")]
    UnknownDevice(String),
    #[error("`{0}` is not a valid number")]
    InvalidNumber(String),
    #[error("command `{device} {name}` with {n_ints} ints, {n_floats} floats and {n_strings} strings is defined twice")]
    DuplicateDefinition {
        device: String,
        name: String,
        n_ints: usize,
        n_floats: usize,
        n_strings: usize,
    },
    #[error("a sequence name is a single word, found `{0}`")]
    InvalidMacroName(String),
    #[error("sequence `{0}` is defined twice")]
    DuplicateMacro(String),
    #[error("a command is `<device> <name>` followed by tag/value pairs, found `{0}`")]
    MalformedCommand(String),
    #[error("`CHK` must be the first tag of a command")]
    MisplacedPriority,
    #[error("priority must be 0, 1 or 2, found `{0}`")]
    InvalidPriority(String),
    #[error("unknown tag `{0}`, expected CHK, INT, FLT or STR")]
    UnknownTag(String),
    #[error("no definition of `{device} {name}` takes {n_ints} ints, {n_floats} floats and {n_strings} strings")]
    UnresolvedCommand {
        device: String,
        name: String,
        n_ints: usize,
        n_floats: usize,
        n_strings: usize,
    },
    #[error("file ends inside a {0} block")]
    UnterminatedBlock(&'static str),
}

/// Failure to load a command definition file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Could not read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Invalid command definitions in {}: {source}", path.display())]
    Grammar { path: PathBuf, source: GrammarError },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No sequence named `{0}`")]
    UnknownMacro(String),
}

/// A command record whose priority is outside 0..=2.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid priority {0}")]
pub struct InvalidPriority(pub u8);

/// A device backend could not carry out a command.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unsupported command `{0}`")]
    Unsupported(String),
    #[error("Invalid arguments for `{command}`: {reason}")]
    InvalidArguments { command: String, reason: String },
    #[error("Hardware access failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Could not write record: {0}")]
    Io(#[from] io::Error),
    #[error("Could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}
