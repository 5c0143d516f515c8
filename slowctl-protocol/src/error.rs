use thiserror::Error;

/// Errors that may occur when framing an outgoing payload.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FrameError {
    #[error("Payload too large! Maximum is {max}, but got {got}")]
    TooLarge { max: usize, got: usize },
}

/// A payload could not be decoded into the expected record.
#[derive(Debug, Error)]
#[error("Invalid payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// A record could not be encoded into a payload.
#[derive(Debug, Error)]
#[error("Could not encode payload: {0}")]
pub struct EncodeError(#[from] serde_json::Error);
