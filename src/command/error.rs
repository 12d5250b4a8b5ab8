//! Rejection reasons for command text

use thiserror::Error;

/// The text does not follow the command grammar
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad start-of-frame {found:?}, expected DBGK or UCMD")]
    BadSof { found: String },

    #[error("command text is not valid UTF-8")]
    Encoding,

    #[error("no command after start-of-frame")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' takes {expected} tokens, got {found}")]
    Arity {
        command: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },
}

impl ParseError {
    pub(crate) fn field(field: &'static str, value: &str) -> Self {
        ParseError::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}

/// The text parses but its values are not acceptable
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("valve index {0} out of range 0..=3")]
    IndexOutOfRange(u32),

    #[error("weekday {0} out of range 0..=6")]
    WeekdayOutOfRange(u32),

    #[error("latency {0}s exceeds the {max}s limit", max = super::MAX_LATENCY_SECONDS)]
    LatencyTooLarge(u64),

    #[error("decoder for '{decoder}' is registered under '{command}'")]
    DecoderMismatch {
        command: &'static str,
        decoder: &'static str,
    },
}

/// Any reason a command was rejected at ingress
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
