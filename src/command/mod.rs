//! Debug and universal command model
//!
//! This module handles:
//! - The typed form of a command line ([`DebugCommand`])
//! - Parsing and validating raw command text ([`parse`])
//! - Rendering a command back to its canonical text (for the journal)
//!
//! Grammar:
//! ```text
//! DBGK state <alias>
//! DBGK valve-ctrl <alias> <0..3> <open|close> now <seconds>
//! DBGK valve-ctrl <alias> <0..3> <open|close> period <0..6> <HH:MM:SS>
//! DBGK valve-ctrl <alias> <0..3> <open|close> event <YYYY-MM-DD> <HH:MM:SS>
//! UCMD time-sync <YYYY-MM-DD> <HH:MM:SS>
//! ```

mod error;
mod parser;

pub use error::{CommandError, ParseError, ValidationError};
pub use parser::parse;

use crate::schedule::ScheduleDescriptor;
use chrono::NaiveDateTime;
use std::fmt;

/// Valves per field controller
pub const VALVE_COUNT: u32 = 4;

/// Upper bound for `now <seconds>` latencies (one year)
pub const MAX_LATENCY_SECONDS: u64 = 365 * 24 * 3600;

/// Command family, selected by the 4-byte start-of-frame tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// `DBGK`: operator commands targeting a field controller
    Debug,
    /// `UCMD`: internal commands executed locally
    Universal,
}

impl Magic {
    pub fn from_sof(sof: &[u8]) -> Option<Self> {
        match sof {
            b"DBGK" => Some(Magic::Debug),
            b"UCMD" => Some(Magic::Universal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Magic::Debug => "DBGK",
            Magic::Universal => "UCMD",
        }
    }
}

/// Supported commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Query the valve states of a controller
    State,
    /// Open or close a valve, now or on a schedule
    ValveCtrl,
    /// Set the local system clock
    TimeSync,
}

impl CommandType {
    pub fn name(self) -> &'static str {
        match self {
            CommandType::State => "state",
            CommandType::ValveCtrl => "valve-ctrl",
            CommandType::TimeSync => "time-sync",
        }
    }

    pub fn magic(self) -> Magic {
        match self {
            CommandType::State | CommandType::ValveCtrl => Magic::Debug,
            CommandType::TimeSync => Magic::Universal,
        }
    }

    /// Look a command name up within a family
    pub fn lookup(magic: Magic, name: &str) -> Option<Self> {
        [CommandType::State, CommandType::ValveCtrl, CommandType::TimeSync]
            .into_iter()
            .find(|c| c.magic() == magic && c.name() == name)
    }
}

/// What to do with the valve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveAction {
    Open,
    Close,
}

impl ValveAction {
    pub fn is_open(self) -> bool {
        self == ValveAction::Open
    }
}

impl fmt::Display for ValveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveAction::Open => write!(f, "open"),
            ValveAction::Close => write!(f, "close"),
        }
    }
}

/// Arguments specific to each command type
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArgs {
    State {
        target: String,
    },
    ValveCtrl {
        target: String,
        valve_index: u8,
        how: ValveAction,
        schedule: ScheduleDescriptor,
    },
    TimeSync {
        at: NaiveDateTime,
    },
}

impl CommandArgs {
    /// Command these arguments belong to
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandArgs::State { .. } => CommandType::State,
            CommandArgs::ValveCtrl { .. } => CommandType::ValveCtrl,
            CommandArgs::TimeSync { .. } => CommandType::TimeSync,
        }
    }
}

/// A parsed, validated command. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugCommand {
    magic: Magic,
    cmd_type: CommandType,
    args: CommandArgs,
    sender: String,
}

impl DebugCommand {
    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn cmd_type(&self) -> CommandType {
        self.cmd_type
    }

    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    /// Peer the command text came from
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Alias of the field controller the command acts on, if any
    pub fn target_alias(&self) -> Option<&str> {
        match &self.args {
            CommandArgs::State { target } | CommandArgs::ValveCtrl { target, .. } => Some(target),
            CommandArgs::TimeSync { .. } => None,
        }
    }

    /// Schedule attached to the command; unscheduled commands run now
    pub fn schedule(&self) -> ScheduleDescriptor {
        match &self.args {
            CommandArgs::ValveCtrl { schedule, .. } => *schedule,
            _ => ScheduleDescriptor::Now {
                latency: std::time::Duration::ZERO,
            },
        }
    }
}

impl fmt::Display for DebugCommand {
    /// Canonical command line, parseable by [`parse`]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magic.as_str(), self.cmd_type.name())?;
        match &self.args {
            CommandArgs::State { target } => write!(f, " {}", target),
            CommandArgs::ValveCtrl {
                target,
                valve_index,
                how,
                schedule,
            } => write!(f, " {} {} {} {}", target, valve_index, how, schedule),
            CommandArgs::TimeSync { at } => write!(f, " {}", at.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}
