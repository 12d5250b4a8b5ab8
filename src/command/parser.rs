//! Command text parser and validator
//!
//! Each step is a hard gate; the first failure rejects the whole line:
//! 1. start-of-frame tag
//! 2. whitespace tokenization
//! 3. command lookup within the tag's family
//! 4. arity
//! 5. command-specific argument decoding
//! 6. decoder/command cross-check

use super::{
    CommandArgs, CommandError, CommandType, DebugCommand, Magic, ParseError, ValidationError,
    ValveAction, MAX_LATENCY_SECONDS, VALVE_COUNT,
};
use crate::schedule::ScheduleDescriptor;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Duration;

/// Argument decoder registered for one command
struct Decoder {
    /// Command this decoder produces arguments for
    produces: CommandType,
    /// Expected token count (command name included), given the tokens
    arity: fn(&[&str]) -> Result<usize, ParseError>,
    /// Build the arguments from tokens of the right arity
    decode: fn(&[&str]) -> Result<CommandArgs, CommandError>,
}

/// Command name -> decoder
type Registry = [(CommandType, Decoder)];

const REGISTRY: &Registry = &[
    (
        CommandType::State,
        Decoder {
            produces: CommandType::State,
            arity: fixed_arity::<2>,
            decode: decode_state,
        },
    ),
    (
        CommandType::ValveCtrl,
        Decoder {
            produces: CommandType::ValveCtrl,
            arity: valve_ctrl_arity,
            decode: decode_valve_ctrl,
        },
    ),
    (
        CommandType::TimeSync,
        Decoder {
            produces: CommandType::TimeSync,
            arity: fixed_arity::<3>,
            decode: decode_time_sync,
        },
    ),
];

/// Parse and validate one command line received from `sender`
pub fn parse(raw: &[u8], sender: &str) -> Result<DebugCommand, CommandError> {
    parse_with(REGISTRY, raw, sender)
}

fn parse_with(registry: &Registry, raw: &[u8], sender: &str) -> Result<DebugCommand, CommandError> {
    // 1. SOF, checked on raw bytes before anything else
    let magic = raw
        .get(..4)
        .and_then(Magic::from_sof)
        .ok_or_else(|| ParseError::BadSof {
            found: String::from_utf8_lossy(&raw[..raw.len().min(4)]).into_owned(),
        })?;

    // 2. Tokens
    let text = std::str::from_utf8(&raw[4..]).map_err(|_| ParseError::Encoding)?;
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let name = *tokens.first().ok_or(ParseError::Empty)?;

    // 3. Lookup
    let cmd_type = CommandType::lookup(magic, name)
        .ok_or_else(|| ParseError::UnknownCommand(name.to_string()))?;
    let decoder = registry
        .iter()
        .find(|(registered, _)| *registered == cmd_type)
        .map(|(_, decoder)| decoder)
        .ok_or_else(|| ParseError::UnknownCommand(name.to_string()))?;

    // 4. Arity
    let expected = (decoder.arity)(&tokens)?;
    if tokens.len() != expected {
        return Err(ParseError::Arity {
            command: cmd_type.name(),
            expected,
            found: tokens.len(),
        }
        .into());
    }

    // 5. Arguments
    let args = (decoder.decode)(&tokens)?;

    // 6. Cross-check the wiring
    if decoder.produces != cmd_type || args.command_type() != cmd_type {
        return Err(ValidationError::DecoderMismatch {
            command: cmd_type.name(),
            decoder: if decoder.produces != cmd_type {
                decoder.produces.name()
            } else {
                args.command_type().name()
            },
        }
        .into());
    }

    Ok(DebugCommand {
        magic,
        cmd_type,
        args,
        sender: sender.to_string(),
    })
}

fn fixed_arity<const N: usize>(_: &[&str]) -> Result<usize, ParseError> {
    Ok(N)
}

fn decode_state(tokens: &[&str]) -> Result<CommandArgs, CommandError> {
    Ok(CommandArgs::State {
        target: tokens[1].to_string(),
    })
}

/// `valve-ctrl <alias> <index> <how> <when> <tail...>`: the tail length
/// depends on the when-type
fn valve_ctrl_arity(tokens: &[&str]) -> Result<usize, ParseError> {
    const FIXED: usize = 5;
    let Some(when) = tokens.get(FIXED - 1) else {
        return Err(ParseError::Arity {
            command: CommandType::ValveCtrl.name(),
            expected: FIXED + 1,
            found: tokens.len(),
        });
    };

    match *when {
        "now" => Ok(FIXED + 1),
        "period" | "event" => Ok(FIXED + 2),
        other => Err(ParseError::field("when", other)),
    }
}

fn decode_valve_ctrl(tokens: &[&str]) -> Result<CommandArgs, CommandError> {
    let target = tokens[1].to_string();

    let index: u32 = tokens[2]
        .parse()
        .map_err(|_| ParseError::field("valve index", tokens[2]))?;
    if index >= VALVE_COUNT {
        return Err(ValidationError::IndexOutOfRange(index).into());
    }

    let how = match tokens[3] {
        "open" => ValveAction::Open,
        "close" => ValveAction::Close,
        other => return Err(ParseError::field("action", other).into()),
    };

    let schedule = match tokens[4] {
        "now" => ScheduleDescriptor::Now {
            latency: parse_latency(tokens[5])?,
        },
        "period" => ScheduleDescriptor::Period {
            weekday: parse_weekday(tokens[5])?,
            time: parse_time(tokens[6])?,
        },
        "event" => ScheduleDescriptor::Event {
            date: parse_date(tokens[5])?,
            time: parse_time(tokens[6])?,
        },
        other => return Err(ParseError::field("when", other).into()),
    };

    Ok(CommandArgs::ValveCtrl {
        target,
        valve_index: index as u8,
        how,
        schedule,
    })
}

fn decode_time_sync(tokens: &[&str]) -> Result<CommandArgs, CommandError> {
    let date = parse_date(tokens[1])?;
    let time = parse_time(tokens[2])?;
    Ok(CommandArgs::TimeSync {
        at: NaiveDateTime::new(date, time),
    })
}

fn parse_latency(token: &str) -> Result<Duration, CommandError> {
    let seconds: f64 = token
        .parse()
        .map_err(|_| ParseError::field("latency", token))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ParseError::field("latency", token).into());
    }
    if seconds > MAX_LATENCY_SECONDS as f64 {
        return Err(ValidationError::LatencyTooLarge(seconds as u64).into());
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_weekday(token: &str) -> Result<u8, CommandError> {
    let weekday: u32 = token
        .parse()
        .map_err(|_| ParseError::field("weekday", token))?;
    if weekday > 6 {
        return Err(ValidationError::WeekdayOutOfRange(weekday).into());
    }
    Ok(weekday as u8)
}

fn parse_time(token: &str) -> Result<NaiveTime, ParseError> {
    // Exactly HH:MM:SS; chrono alone would also take single digits
    let well_formed = token.len() == 8
        && token
            .char_indices()
            .all(|(i, c)| if i == 2 || i == 5 { c == ':' } else { c.is_ascii_digit() });
    if !well_formed {
        return Err(ParseError::field("time of day", token));
    }
    NaiveTime::parse_from_str(token, "%H:%M:%S").map_err(|_| ParseError::field("time of day", token))
}

fn parse_date(token: &str) -> Result<NaiveDate, ParseError> {
    let well_formed = token.len() == 10
        && token
            .char_indices()
            .all(|(i, c)| if i == 4 || i == 7 { c == '-' } else { c.is_ascii_digit() });
    if !well_formed {
        return Err(ParseError::field("date", token));
    }
    NaiveDate::parse_from_str(token, "%Y-%m-%d").map_err(|_| ParseError::field("date", token))
}
