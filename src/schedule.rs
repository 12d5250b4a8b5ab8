//! Schedule descriptors and the trigger evaluator
//!
//! Wall-clock instants are naive local date-times, the way field operators
//! write them on the command line. Weekdays count from Sunday = 0.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::fmt;
use std::time::Duration;

/// When a command should fire
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleDescriptor {
    /// Once, `latency` after scheduling
    Now { latency: Duration },
    /// Every week on `weekday` (0 = Sunday) at `time`
    Period { weekday: u8, time: NaiveTime },
    /// Once, at an absolute instant
    Event { date: NaiveDate, time: NaiveTime },
}

impl ScheduleDescriptor {
    /// Recurring descriptors are never retired by firing
    pub fn is_recurring(&self) -> bool {
        matches!(self, ScheduleDescriptor::Period { .. })
    }

    /// Whether the descriptor must survive a restart
    pub fn is_persistent(&self) -> bool {
        !matches!(self, ScheduleDescriptor::Now { .. })
    }
}

impl fmt::Display for ScheduleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleDescriptor::Now { latency } => write!(f, "now {}", latency.as_secs_f64()),
            ScheduleDescriptor::Period { weekday, time } => {
                write!(f, "period {} {}", weekday, time.format("%H:%M:%S"))
            }
            ScheduleDescriptor::Event { date, time } => {
                write!(f, "event {} {}", date.format("%Y-%m-%d"), time.format("%H:%M:%S"))
            }
        }
    }
}

/// Outcome of evaluating a schedule at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Fire now for the occurrence at `at`
    Due { at: NaiveDateTime },
    /// Nothing to do until `next`
    Pending { next: NaiveDateTime },
    /// The one-shot instant passed without firing; the schedule is retired
    Missed { at: NaiveDateTime },
    /// Already fired (or missed); nothing will ever be due again
    Retired,
}

/// A descriptor armed at `created`, with its firing history
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    descriptor: ScheduleDescriptor,
    created: NaiveDateTime,
    last_fired: Option<NaiveDateTime>,
    retired: bool,
}

impl Schedule {
    pub fn new(descriptor: ScheduleDescriptor, created: NaiveDateTime) -> Self {
        Self {
            descriptor,
            created,
            last_fired: None,
            retired: false,
        }
    }

    pub fn descriptor(&self) -> &ScheduleDescriptor {
        &self.descriptor
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn last_fired(&self) -> Option<NaiveDateTime> {
        self.last_fired
    }

    /// Decide whether the schedule is due at `now`.
    ///
    /// `tolerance` is the half-width of the window around a periodic or
    /// event instant inside which it still counts as due (one sweeper tick).
    /// A given occurrence is reported `Due` at most once.
    pub fn evaluate(&mut self, now: NaiveDateTime, tolerance: Duration) -> Verdict {
        if self.retired {
            return Verdict::Retired;
        }
        let tolerance = TimeDelta::from_std(tolerance).unwrap_or_else(|_| TimeDelta::zero());

        match self.descriptor {
            ScheduleDescriptor::Now { latency } => {
                let due = TimeDelta::from_std(latency)
                    .ok()
                    .and_then(|l| self.created.checked_add_signed(l))
                    .unwrap_or(NaiveDateTime::MAX);
                if now >= due {
                    self.fire(due);
                    self.retired = true;
                    Verdict::Due { at: due }
                } else {
                    Verdict::Pending { next: due }
                }
            }

            ScheduleDescriptor::Period { weekday, time } => {
                let previous = previous_occurrence(now, weekday, time);
                let next = previous + TimeDelta::days(7);

                // The window is symmetric, so the upcoming occurrence may
                // already be due a fraction of a tick early
                for at in [previous, next] {
                    if (now - at).abs() <= tolerance && self.last_fired != Some(at) {
                        self.fire(at);
                        return Verdict::Due { at };
                    }
                }

                if self.last_fired == Some(next) {
                    Verdict::Pending { next: next + TimeDelta::days(7) }
                } else {
                    Verdict::Pending { next }
                }
            }

            ScheduleDescriptor::Event { date, time } => {
                let at = date.and_time(time);
                if now < at - tolerance {
                    Verdict::Pending { next: at }
                } else if now <= at + tolerance {
                    self.fire(at);
                    self.retired = true;
                    Verdict::Due { at }
                } else {
                    self.retired = true;
                    Verdict::Missed { at }
                }
            }
        }
    }

    fn fire(&mut self, at: NaiveDateTime) {
        self.last_fired = Some(at);
    }
}

/// Latest `weekday`/`time` instant at or before `now`
fn previous_occurrence(now: NaiveDateTime, weekday: u8, time: NaiveTime) -> NaiveDateTime {
    let today = now.weekday().num_days_from_sunday() as i64;
    let back = (today - weekday as i64).rem_euclid(7);
    let candidate = (now.date() - TimeDelta::days(back)).and_time(time);

    if candidate > now {
        candidate - TimeDelta::days(7)
    } else {
        candidate
    }
}
