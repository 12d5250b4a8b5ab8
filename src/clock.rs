//! Wall-clock access for schedules and `time-sync`
//!
//! Timeouts never go through this trait; they use the tokio monotonic clock.

use crate::error::TimeUpdateError;
use chrono::{Local, NaiveDateTime, TimeZone};
use std::sync::{Mutex, PoisonError};

/// Source of local wall-clock time, optionally settable
pub trait Clock: Send + Sync + 'static {
    /// Current local date and time
    fn now(&self) -> NaiveDateTime;

    /// Set the system clock to the local instant `at`
    fn set_time(&self, at: NaiveDateTime) -> Result<(), TimeUpdateError>;
}

/// The host clock. Setting it needs root or `CAP_SYS_TIME`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn set_time(&self, at: NaiveDateTime) -> Result<(), TimeUpdateError> {
        let local = Local
            .from_local_datetime(&at)
            .earliest()
            .ok_or_else(|| TimeUpdateError::OutOfRange(at.to_string()))?;
        let utc = local.timestamp();

        let ts = libc::timespec {
            tv_sec: utc
                .try_into()
                .map_err(|_| TimeUpdateError::OutOfRange(at.to_string()))?,
            tv_nsec: local.timestamp_subsec_nanos() as _,
        };

        // SAFETY: `ts` is a fully initialized timespec that outlives the call
        let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EPERM) => Err(TimeUpdateError::PermissionDenied),
            Some(libc::EINVAL) => Err(TimeUpdateError::OutOfRange(at.to_string())),
            _ => Err(TimeUpdateError::Os(err)),
        }
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    deny_set: bool,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
            deny_set: false,
        }
    }

    /// A clock whose `set_time` fails like an unprivileged process
    pub fn unprivileged(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
            deny_set: true,
        }
    }

    pub fn advance(&self, by: chrono::TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_time(&self, at: NaiveDateTime) -> Result<(), TimeUpdateError> {
        if self.deny_set {
            return Err(TimeUpdateError::PermissionDenied);
        }
        self.set(at);
        Ok(())
    }
}
