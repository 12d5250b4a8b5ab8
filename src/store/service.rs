//! Service records: liveness of peers keyed by their alias

use super::{BitSet, RecordSpec, Tracked, TrackedStore};
use crate::error::StoreError;
use std::time::Duration;

/// Fields of [`ServiceFlags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceField {
    Available = 0,
    ErrorOccurred = 1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags(u8);

impl ServiceFlags {
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn available(self) -> bool {
        self.get(ServiceField::Available) == 1
    }
}

impl BitSet for ServiceFlags {
    type Field = ServiceField;

    fn get(&self, field: ServiceField) -> u8 {
        (self.0 >> field as u8) & 1
    }

    fn set(&mut self, field: ServiceField, value: u8) {
        let bit = 1 << field as u8;
        if value != 0 {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Why a service was last marked unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFault {
    /// Transport reported the peer disconnected
    Disconnected = 0,
    /// Nothing heard within the disconnect delay
    Silent = 1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFaults(u8);

impl BitSet for ServiceFaults {
    type Field = ServiceFault;

    fn get(&self, field: ServiceFault) -> u8 {
        (self.0 >> field as u8) & 1
    }

    fn set(&mut self, field: ServiceFault, value: u8) {
        let bit = 1 << field as u8;
        if value != 0 {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Record spec for peer liveness keyed by alias
pub struct ServiceSpec;

impl RecordSpec for ServiceSpec {
    type Id = String;
    type Flags = ServiceFlags;
    type Errors = ServiceFaults;
    type Payload = ();

    fn on_flag_changed(record: &mut Tracked<Self>, field: ServiceField, _old: u8, new: u8) {
        // Each sign of life refreshes the liveness window
        if field == ServiceField::Available && new == 1 {
            record.touch();
        }
    }
}

pub type ServiceStore = TrackedStore<ServiceSpec>;

impl TrackedStore<ServiceSpec> {
    /// Record a sign of life from `peer`, tracking it on first sight.
    ///
    /// Returns true when the peer went from unavailable (or unknown) to
    /// available.
    pub fn refresh(&self, peer: &str) -> Result<bool, StoreError> {
        let peer = peer.to_string();
        if !self.is_there(&peer) {
            // A concurrent refresh may have won the insert; that is fine
            let _ = self.insert(peer.clone(), ());
        }

        let mut was = 0;
        self.update_with(&peer, ServiceField::Available, |old| {
            was = old;
            1
        })?;
        if was == 0 {
            self.update_error(&peer, ServiceFault::Disconnected, 0)?;
            self.update_error(&peer, ServiceFault::Silent, 0)?;
        }
        Ok(was == 0)
    }

    /// Mark `peer` unavailable; returns true on an available -> unavailable
    /// transition
    pub fn mark_unavailable(&self, peer: &str, reason: ServiceFault) -> Result<bool, StoreError> {
        let peer = peer.to_string();
        let mut was = 0;
        self.update_with(&peer, ServiceField::Available, |old| {
            was = old;
            0
        })?;
        if was == 1 {
            self.update_error(&peer, reason, 1)?;
        }
        Ok(was == 1)
    }

    /// Peers currently available but silent for longer than `max_delay`
    pub fn silent_peers(&self, max_delay: Duration) -> Result<Vec<String>, StoreError> {
        let mut silent = Vec::new();
        self.for_each_elapsed(|peer, elapsed| {
            if elapsed > max_delay {
                silent.push(peer.clone());
            }
            true
        })?;

        // Availability is read after the sweep to keep the visitor lock-free
        Ok(silent
            .into_iter()
            .filter(|peer| self.get(peer, ServiceField::Available).unwrap_or(0) == 1)
            .collect())
    }

    /// Drop peers that have been unavailable for longer than `retention`,
    /// returning their names
    pub fn forget_stale(&self, retention: Duration) -> Result<Vec<String>, StoreError> {
        let mut stale = Vec::new();
        self.for_each_elapsed(|peer, elapsed| {
            if elapsed > retention {
                stale.push(peer.clone());
            }
            true
        })?;

        let mut forgotten = Vec::new();
        for peer in stale {
            // Heard from again since the scan
            if self.get(&peer, ServiceField::Available).unwrap_or(1) == 1 {
                continue;
            }
            if self.remove(&peer).is_ok() {
                forgotten.push(peer);
            }
        }
        Ok(forgotten)
    }
}
