//! Concurrent tracking store for in-flight protocol units
//!
//! A [`TrackedStore`] maps an id to a [`Tracked`] record made of a packed
//! flag set, a packed error set, a monotonic `last_update` stamp and an
//! opaque payload. What the bits mean is up to the [`RecordSpec`]:
//! - [`packet`] tracks confirmation and retransmission of outbound envelopes
//! - [`service`] tracks peer liveness
//!
//! Mutations take the write lock; lookups and the elapsed-time sweep share
//! the read lock. No method awaits or calls out while holding a lock, except
//! for the visitor passed to [`TrackedStore::for_each_elapsed`] which runs
//! under the read lock and must not touch the store.

pub mod packet;
pub mod service;

use crate::error::StoreError;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

pub use packet::{PacketField, PacketFlags, PacketStore};
pub use service::{ServiceField, ServiceFlags, ServiceStore};

/// A fixed-width bit set addressed by named fields
pub trait BitSet: Copy + Default + Debug + Send + Sync + 'static {
    /// Field selector (a single bit or a multi-bit counter)
    type Field: Copy + Debug + Send + Sync;

    /// Read a field
    fn get(&self, field: Self::Field) -> u8;

    /// Write a field, saturating the value to the field width
    fn set(&mut self, field: Self::Field, value: u8);
}

/// Describes one kind of tracked record
pub trait RecordSpec: Sized + Send + Sync + 'static {
    type Id: Eq + Hash + Clone + Debug + Send + Sync;
    type Flags: BitSet;
    type Errors: BitSet;
    type Payload: Send + Sync;

    /// Hook run after every flag write, with the field value before and after.
    fn on_flag_changed(
        _record: &mut Tracked<Self>,
        _field: <Self::Flags as BitSet>::Field,
        _old: u8,
        _new: u8,
    ) {
    }
}

/// A tracked record
pub struct Tracked<S: RecordSpec> {
    flags: S::Flags,
    errors: S::Errors,
    last_update: Instant,
    payload: S::Payload,
}

impl<S: RecordSpec> Tracked<S> {
    fn new(payload: S::Payload, flags: S::Flags) -> Self {
        Self {
            flags,
            errors: S::Errors::default(),
            last_update: Instant::now(),
            payload,
        }
    }

    pub fn flags(&self) -> S::Flags {
        self.flags
    }

    pub fn errors(&self) -> S::Errors {
        self.errors
    }

    pub fn payload(&self) -> &S::Payload {
        &self.payload
    }

    /// Restart the elapsed-time window
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }
}

/// Generic id -> record store
pub struct TrackedStore<S: RecordSpec> {
    records: RwLock<HashMap<S::Id, Tracked<S>>>,
}

impl<S: RecordSpec> Default for TrackedStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RecordSpec> TrackedStore<S> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    // A panicking writer cannot leave a record half-written: every mutation
    // is a single field store, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<S::Id, Tracked<S>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<S::Id, Tracked<S>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(id: &S::Id) -> StoreError {
        StoreError::NotFound(format!("{:?}", id))
    }

    /// Start tracking `id` with zeroed flags and errors
    pub fn insert(&self, id: S::Id, payload: S::Payload) -> Result<(), StoreError> {
        self.insert_with(id, payload, S::Flags::default())
    }

    /// Start tracking `id` with preset flags, in one step
    pub fn insert_with(
        &self,
        id: S::Id,
        payload: S::Payload,
        flags: S::Flags,
    ) -> Result<(), StoreError> {
        let mut records = self.write();
        if records.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("{:?}", id)));
        }
        records.insert(id, Tracked::new(payload, flags));
        Ok(())
    }

    /// Check whether `id` is tracked
    pub fn is_there(&self, id: &S::Id) -> bool {
        self.read().contains_key(id)
    }

    /// Number of tracked records
    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Write a flag field
    pub fn update(
        &self,
        id: &S::Id,
        field: <S::Flags as BitSet>::Field,
        value: u8,
    ) -> Result<(), StoreError> {
        self.update_with(id, field, |_| value).map(|_| ())
    }

    /// Read-modify-write a flag field, returning the stored value
    pub fn update_with(
        &self,
        id: &S::Id,
        field: <S::Flags as BitSet>::Field,
        f: impl FnOnce(u8) -> u8,
    ) -> Result<u8, StoreError> {
        let mut records = self.write();
        let record = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;

        let old = record.flags.get(field);
        record.flags.set(field, f(old));
        let new = record.flags.get(field);

        if old != new {
            record.touch();
        }
        S::on_flag_changed(record, field, old, new);

        Ok(new)
    }

    /// Write an error field
    pub fn update_error(
        &self,
        id: &S::Id,
        field: <S::Errors as BitSet>::Field,
        value: u8,
    ) -> Result<(), StoreError> {
        let mut records = self.write();
        let record = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;

        let old = record.errors.get(field);
        record.errors.set(field, value);
        if record.errors.get(field) != old {
            record.touch();
        }
        Ok(())
    }

    /// Read a flag field
    pub fn get(&self, id: &S::Id, field: <S::Flags as BitSet>::Field) -> Result<u8, StoreError> {
        self.with_record(id, |r| r.flags.get(field))
    }

    /// Read an error field
    pub fn get_error(
        &self,
        id: &S::Id,
        field: <S::Errors as BitSet>::Field,
    ) -> Result<u8, StoreError> {
        self.with_record(id, |r| r.errors.get(field))
    }

    /// Snapshot of the whole flag set
    pub fn flags(&self, id: &S::Id) -> Result<S::Flags, StoreError> {
        self.with_record(id, |r| r.flags)
    }

    /// Time of the last state-changing mutation
    pub fn get_time(&self, id: &S::Id) -> Result<Instant, StoreError> {
        self.with_record(id, |r| r.last_update)
    }

    /// Time since the last state-changing mutation
    pub fn get_elapsed_time(&self, id: &S::Id) -> Result<Duration, StoreError> {
        self.with_record(id, |r| r.last_update.elapsed())
    }

    /// Run `f` against a record under the read lock
    pub fn with_record<R>(
        &self,
        id: &S::Id,
        f: impl FnOnce(&Tracked<S>) -> R,
    ) -> Result<R, StoreError> {
        let records = self.read();
        records.get(id).map(f).ok_or_else(|| Self::not_found(id))
    }

    /// Stop tracking `id`, handing back its payload
    pub fn remove(&self, id: &S::Id) -> Result<S::Payload, StoreError> {
        self.write()
            .remove(id)
            .map(|r| r.payload)
            .ok_or_else(|| Self::not_found(id))
    }

    /// Visit every record with its elapsed time, as of a single instant
    ///
    /// Stops at the first visitor returning `false` and reports which record
    /// it failed on.
    pub fn for_each_elapsed(
        &self,
        mut visitor: impl FnMut(&S::Id, Duration) -> bool,
    ) -> Result<(), StoreError> {
        let records = self.read();
        let now = Instant::now();

        for (id, record) in records.iter() {
            if !visitor(id, now.saturating_duration_since(record.last_update)) {
                return Err(StoreError::CallbackFailed(format!("{:?}", id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal spec: two single-bit flags, one 2-bit counter
    struct TestSpec;

    #[derive(Debug, Clone, Copy)]
    enum TestField {
        A,
        B,
        Counter,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    struct TestBits(u8);

    impl BitSet for TestBits {
        type Field = TestField;

        fn get(&self, field: TestField) -> u8 {
            match field {
                TestField::A => self.0 & 1,
                TestField::B => (self.0 >> 1) & 1,
                TestField::Counter => (self.0 >> 2) & 0b11,
            }
        }

        fn set(&mut self, field: TestField, value: u8) {
            let (shift, mask) = match field {
                TestField::A => (0, 1),
                TestField::B => (1, 1),
                TestField::Counter => (2, 0b11),
            };
            self.0 = (self.0 & !(mask << shift)) | (value.min(mask) << shift);
        }
    }

    impl RecordSpec for TestSpec {
        type Id = u32;
        type Flags = TestBits;
        type Errors = TestBits;
        type Payload = &'static str;
    }

    #[test]
    fn test_insert_then_get() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(7, "seven").unwrap();

        assert!(store.is_there(&7));
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(&7, TestField::A).unwrap(), 0);
        assert_eq!(store.get_error(&7, TestField::B).unwrap(), 0);
        assert!(store.get_time(&7).unwrap() <= Instant::now());
        assert_eq!(store.with_record(&7, |r| *r.payload()).unwrap(), "seven");
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(1, "first").unwrap();

        let err = store.insert(1, "second").unwrap_err();
        assert_eq!(err, StoreError::Duplicate("1".into()));
        assert_eq!(store.with_record(&1, |r| *r.payload()).unwrap(), "first");
    }

    #[test]
    fn test_missing_id() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        assert_eq!(store.get(&9, TestField::A), Err(StoreError::NotFound("9".into())));
        assert!(store.update(&9, TestField::A, 1).is_err());
        assert!(store.get_elapsed_time(&9).is_err());
        assert!(store.remove(&9).is_err());
    }

    #[test]
    fn test_update_saturates_counter() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(1, "x").unwrap();

        for _ in 0..10 {
            store.update_with(&1, TestField::Counter, |c| c + 1).unwrap();
        }
        assert_eq!(store.get(&1, TestField::Counter).unwrap(), 3);
        assert_eq!(store.get(&1, TestField::A).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_restarts_on_change_only() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(1, "x").unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let first = store.get_elapsed_time(&1).unwrap();
        assert_eq!(first, Duration::from_secs(5));

        // Writing the value already stored is not a state change
        store.update(&1, TestField::A, 0).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = store.get_elapsed_time(&1).unwrap();
        assert!(second >= first);

        store.update(&1, TestField::A, 1).unwrap();
        assert_eq!(store.get_elapsed_time(&1).unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_for_each_elapsed() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(1, "a").unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        store.insert(2, "b").unwrap();

        let mut seen = Vec::new();
        store
            .for_each_elapsed(|id, elapsed| {
                seen.push((*id, elapsed));
                true
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec![(1, Duration::from_secs(2)), (2, Duration::ZERO)]);

        let err = store.for_each_elapsed(|id, _| *id != 2).unwrap_err();
        assert_eq!(err, StoreError::CallbackFailed("2".into()));
    }

    #[test]
    fn test_remove_returns_payload() {
        let store: TrackedStore<TestSpec> = TrackedStore::new();
        store.insert(3, "three").unwrap();
        assert_eq!(store.remove(&3).unwrap(), "three");
        assert!(!store.is_there(&3));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let store = std::sync::Arc::new(TrackedStore::<TestSpec>::new());
        for id in 0..8 {
            store.insert(id, "t").unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.update(&id, TestField::B, 1).unwrap();
                    store.get(&id, TestField::B).unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
    }
}
