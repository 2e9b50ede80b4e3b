//! Synchronized variables.
//!
//! A `SyncVar<T>` is one networked field: a value, a dirty flag and an
//! optional change notifier installed by the owning component. The notifier
//! closure captures whatever the owner needs (its dirty mask and the slot
//! bit); the variable itself never learns its slot index.

use std::{any::Any, fmt, sync::Arc};

use crate::{
    codec::{Reader, WireValue, Writer},
    error::DecodeError,
};

/// Callback fired on every local `set()`.
pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

/// One networked field.
pub struct SyncVar<T> {
    value: T,
    dirty: bool,
    notifier: Option<ChangeNotifier>,
}

impl<T: WireValue> SyncVar<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
            notifier: None,
        }
    }

    /// Current local value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Overwrites the value and marks it for the next broadcast.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.mark_dirty();
    }

    /// Mutates the value in place and marks it for the next broadcast.
    pub fn update(&mut self, f: impl FnOnce(&mut T)) {
        f(&mut self.value);
        self.mark_dirty();
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        if let Some(notify) = &self.notifier {
            notify();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the encoded value.
    pub fn serialize(&self, w: &mut Writer) {
        self.value.encode(w);
    }

    /// Replaces the value with a received one.
    ///
    /// Received values always win and do not mark the variable dirty. On
    /// error the previous value is kept.
    pub fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<(), DecodeError> {
        self.value = T::decode(r)?;
        Ok(())
    }
}

impl<T: WireValue + Default> Default for SyncVar<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncVar")
            .field("value", &self.value)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// A decoded value waiting to be committed to its slot.
pub type StagedValue = Box<dyn Any + Send>;

/// Type-erased view of a `SyncVar` used by component slot lists.
pub trait SyncField: Send {
    fn serialize(&self, w: &mut Writer);
    fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<(), DecodeError>;
    /// Decodes a received value without applying it.
    fn decode_staged(&self, r: &mut Reader<'_>) -> Result<StagedValue, DecodeError>;
    /// Applies a value from `decode_staged` of the same slot. Values of any
    /// other type are ignored.
    fn commit(&mut self, staged: StagedValue);
    fn is_dirty(&self) -> bool;
    fn clear_dirty(&mut self);
    /// Installs the owner's change notifier, replacing any previous one.
    fn attach(&mut self, notifier: ChangeNotifier);
}

impl<T: WireValue + Send + 'static> SyncField for SyncVar<T> {
    fn serialize(&self, w: &mut Writer) {
        SyncVar::serialize(self, w);
    }

    fn deserialize(&mut self, r: &mut Reader<'_>) -> Result<(), DecodeError> {
        SyncVar::deserialize(self, r)
    }

    fn decode_staged(&self, r: &mut Reader<'_>) -> Result<StagedValue, DecodeError> {
        Ok(Box::new(T::decode(r)?))
    }

    fn commit(&mut self, staged: StagedValue) {
        if let Ok(value) = staged.downcast::<T>() {
            self.value = *value;
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn attach(&mut self, notifier: ChangeNotifier) {
        self.notifier = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn set_marks_dirty_and_notifies() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut var = SyncVar::new(3i32);
        assert!(!var.is_dirty());

        let counter = Arc::clone(&hits);
        SyncField::attach(&mut var, Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        var.set(4);
        var.update(|v| *v += 1);
        assert_eq!(*var.get(), 5);
        assert!(var.is_dirty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn received_value_overwrites_without_dirtying() {
        let mut var = SyncVar::new(String::from("local"));
        let bytes = String::from("remote").to_wire();
        var.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(var.get(), "remote");
        assert!(!var.is_dirty());
    }

    #[test]
    fn staged_value_applies_only_on_commit() {
        let mut var = SyncVar::new(1u32);
        let staged = var
            .decode_staged(&mut Reader::new(&9u32.to_wire()))
            .unwrap();
        assert_eq!(*var.get(), 1);
        var.commit(staged);
        assert_eq!(*var.get(), 9);
        assert!(!var.is_dirty());

        var.commit(Box::new(String::from("wrong type")));
        assert_eq!(*var.get(), 9);
    }

    #[test]
    fn decode_failure_keeps_previous_value() {
        let mut var = SyncVar::new(7u32);
        let err = var.deserialize(&mut Reader::new(&[0, 1])).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
        assert_eq!(*var.get(), 7);
    }
}
