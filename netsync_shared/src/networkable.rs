//! Networkable components and their slot serialization.
//!
//! A component exposes its synchronized fields as an explicit, ordered slot
//! list. Slot order is fixed by the component type and identical on every
//! peer; the wire only ever carries slot positions, never field names.
//!
//! Component payload layout:
//!
//! ```text
//! [1B slot count][ceil(count / 8) mask bytes][per present slot: 2B BE length, value]
//! ```
//!
//! Bit `i` of the mask lives in byte `i / 8` at bit `i % 8`.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;

use crate::{
    channel::Channels,
    codec::{Reader, Writer},
    error::DecodeError,
    object::ComponentId,
    registry::ComponentTypeId,
    sync_var::SyncField,
};

/// Slot limit per component type (one bit each in a `u64` mask).
pub const MAX_SLOTS: usize = 64;

/// Downcasting support for boxed components.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A component with synchronized fields.
pub trait Networkable: AsAny + Send {
    /// The component's sync slots, in slot order.
    fn slots(&self) -> Vec<&dyn SyncField>;

    /// Mutable view of the same slots, in the same order.
    fn slots_mut(&mut self) -> Vec<&mut dyn SyncField>;
}

/// A concrete, registrable component type.
pub trait NetworkableType: Networkable + Default + Sized {
    /// Stable name used for registration and diagnostics.
    const TYPE_NAME: &'static str;

    /// Declares the requests and events this type handles.
    ///
    /// Called once, when the type is registered.
    fn declare_channels(_channels: &mut Channels<Self>) {}
}

/// Per-component dirty bits, shared with the slot notifiers.
#[derive(Debug, Default)]
pub struct DirtyMask(AtomicU64);

impl DirtyMask {
    pub fn mark(&self, slot: usize) {
        self.0.fetch_or(1 << slot, Ordering::AcqRel);
    }

    /// Returns the current bits and clears them in one step.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

fn mask_len(slot_count: usize) -> usize {
    slot_count.div_ceil(8)
}

fn full_mask(slot_count: usize) -> u64 {
    if slot_count >= MAX_SLOTS {
        u64::MAX
    } else {
        (1u64 << slot_count) - 1
    }
}

/// A component attached to a `NetworkObject`.
pub struct NetComponent {
    id: ComponentId,
    kind: ComponentTypeId,
    slot_count: usize,
    dirty: Arc<DirtyMask>,
    inner: Box<dyn Networkable>,
}

impl NetComponent {
    /// Wraps a component and wires every slot to the dirty mask.
    pub fn new(id: ComponentId, kind: ComponentTypeId, mut inner: Box<dyn Networkable>) -> Self {
        let dirty = Arc::new(DirtyMask::default());
        let slot_count = {
            let mut slots = inner.slots_mut();
            debug_assert!(slots.len() <= MAX_SLOTS);
            for (i, slot) in slots.iter_mut().enumerate() {
                let mask = Arc::clone(&dirty);
                slot.attach(Arc::new(move || mask.mark(i)));
                if slot.is_dirty() {
                    dirty.mark(i);
                }
            }
            slots.len()
        };

        Self {
            id,
            kind,
            slot_count,
            dirty,
            inner,
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn kind(&self) -> ComponentTypeId {
        self.kind
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// True if any slot changed since the last delta.
    pub fn is_dirty(&self) -> bool {
        self.dirty.peek() != 0
    }

    pub fn dirty_mask(&self) -> u64 {
        self.dirty.peek()
    }

    pub fn inner(&self) -> &dyn Networkable {
        self.inner.as_ref()
    }

    pub fn inner_mut(&mut self) -> &mut dyn Networkable {
        self.inner.as_mut()
    }

    pub fn downcast_ref<C: Networkable>(&self) -> Option<&C> {
        self.inner.as_ref().as_any().downcast_ref::<C>()
    }

    pub fn downcast_mut<C: Networkable>(&mut self) -> Option<&mut C> {
        self.inner.as_mut().as_any_mut().downcast_mut::<C>()
    }

    /// Every slot, all presence bits set. Does not touch dirty state.
    pub fn serialize_full(&self) -> Bytes {
        self.encode_slots(full_mask(self.slot_count))
    }

    /// Only the slots changed since the previous delta, then clears them.
    pub fn serialize_delta(&mut self) -> Bytes {
        let mask = self.dirty.peek() & full_mask(self.slot_count);
        let bytes = self.encode_slots(mask);
        self.clear_dirty();
        bytes
    }

    /// Forgets pending changes without encoding them.
    pub fn clear_dirty(&mut self) {
        self.dirty.take();
        for slot in self.inner.slots_mut() {
            slot.clear_dirty();
        }
    }

    fn encode_slots(&self, mask: u64) -> Bytes {
        let slots = self.inner.slots();
        let mut w = Writer::new();
        w.put_u8(self.slot_count as u8);
        for byte in 0..mask_len(self.slot_count) {
            w.put_u8((mask >> (8 * byte)) as u8);
        }
        for (i, slot) in slots.iter().enumerate() {
            if mask & (1 << i) == 0 {
                continue;
            }
            let mut field = Writer::new();
            slot.serialize(&mut field);
            // Oversized values cannot wrap silently: the enclosing frame is
            // rejected long before a slot reaches u16::MAX.
            w.put_u16(field.len() as u16);
            w.put_slice(field.as_slice());
        }
        w.into_bytes()
    }

    /// Applies a full or delta payload and returns the mask of slots written.
    ///
    /// Every present value is decoded before any slot is written.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<u64, DecodeError> {
        let mut r = Reader::new(bytes);
        let received = r.read_u8()? as usize;
        if received != self.slot_count {
            return Err(DecodeError::SlotCountMismatch {
                expected: self.slot_count,
                received,
            });
        }

        let mask = r
            .take(mask_len(received))?
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)));

        let mut fields = Vec::new();
        for i in 0..received {
            if mask & (1 << i) != 0 {
                let len = r.read_u16()? as usize;
                fields.push((i, r.take(len)?));
            }
        }
        r.finish()?;

        let slots = self.inner.slots();
        let mut staged = Vec::with_capacity(fields.len());
        for (i, raw) in fields {
            let slot = slots.get(i).ok_or(DecodeError::SlotCountMismatch {
                expected: self.slot_count,
                received,
            })?;
            let mut fr = Reader::new(raw);
            let value = slot.decode_staged(&mut fr)?;
            fr.finish()?;
            staged.push((i, value));
        }
        drop(slots);

        let mut slots = self.inner.slots_mut();
        for (i, value) in staged {
            if let Some(slot) = slots.get_mut(i) {
                slot.commit(value);
            }
        }
        Ok(mask)
    }
}

impl fmt::Debug for NetComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetComponent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("slot_count", &self.slot_count)
            .field("dirty", &format_args!("{:#b}", self.dirty.peek()))
            .finish()
    }
}
