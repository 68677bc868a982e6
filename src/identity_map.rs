// ============================================================================
// Identity map
// ============================================================================
//
// Guarantees at most one in-memory instance per (class, primary key) and
// carries each managed entity's lifecycle state and snapshot. Rust gives us
// no ambient object identity, so "by object identity" in the source design
// becomes "by `EntityHandle`" here: the map owns entities in a slab and hands
// callers an opaque slot index (SPEC_FULL.md §9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::entity::{Entity, EntityHandle};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityLifecycleState {
    New,
    Managed,
    Removed,
    Detached,
}

impl EntityLifecycleState {
    pub fn can_transition_to(self, target: EntityLifecycleState) -> bool {
        use EntityLifecycleState::*;
        matches!(
            (self, target),
            (New, Managed) | (New, Removed) | (New, Detached)
                | (Managed, Removed) | (Managed, Detached)
                | (Detached, Managed)
        )
    }
}

/// Per-entity metadata the identity map keeps alongside the boxed instance.
#[derive(Debug, Clone)]
pub struct EntityState {
    pub class: String,
    pub lifecycle: EntityLifecycleState,
    /// Field values captured the moment the entity became `Managed`;
    /// many-to-one/owning-one-to-one fields store the referenced primary key.
    pub snapshot: HashMap<String, Value>,
    pub captured_at: DateTime<Utc>,
}

struct Slot {
    entity: Box<dyn Entity>,
    state: EntityState,
}

/// Slab of managed entities plus a `(class, primary_key) -> handle` index.
#[derive(Default)]
pub struct IdentityMap {
    slots: Vec<Option<Slot>>,
    by_key: HashMap<(String, KeyValue), EntityHandle>,
    next_handle: u64,
}

/// `Value` does not implement `Hash`/`Eq` generically enough to be a map key
/// on its own in every case that matters here... it does, in fact (see
/// `value.rs`), but wrapping keeps the index's key type explicit and stable
/// if `Value` ever grows a variant that shouldn't participate in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyValue(Value);

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_handle(&mut self) -> EntityHandle {
        let handle = EntityHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Registers `entity` under `primary_key` (if present) with the given
    /// lifecycle state and an already-computed field snapshot (the caller
    /// builds this from `EntityMetadata`, since `Entity` itself has no way
    /// to enumerate its own columns). If another instance is already
    /// registered for the same (class, key), that existing handle is
    /// returned and `entity` is discarded — the existing instance wins per
    /// §4.1's tie-break rule.
    pub fn add(
        &mut self,
        entity: Box<dyn Entity>,
        primary_key: Option<Value>,
        state: EntityLifecycleState,
        snapshot: HashMap<String, Value>,
    ) -> EntityHandle {
        let class = entity.class_name().to_string();
        if let Some(pk) = &primary_key {
            if let Some(existing) = self.by_key.get(&(class.clone(), KeyValue(pk.clone()))) {
                return *existing;
            }
        }

        let handle = self.alloc_handle();
        let slot = Slot {
            entity,
            state: EntityState {
                class: class.clone(),
                lifecycle: state,
                snapshot,
                captured_at: Utc::now(),
            },
        };
        let index = handle.raw() as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(slot);

        if let Some(pk) = primary_key {
            self.by_key.insert((class, KeyValue(pk)), handle);
        }
        handle
    }

    pub fn get_by_id(&self, class: &str, primary_key: &Value) -> Option<EntityHandle> {
        self.by_key
            .get(&(class.to_string(), KeyValue(primary_key.clone())))
            .copied()
    }

    pub fn get_metadata(&self, handle: EntityHandle) -> Option<&EntityState> {
        self.slots
            .get(handle.raw() as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.state)
    }

    pub fn get_metadata_mut(&mut self, handle: EntityHandle) -> Option<&mut EntityState> {
        self.slots
            .get_mut(handle.raw() as usize)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.state)
    }

    pub fn get_entity(&self, handle: EntityHandle) -> Option<&dyn Entity> {
        self.slots
            .get(handle.raw() as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.entity.as_ref())
    }

    pub fn get_entity_mut(&mut self, handle: EntityHandle) -> Option<&mut (dyn Entity + 'static)> {
        self.slots
            .get_mut(handle.raw() as usize)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut *slot.entity)
    }

    /// Erases both the slab slot and the `(class, key)` index entry.
    pub fn remove(&mut self, handle: EntityHandle) {
        let index = handle.raw() as usize;
        if let Some(Some(slot)) = self.slots.get(index) {
            let pk = slot.entity.primary_key();
            if let Some(pk) = pk {
                self.by_key.remove(&(slot.state.class.clone(), KeyValue(pk)));
            }
        }
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Invoked after an INSERT produces an auto-increment id: updates the
    /// entity and the `(class, key)` index. The caller replaces the
    /// snapshot separately via `replace_snapshot` once it has recomputed one
    /// from the post-write field values.
    pub fn update_id(&mut self, handle: EntityHandle, new_primary_key: Value) {
        let index = handle.raw() as usize;
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return;
        };
        slot.entity.set_primary_key(new_primary_key.clone());
        let class = slot.state.class.clone();
        self.by_key.insert((class, KeyValue(new_primary_key)), handle);
    }

    /// Replaces the snapshot with an already-computed one — called after
    /// every successful write so subsequent change detection compares
    /// against post-write state (§3's `postFlush` invariant).
    pub fn replace_snapshot(&mut self, handle: EntityHandle, snapshot: HashMap<String, Value>) {
        let index = handle.raw() as usize;
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return;
        };
        slot.state.snapshot = snapshot;
        slot.state.captured_at = Utc::now();
    }

    pub fn set_lifecycle(&mut self, handle: EntityHandle, state: EntityLifecycleState) {
        if let Some(meta) = self.get_metadata_mut(handle) {
            meta.lifecycle = state;
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| EntityHandle::new(i as u64)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry; all previously managed entities become detached in
    /// effect (§4.5 `clear()`).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_key.clear();
    }
}
