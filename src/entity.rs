// ============================================================================
// Entity trait
// ============================================================================
//
// The source this engine was distilled from discovers entity classes via
// reflection. Rust has no reflection, so per the design note each entity type
// supplies its own reader/writer functions instead of the engine inspecting
// struct layout at runtime. `#[derive(Entity)]` (see `rustorm_derive`)
// generates this trait's methods from field attributes; it can also be
// implemented by hand for types that need custom column mapping.

use std::any::Any;

use crate::value::Value;

/// The state of a to-one relation field as seen by the engine.
///
/// A field declared as `ManyToOne`/owning `OneToOne` in `EntityMetadata` can
/// point nowhere (`None`), already point at a persisted row (`Id`), hold a
/// brand-new related entity that has not been persisted yet (`New`) — the
/// case exercised by scenario 2 in SPEC_FULL.md §8 (`unit: Unit{name:"U"}`
/// constructed inline with the owning `User`) — or, once the engine has
/// cascade-discovered that new entity and started tracking it, `Pending` its
/// handle until flush assigns it a primary key.
pub enum RelatedValue {
    None,
    Id(Value),
    New(Box<dyn Entity>),
    Pending(EntityHandle),
}

/// The minimal contract the engine needs from a domain type.
///
/// Implementors are plain value objects; nothing here requires them to know
/// about the identity map, the engine, or SQL. Field names passed to
/// `get_column`/`set_column`/`get_relation`/... are the Rust field names
/// declared in `EntityMetadata`, not SQL column names — the metadata registry
/// owns that translation.
pub trait Entity: Any + Send + Sync {
    /// Stable name used to look the type up in the metadata registry; by
    /// convention the Rust struct name.
    fn class_name(&self) -> &'static str;

    fn primary_key(&self) -> Option<Value>;
    fn set_primary_key(&mut self, value: Value);

    fn get_column(&self, field: &str) -> Option<Value>;
    fn set_column(&mut self, field: &str, value: Value);

    /// Reads a to-one relation field without disturbing it.
    fn get_relation(&self, field: &str) -> RelatedValue {
        let _ = field;
        RelatedValue::None
    }

    /// Points a to-one relation field at an already-persisted row.
    fn set_relation_id(&mut self, field: &str, value: Option<Value>) {
        let _ = (field, value);
    }

    /// Takes ownership of a pending new related entity so the engine can
    /// track it independently (used once, during cascade discovery).
    fn take_relation_new(&mut self, field: &str) -> Option<Box<dyn Entity>> {
        let _ = field;
        None
    }

    /// Marks a relation field as pointing at an entity the engine is now
    /// tracking under `handle`, but which has no primary key yet. Called
    /// once per field, right after `take_relation_new` hands the related
    /// entity off to the engine.
    fn set_relation_pending(&mut self, field: &str, handle: EntityHandle) {
        let _ = (field, handle);
    }

    /// Reads the current members of an owning many-to-many collection field,
    /// identified by the target's primary key. Entities with no such field
    /// keep the default empty set.
    fn get_many_to_many(&self, field: &str) -> Vec<Value> {
        let _ = field;
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Entity {
    pub fn downcast_ref<T: Entity + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Entity + 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Constructs a blank instance of a registered entity class by name.
///
/// Hydration needs to build a new `Box<dyn Entity>` knowing only the class
/// name read from `EntityMetadata` — there is no reflection to fall back on,
/// so the embedding application registers one constructor per class here,
/// the same way it registers one `EntityMetadata` per class in the metadata
/// registry (§6).
pub trait EntityFactory: Send + Sync {
    fn create(&self, class_name: &str) -> Option<Box<dyn Entity>>;
}

/// A `HashMap`-backed `EntityFactory` built once at startup.
#[derive(Default)]
pub struct StaticEntityFactory {
    constructors: std::collections::HashMap<String, Box<dyn Fn() -> Box<dyn Entity> + Send + Sync>>,
}

impl StaticEntityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class_name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Entity> + Send + Sync + 'static,
    {
        self.constructors.insert(class_name.into(), Box::new(constructor));
        self
    }
}

impl EntityFactory for StaticEntityFactory {
    fn create(&self, class_name: &str) -> Option<Box<dyn Entity>> {
        self.constructors.get(class_name).map(|ctor| ctor())
    }
}

/// An opaque handle to an entity owned by an `IdentityMap`.
///
/// Rust gives us no ambient object identity the way the source language does,
/// so the identity map is a slab and this is the slot index (SPEC_FULL.md §9,
/// "Ownership of entities"). A handle is only meaningful against the
/// `IdentityMap`/`Engine` that issued it; using one against a different
/// engine instance is a programmer error the type system does not prevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(pub(crate) u64);

impl EntityHandle {
    pub(crate) fn new(raw: u64) -> Self {
        EntityHandle(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget {
        id: Option<Value>,
    }

    impl Entity for Widget {
        fn class_name(&self) -> &'static str {
            "Widget"
        }
        fn primary_key(&self) -> Option<Value> {
            self.id.clone()
        }
        fn set_primary_key(&mut self, value: Value) {
            self.id = Some(value);
        }
        fn get_column(&self, _field: &str) -> Option<Value> {
            None
        }
        fn set_column(&mut self, _field: &str, _value: Value) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn factory_constructs_registered_classes_by_name() {
        let mut factory = StaticEntityFactory::new();
        factory.register("Widget", || Box::new(Widget { id: None }));
        let built = factory.create("Widget").unwrap();
        assert_eq!(built.class_name(), "Widget");
        assert!(factory.create("Ghost").is_none());
    }

    #[test]
    fn downcast_ref_recovers_the_concrete_type() {
        let boxed: Box<dyn Entity> = Box::new(Widget { id: Some(Value::Int(1)) });
        let widget = boxed.downcast_ref::<Widget>().unwrap();
        assert_eq!(widget.id, Some(Value::Int(1)));
    }
}
