// ============================================================================
// Change detector
// ============================================================================
//
// Compares a managed entity's current field values against the snapshot held
// in its `EntityState` and produces a `ChangeSet`. Grounded on the
// `snapshot`/`is_dirty`/`changed_fields` idiom of the unit-of-work reference
// in the example pack, generalized to the FK-by-primary-key and
// many-to-many-by-membership rules SPEC_FULL.md §4.2 calls for.

use std::collections::{HashMap, HashSet};

use crate::entity::{Entity, EntityHandle, RelatedValue};
use crate::metadata::{EntityMetadata, RelationInfo};
use crate::value::Value;

/// The new side of a many-to-one/owning-one-to-one field change: either a
/// concrete primary key, or a reference to a not-yet-inserted related entity
/// that the flush orchestrator must resolve once that entity gets an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefChange {
    Null,
    Id(Value),
    PendingRef(EntityHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Scalar { old: Option<Value>, new: Value },
    Relation { old: Option<Value>, new: RefChange },
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub fields: HashMap<String, FieldChange>,
    pub to_link: Vec<(String, Value)>,
    pub to_unlink: Vec<(String, Value)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.to_link.is_empty() && self.to_unlink.is_empty()
    }
}

/// Computes the change set for an entity against `snapshot`, given its
/// metadata. A `Pending` relation value (set by the engine during cascade
/// discovery, before change detection runs) carries its own `EntityHandle`,
/// so this function needs no access to the identity map itself.
pub fn detect_changes(
    entity: &dyn Entity,
    metadata: &EntityMetadata,
    snapshot: &HashMap<String, Value>,
) -> ChangeSet {
    let mut change_set = ChangeSet::default();

    for (field, _column) in &metadata.columns {
        if field == &metadata.id_field {
            continue;
        }
        let Some(current) = entity.get_column(field) else {
            // Uninitialized field: report no change (§4.2 failure mode).
            continue;
        };
        let old = snapshot.get(field).cloned();
        let changed = match &old {
            Some(old_value) => old_value != &current,
            None => true,
        };
        if changed {
            change_set
                .fields
                .insert(field.clone(), FieldChange::Scalar { old, new: current });
        }
    }

    for relation in &metadata.relations {
        match relation {
            RelationInfo::ManyToOne { field, .. }
            | RelationInfo::OneToOne { field, inverse: false, .. } => {
                let old = snapshot.get(field).cloned();
                let new = match entity.get_relation(field) {
                    RelatedValue::None => RefChange::Null,
                    RelatedValue::Id(value) => RefChange::Id(value),
                    RelatedValue::Pending(handle) => RefChange::PendingRef(handle),
                    // Cascade discovery (run before change detection, during
                    // `persist`/`flush` step 1) always converts `New` into
                    // `Pending`; seeing it here would mean a related entity
                    // was never handed to the engine.
                    RelatedValue::New(_) => RefChange::Null,
                };
                let old_as_ref = match &old {
                    Some(v) => RefChange::Id(v.clone()),
                    None => RefChange::Null,
                };
                if old_as_ref != new {
                    change_set
                        .fields
                        .insert(field.clone(), FieldChange::Relation { old, new });
                }
            }
            RelationInfo::ManyToMany { field, .. } => {
                let current: HashSet<Value> = entity.get_many_to_many(field).into_iter().collect();
                let previous: HashSet<Value> = snapshot
                    .get(&format!("__m2m__{field}"))
                    .and_then(|v| match v {
                        Value::Bytes(bytes) => serde_json::from_slice::<Vec<Value>>(bytes).ok(),
                        _ => None,
                    })
                    .map(|v| v.into_iter().collect())
                    .unwrap_or_default();

                for value in current.difference(&previous) {
                    change_set.to_link.push((field.clone(), value.clone()));
                }
                for value in previous.difference(&current) {
                    change_set.to_unlink.push((field.clone(), value.clone()));
                }
            }
            // Inverse one-to-many collections do not produce direct SQL
            // changes (§4.2); relation processing handles them separately.
            RelationInfo::OneToMany { .. } | RelationInfo::OneToOne { inverse: true, .. } => {}
        }
    }

    change_set
}

/// Builds the snapshot stored in `EntityState` at the moment an entity
/// becomes managed: scalar columns plus, for owning relations, the
/// referenced primary key (never the whole related object, per §3).
pub fn capture_snapshot(entity: &dyn Entity, metadata: &EntityMetadata) -> HashMap<String, Value> {
    let mut snapshot = HashMap::new();
    for (field, _column) in &metadata.columns {
        if field == &metadata.id_field {
            continue;
        }
        if let Some(value) = entity.get_column(field) {
            snapshot.insert(field.clone(), value);
        }
    }
    for relation in metadata.owning_relations() {
        let field = relation.field();
        if let RelatedValue::Id(value) = entity.get_relation(field) {
            snapshot.insert(field.to_string(), value);
        }
    }
    for relation in metadata.many_to_many_relations() {
        let field = relation.field();
        let members = entity.get_many_to_many(field);
        if let Ok(encoded) = serde_json::to_vec(&members) {
            snapshot.insert(format!("__m2m__{field}"), Value::Bytes(encoded));
        }
    }
    snapshot
}
