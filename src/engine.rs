// ============================================================================
// Engine
// ============================================================================
//
// The unit of work: owns the identity map and event dispatcher, exposes
// persist/remove/merge/detach/refresh/find/clear, and runs the fourteen-step
// flush protocol (SPEC_FULL.md §4.5) that turns accumulated in-memory state
// into INSERT/UPDATE/DELETE statements against the external `Database`. This
// is the integration point: every other module in the crate is consumed from
// here.

use std::collections::{HashMap, HashSet};

use crate::change_detector::{capture_snapshot, detect_changes, ChangeSet, FieldChange, RefChange};
use crate::config::EngineConfig;
use crate::database::Database;
use crate::dependency;
use crate::entity::{Entity, EntityFactory, EntityHandle, RelatedValue};
use crate::error::{OrmError, Result};
use crate::events::{EventContext, EventDispatcher, LifecycleEvent, Listener};
use crate::identity_map::{EntityLifecycleState, IdentityMap};
use crate::metadata::{EntityMetadata, MetadataRegistry, RelationInfo};
use crate::query::{Comparison, Delete, Insert, Link, Select, Update};
use crate::repository::Repository;
use crate::value::{DataType, Value};

/// The owning side of a to-one relation whose edge in the current insert
/// order got broken to resolve a dependency cycle (§4.3): its FK was bound to
/// `NULL` in the initial INSERT and needs a follow-up UPDATE once `target`
/// has a primary key.
struct DeferredFk {
    dependent: EntityHandle,
    field: String,
    fk_column: String,
    target: EntityHandle,
}

/// A single flush pass's classification of the identity map, plus the change
/// set computed for every insert/update candidate (new entities get one too,
/// purely so many-to-many membership can be extracted from it — §4.2/§4.5).
struct Work {
    inserts: Vec<EntityHandle>,
    updates: Vec<EntityHandle>,
    removals: Vec<EntityHandle>,
    change_sets: HashMap<EntityHandle, ChangeSet>,
}

/// The FK column of an owning relation, or `None` for anything that isn't
/// one (inverse one-to-one, one-to-many, many-to-many).
fn owning_fk_column(relation: &RelationInfo) -> Option<&str> {
    match relation {
        RelationInfo::ManyToOne { fk_column, .. } => Some(fk_column),
        RelationInfo::OneToOne { fk_column, inverse: false, .. } => Some(fk_column),
        _ => None,
    }
}

/// Parses `Database::last_insert_id()`'s dialect-agnostic string result into
/// a `Value` matching the id column's declared type. Falls back to `Text` for
/// anything that isn't an integer or a UUID, since some dialects hand back
/// an id of any type through this same string-typed hook.
fn parse_id_value(raw: &str, sql_type: DataType) -> Value {
    match sql_type {
        DataType::Integer => raw.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::Text(raw.to_string())),
        DataType::Uuid => uuid::Uuid::parse_str(raw).map(Value::Uuid).unwrap_or_else(|_| Value::Text(raw.to_string())),
        _ => Value::Text(raw.to_string()),
    }
}

/// The unit of work. Holds the identity map, the listener registry, and a
/// monotonic construction-order counter used to break ties in dependency
/// ordering (§4.3); borrows its collaborators (`db`, `registry`, `factory`)
/// rather than owning them, since an application typically keeps one of each
/// alive for the lifetime of many short-lived engines (one per request/unit
/// of work, per §5's usage pattern).
pub struct Engine<'a> {
    db: &'a dyn Database,
    registry: &'a dyn MetadataRegistry,
    factory: &'a dyn EntityFactory,
    config: EngineConfig,
    identity_map: IdentityMap,
    dispatcher: EventDispatcher,
    construction_order: HashMap<EntityHandle, u64>,
    next_construction_order: u64,
}

impl<'a> Engine<'a> {
    pub fn new(
        db: &'a dyn Database,
        registry: &'a dyn MetadataRegistry,
        factory: &'a dyn EntityFactory,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            registry,
            factory,
            config,
            identity_map: IdentityMap::new(),
            dispatcher: EventDispatcher::new(),
            construction_order: HashMap::new(),
            next_construction_order: 0,
        }
    }

    pub fn register_listener(&mut self, event: LifecycleEvent, listener: Box<dyn Listener>) {
        self.dispatcher.register(event, listener);
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Direct mutable access to a managed entity, for callers that want to
    /// change a field outside of `merge()`/`refresh()` — e.g. an
    /// application form handler writing straight into the tracked instance.
    /// The next `flush()` picks up whatever change detection finds.
    pub fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    pub fn get_repository(&self, class: &str) -> Result<Repository<'a>> {
        Repository::new(class, self.registry, self.factory, self.db, self.config.max_hydration_depth)
    }

    fn record_construction_order(&mut self, handle: EntityHandle) {
        if !self.construction_order.contains_key(&handle) {
            let order = self.next_construction_order;
            self.next_construction_order += 1;
            self.construction_order.insert(handle, order);
        }
    }

    /// Starts tracking `entity`. If it already carries a primary key matching
    /// an entity already tracked under that (class, key), the existing
    /// handle wins and `entity` is discarded (§4.1's tie-break rule). A
    /// primary key with no matching entry is treated as an already-existing
    /// row coming back under management — the same outcome `merge()` would
    /// produce — rather than scheduling a spurious INSERT; only a keyless
    /// entity is registered `New`.
    pub fn persist(&mut self, entity: Box<dyn Entity>) -> Result<EntityHandle> {
        let class = entity.class_name().to_string();
        let pk = entity.primary_key();

        if let Some(pk) = &pk {
            if let Some(handle) = self.identity_map.get_by_id(&class, pk) {
                let lifecycle = self
                    .identity_map
                    .get_metadata(handle)
                    .map(|m| m.lifecycle)
                    .ok_or_else(|| OrmError::state("persist: handle vanished"))?;
                return match lifecycle {
                    EntityLifecycleState::Removed => {
                        Err(OrmError::state("cannot persist an entity queued for removal"))
                    }
                    _ => Ok(handle),
                };
            }
        }

        let metadata = self.registry.get(&class)?;
        let lifecycle = if pk.is_some() { EntityLifecycleState::Managed } else { EntityLifecycleState::New };
        let snapshot = if lifecycle == EntityLifecycleState::Managed {
            capture_snapshot(entity.as_ref(), metadata)
        } else {
            HashMap::new()
        };
        let handle = self.identity_map.add(entity, pk, lifecycle, snapshot);
        self.record_construction_order(handle);
        self.cascade_persist_related(handle)?;
        Ok(handle)
    }

    /// Walks `handle`'s owning relations looking for `RelatedValue::New`
    /// (an inline-constructed related entity the caller never called
    /// `persist()` on directly — scenario 2 in SPEC_FULL.md §8) and
    /// recursively persists each one, converting the field to `Pending`
    /// until flush resolves it to a concrete id.
    ///
    /// Every owning relation is cascaded unconditionally: `RelationInfo`
    /// carries no per-relation cascade flag to consult, so a `New` value
    /// found in any owning field is always picked up.
    fn cascade_persist_related(&mut self, handle: EntityHandle) -> Result<()> {
        let class = self
            .identity_map
            .get_metadata(handle)
            .ok_or_else(|| OrmError::state("cascade persist: handle vanished"))?
            .class
            .clone();
        let metadata = self.registry.get(&class)?.clone();

        for relation in &metadata.relations {
            if owning_fk_column(relation).is_none() {
                continue;
            }
            let field = relation.field();
            let taken = self
                .identity_map
                .get_entity_mut(handle)
                .ok_or_else(|| OrmError::state("cascade persist: entity vanished"))?
                .take_relation_new(field);
            let Some(related) = taken else { continue };
            let related_handle = self.persist(related)?;
            self.identity_map
                .get_entity_mut(handle)
                .ok_or_else(|| OrmError::state("cascade persist: entity vanished"))?
                .set_relation_pending(field, related_handle);
        }
        Ok(())
    }

    /// Requires a primary key. Copies `entity`'s scalar fields onto whatever
    /// instance is already tracked for that (class, key) and marks it
    /// `Managed`; with no existing entry, registers `entity` itself fresh.
    pub fn merge(&mut self, entity: Box<dyn Entity>) -> Result<EntityHandle> {
        let class = entity.class_name().to_string();
        let pk = entity
            .primary_key()
            .ok_or_else(|| OrmError::state("merge() requires an entity with a primary key"))?;

        if let Some(handle) = self.identity_map.get_by_id(&class, &pk) {
            let metadata = self.registry.get(&class)?.clone();
            {
                let existing = self
                    .identity_map
                    .get_entity_mut(handle)
                    .ok_or_else(|| OrmError::state("merge: handle vanished"))?;
                for (field, _column) in &metadata.columns {
                    if field == &metadata.id_field {
                        continue;
                    }
                    if let Some(value) = entity.get_column(field) {
                        existing.set_column(field, value);
                    }
                }
            }
            self.identity_map.set_lifecycle(handle, EntityLifecycleState::Managed);
            return Ok(handle);
        }

        let metadata = self.registry.get(&class)?;
        let snapshot = capture_snapshot(entity.as_ref(), metadata);
        let handle = self.identity_map.add(entity, Some(pk), EntityLifecycleState::Managed, snapshot);
        self.record_construction_order(handle);
        Ok(handle)
    }

    /// Stops tracking `handle` entirely. `Entity` instances are owned by the
    /// identity map with no separate caller-held reference to hand back, so
    /// "detach" here means erasing the slot rather than leaving a
    /// `Detached`-tagged one behind; a later `merge()`/`persist()` of a
    /// conceptually re-attached object is indistinguishable from one the
    /// engine has never seen and is simply registered fresh.
    pub fn detach(&mut self, handle: EntityHandle) -> Result<()> {
        self.identity_map.remove(handle);
        self.construction_order.remove(&handle);
        Ok(())
    }

    /// Transitions `handle` to `Removed`. Actual deletion happens at the next
    /// `flush()`. Related entities are not cascade-removed: `RelationInfo`
    /// carries no cascade flag, so only the entity explicitly passed here is
    /// queued.
    pub fn remove(&mut self, handle: EntityHandle) -> Result<()> {
        let lifecycle = self
            .identity_map
            .get_metadata(handle)
            .map(|m| m.lifecycle)
            .ok_or_else(|| OrmError::state("remove: unknown handle"))?;
        if !lifecycle.can_transition_to(EntityLifecycleState::Removed) {
            return Err(OrmError::state("entity cannot be removed from its current lifecycle state"));
        }
        self.identity_map.set_lifecycle(handle, EntityLifecycleState::Removed);
        Ok(())
    }

    /// Re-reads `handle`'s row from the database and overwrites the managed
    /// instance's fields, discarding any unflushed in-memory changes.
    pub async fn refresh(&mut self, handle: EntityHandle) -> Result<()> {
        let state = self
            .identity_map
            .get_metadata(handle)
            .ok_or_else(|| OrmError::state("refresh: unknown handle"))?;
        let class = state.class.clone();
        let metadata = self.registry.get(&class)?.clone();
        let pk = self
            .identity_map
            .get_entity(handle)
            .and_then(|e| e.primary_key())
            .ok_or_else(|| OrmError::state("refresh: entity has no primary key"))?;

        let id_column = metadata
            .column(&metadata.id_field)
            .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
            .column_name
            .clone();
        let mut select = Select::new();
        select.from(metadata.table.clone(), None).r#where(id_column, pk, Comparison::Eq, Link::And);
        let row = select
            .fetch_one(self.db)
            .await?
            .ok_or_else(|| OrmError::state("refresh: row no longer exists in the database"))?;

        {
            let entity = self
                .identity_map
                .get_entity_mut(handle)
                .ok_or_else(|| OrmError::state("refresh: entity vanished"))?;
            for (field, column) in &metadata.columns {
                if field == &metadata.id_field {
                    continue;
                }
                if let Some(value) = row.get(&column.column_name) {
                    entity.set_column(field, value.clone());
                }
            }
            for relation in &metadata.relations {
                if let Some(fk_column) = owning_fk_column(relation) {
                    if let Some(value) = row.get(fk_column) {
                        entity.set_relation_id(relation.field(), if value.is_null() { None } else { Some(value.clone()) });
                    }
                }
            }
        }

        let snapshot = {
            let entity = self
                .identity_map
                .get_entity(handle)
                .ok_or_else(|| OrmError::state("refresh: entity vanished"))?;
            capture_snapshot(entity, &metadata)
        };
        self.identity_map.replace_snapshot(handle, snapshot);
        self.identity_map.set_lifecycle(handle, EntityLifecycleState::Managed);
        Ok(())
    }

    /// Looks up an entity of `class` by primary key, consulting the identity
    /// map before the database.
    pub async fn find(&mut self, class: &str, primary_key: Value) -> Result<Option<EntityHandle>> {
        let repo = self.get_repository(class)?;
        let handle = repo.find(primary_key, &mut self.identity_map).await?;
        if let Some(h) = handle {
            self.record_construction_order(h);
        }
        Ok(handle)
    }

    /// Drops every tracked entity without touching the database.
    pub fn clear(&mut self) {
        self.identity_map.clear();
        self.construction_order.clear();
    }

    // -- flush -----------------------------------------------------------

    /// Runs the full flush protocol inside a transaction (unless
    /// `EngineConfig::owns_transaction` is `false`, in which case the caller
    /// is assumed to already have one open). On error the transaction is
    /// rolled back; in-memory state is not (§4.5's failure-mode note).
    pub async fn flush(&mut self) -> Result<()> {
        tracing::debug!("starting flush");
        if self.config.owns_transaction {
            self.db.begin_transaction().await?;
        }
        let result = self.flush_inner().await;
        match &result {
            Ok(()) => {
                if self.config.owns_transaction {
                    self.db.commit().await?;
                }
                tracing::debug!("flush committed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "flush failed, rolling back");
                if self.config.owns_transaction {
                    let _ = self.db.rollback().await;
                }
            }
        }
        result
    }

    /// The bounded re-entrancy loop (§4.5 steps 1/5/9/14, §9's postFlush cap
    /// decision). SPEC_FULL.md describes three separate re-entrancy points —
    /// listeners scheduling new work during `postPersist`, `postUpdate`, and
    /// `postFlush` — but step 14 already spells out "the entire protocol
    /// re-runs, bounded by the same iteration cap" for the `postFlush` case;
    /// applying that same shape uniformly to all three collapses them into
    /// one outer loop instead of three independently-scoped ones, which is a
    /// generalization of the spec's own rule rather than a deviation from it.
    /// `scheduled` only ever carries brand-new entities a listener hands back,
    /// so it's what drives re-iterating this loop; a listener editing a
    /// managed entity's fields in place is caught separately, right where it
    /// happens, by `reconcile_listener_mutation`.
    async fn flush_inner(&mut self) -> Result<()> {
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > self.config.max_flush_iterations {
                return Err(OrmError::state(
                    "flush exceeded max_flush_iterations; listener re-entrancy did not converge",
                ));
            }

            let mut scheduled: Vec<Box<dyn Entity>> = Vec::new();
            self.dispatch_flush_event(LifecycleEvent::PreFlush, &mut scheduled)?;
            self.absorb_scheduled(&mut scheduled)?;

            let mut work = self.classify_handles()?;

            let insert_order = self.order_for_insert(&work.inserts)?;
            for broken in &insert_order.broken_edges {
                tracing::warn!(
                    dependent = %broken.dependent,
                    must_precede = %broken.must_precede,
                    "broke a dependency cycle; the fk will be deferred to a follow-up update"
                );
            }
            let deferred = self.run_insert_phase(&insert_order, &mut scheduled).await?;
            self.absorb_scheduled(&mut scheduled)?;
            self.apply_deferred_fk_updates(&deferred).await?;

            self.run_update_phase(&work.updates, &mut work.change_sets, &mut scheduled).await?;
            self.absorb_scheduled(&mut scheduled)?;

            self.process_many_to_many(&work.change_sets).await?;

            let delete_order = self.order_for_delete(&work.removals)?;
            self.run_delete_phase(&delete_order, &mut scheduled).await?;
            self.absorb_scheduled(&mut scheduled)?;

            self.dispatch_flush_event(LifecycleEvent::PostFlush, &mut scheduled)?;
            let more_work = !scheduled.is_empty();
            self.absorb_scheduled(&mut scheduled)?;

            if !more_work {
                tracing::debug!(iterations, "flush converged");
                return Ok(());
            }
        }
    }

    fn absorb_scheduled(&mut self, scheduled: &mut Vec<Box<dyn Entity>>) -> Result<()> {
        for entity in scheduled.drain(..) {
            self.persist(entity)?;
        }
        Ok(())
    }

    fn dispatch_entity_event(
        &mut self,
        event: LifecycleEvent,
        handle: EntityHandle,
        change_set: Option<&ChangeSet>,
        scheduled: &mut Vec<Box<dyn Entity>>,
    ) -> Result<()> {
        let entity = self.identity_map.get_entity_mut(handle);
        let mut ctx = EventContext { event, entity, handle: Some(handle), change_set, scheduled };
        self.dispatcher.dispatch(&mut ctx)
    }

    fn dispatch_flush_event(&mut self, event: LifecycleEvent, scheduled: &mut Vec<Box<dyn Entity>>) -> Result<()> {
        let mut ctx = EventContext { event, entity: None, handle: None, change_set: None, scheduled };
        self.dispatcher.dispatch(&mut ctx)
    }

    /// Splits the identity map into insert/update/removal candidates. New
    /// entities get a change set computed against an empty snapshot purely
    /// so `to_link`/`to_unlink` many-to-many membership can be extracted
    /// from it later; their scalar/relation fields are read directly by
    /// `run_insert_phase` instead.
    fn classify_handles(&self) -> Result<Work> {
        let handles: Vec<EntityHandle> = self.identity_map.handles().collect();
        let mut work = Work {
            inserts: Vec::new(),
            updates: Vec::new(),
            removals: Vec::new(),
            change_sets: HashMap::new(),
        };
        let empty_snapshot = HashMap::new();

        for handle in handles {
            let state = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("classify: handle vanished"))?;
            match state.lifecycle {
                EntityLifecycleState::New => {
                    let entity = self
                        .identity_map
                        .get_entity(handle)
                        .ok_or_else(|| OrmError::state("classify: entity vanished"))?;
                    let metadata = self.registry.get(&state.class)?;
                    let change_set = detect_changes(entity, metadata, &empty_snapshot);
                    work.change_sets.insert(handle, change_set);
                    work.inserts.push(handle);
                }
                EntityLifecycleState::Removed => work.removals.push(handle),
                EntityLifecycleState::Managed => {
                    let entity = self
                        .identity_map
                        .get_entity(handle)
                        .ok_or_else(|| OrmError::state("classify: entity vanished"))?;
                    let metadata = self.registry.get(&state.class)?;
                    let change_set = detect_changes(entity, metadata, &state.snapshot);
                    if !change_set.is_empty() {
                        work.change_sets.insert(handle, change_set);
                        work.updates.push(handle);
                    }
                }
                EntityLifecycleState::Detached => {}
            }
        }
        Ok(work)
    }

    fn order_for_insert(&self, inserts: &[EntityHandle]) -> Result<dependency::FlushOrder> {
        let insert_set: HashSet<EntityHandle> = inserts.iter().copied().collect();
        let mut nodes = Vec::with_capacity(inserts.len());
        let mut edges = Vec::new();

        for &handle in inserts {
            let state = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("insert ordering: handle vanished"))?;
            nodes.push(dependency::Node {
                handle,
                class: state.class.clone(),
                construction_order: self.construction_order.get(&handle).copied().unwrap_or(0),
            });

            let entity = self
                .identity_map
                .get_entity(handle)
                .ok_or_else(|| OrmError::state("insert ordering: entity vanished"))?;
            let metadata = self.registry.get(&state.class)?;
            for relation in &metadata.relations {
                if owning_fk_column(relation).is_none() {
                    continue;
                }
                if let RelatedValue::Pending(target) = entity.get_relation(relation.field()) {
                    if insert_set.contains(&target) {
                        edges.push(dependency::Edge { dependent: handle, must_precede: target });
                    }
                }
            }
        }

        dependency::order(nodes, edges)
    }

    fn order_for_delete(&self, removals: &[EntityHandle]) -> Result<dependency::FlushOrder> {
        let removal_set: HashSet<EntityHandle> = removals.iter().copied().collect();
        let mut nodes = Vec::with_capacity(removals.len());
        let mut edges = Vec::new();

        for &handle in removals {
            let state = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("delete ordering: handle vanished"))?;
            nodes.push(dependency::Node {
                handle,
                class: state.class.clone(),
                construction_order: self.construction_order.get(&handle).copied().unwrap_or(0),
            });

            let entity = self
                .identity_map
                .get_entity(handle)
                .ok_or_else(|| OrmError::state("delete ordering: entity vanished"))?;
            let metadata = self.registry.get(&state.class)?;
            for relation in &metadata.relations {
                if owning_fk_column(relation).is_none() {
                    continue;
                }
                if let RelatedValue::Id(target_pk) = entity.get_relation(relation.field()) {
                    if let Some(target_handle) = self.identity_map.get_by_id(relation.target_class(), &target_pk) {
                        if removal_set.contains(&target_handle) {
                            // Reverse of the insertion edge: the referencer
                            // (`handle`) must be deleted before the row it
                            // points at (§4.3).
                            edges.push(dependency::Edge { dependent: target_handle, must_precede: handle });
                        }
                    }
                }
            }
        }

        dependency::order(nodes, edges)
    }

    async fn run_insert_phase(
        &mut self,
        flush_order: &dependency::FlushOrder,
        scheduled: &mut Vec<Box<dyn Entity>>,
    ) -> Result<Vec<DeferredFk>> {
        let mut broken_by_dependent: HashMap<EntityHandle, HashSet<EntityHandle>> = HashMap::new();
        for broken in &flush_order.broken_edges {
            broken_by_dependent.entry(broken.dependent).or_default().insert(broken.must_precede);
        }

        let mut deferred = Vec::new();

        for &handle in &flush_order.order {
            self.dispatch_entity_event(LifecycleEvent::PrePersist, handle, None, scheduled)?;

            let class = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("insert phase: handle vanished before its turn"))?
                .class
                .clone();
            let metadata = self.registry.get(&class)?.clone();

            let mut assignments: Vec<(&str, Value)> = Vec::new();
            {
                let entity = self
                    .identity_map
                    .get_entity(handle)
                    .ok_or_else(|| OrmError::state("insert phase: entity vanished before its turn"))?;

                for (field, column) in &metadata.columns {
                    if field == &metadata.id_field && column.auto_increment {
                        continue;
                    }
                    if let Some(v) = entity.get_column(field) {
                        assignments.push((column.column_name.as_str(), v));
                    }
                }

                for relation in &metadata.relations {
                    let Some(fk_column) = owning_fk_column(relation) else { continue };
                    let field = relation.field();
                    let broken_targets = broken_by_dependent.get(&handle);
                    let resolved = match entity.get_relation(field) {
                        RelatedValue::None => Value::Null,
                        RelatedValue::Id(v) => v,
                        RelatedValue::Pending(target) => {
                            if broken_targets.map_or(false, |targets| targets.contains(&target)) {
                                deferred.push(DeferredFk {
                                    dependent: handle,
                                    field: field.to_string(),
                                    fk_column: fk_column.to_string(),
                                    target,
                                });
                                Value::Null
                            } else {
                                self.identity_map
                                    .get_entity(target)
                                    .and_then(|e| e.primary_key())
                                    .unwrap_or(Value::Null)
                            }
                        }
                        RelatedValue::New(_) => Value::Null,
                    };
                    assignments.push((fk_column, resolved));
                }
            }

            let mut insert = Insert::new();
            insert.into(metadata.table.clone());
            insert.set(assignments)?;
            let affected = insert.execute(self.db).await?;
            tracing::debug!(class = %class, affected, "emitted insert");

            let id_is_auto_increment = metadata.column(&metadata.id_field).map_or(false, |c| c.auto_increment);
            if id_is_auto_increment {
                let raw_id = self.db.last_insert_id().await?;
                let data_type = metadata
                    .column(&metadata.id_field)
                    .map(|c| c.sql_type)
                    .unwrap_or(DataType::Text);
                let pk = parse_id_value(&raw_id, data_type);
                self.identity_map.update_id(handle, pk);
            }

            let snapshot = {
                let entity = self
                    .identity_map
                    .get_entity(handle)
                    .ok_or_else(|| OrmError::state("insert phase: entity vanished after insert"))?;
                capture_snapshot(entity, &metadata)
            };
            self.identity_map.replace_snapshot(handle, snapshot);
            self.identity_map.set_lifecycle(handle, EntityLifecycleState::Managed);

            self.dispatch_entity_event(LifecycleEvent::PostPersist, handle, None, scheduled)?;
            self.reconcile_listener_mutation(handle, &metadata).await?;
        }

        Ok(deferred)
    }

    /// Catches a listener editing a managed entity's fields in place from
    /// `postPersist`/`postUpdate` (§8 scenario 5): those handlers run after
    /// the phase's own snapshot/update bookkeeping, so a plain field
    /// assignment leaves nothing in `scheduled` for the flush loop to notice.
    /// Diffs the entity against the snapshot just captured and, if it
    /// changed, emits the follow-up UPDATE immediately, in the same flush.
    async fn reconcile_listener_mutation(&mut self, handle: EntityHandle, metadata: &EntityMetadata) -> Result<()> {
        let snapshot_before = self
            .identity_map
            .get_metadata(handle)
            .ok_or_else(|| OrmError::state("post-event reconcile: handle vanished"))?
            .snapshot
            .clone();
        let change_set = {
            let entity = self
                .identity_map
                .get_entity(handle)
                .ok_or_else(|| OrmError::state("post-event reconcile: entity vanished"))?;
            detect_changes(entity, metadata, &snapshot_before)
        };
        if change_set.is_empty() {
            return Ok(());
        }

        let id_column = metadata
            .column(&metadata.id_field)
            .ok_or_else(|| OrmError::metadata(format!("{} has no column info for its id field", metadata.class)))?
            .column_name
            .clone();
        let pk = self
            .identity_map
            .get_entity(handle)
            .and_then(|e| e.primary_key())
            .ok_or_else(|| OrmError::state("post-event reconcile: entity has no primary key"))?;

        if let Some(mut update) = self.update_statement_for(metadata, pk, &id_column, &change_set)? {
            let affected = update.execute(self.db).await?;
            tracing::debug!(
                class = %metadata.class,
                affected,
                "emitted follow-up update after a listener mutated a managed entity in place"
            );
        }

        let snapshot_after = {
            let entity = self
                .identity_map
                .get_entity(handle)
                .ok_or_else(|| OrmError::state("post-event reconcile: entity vanished after update"))?;
            capture_snapshot(entity, metadata)
        };
        self.identity_map.replace_snapshot(handle, snapshot_after);
        Ok(())
    }

    /// Builds the `UPDATE` for a change set, or `None` if it touches no
    /// columns (a change set containing only many-to-many link changes).
    fn update_statement_for(
        &self,
        metadata: &EntityMetadata,
        pk: Value,
        id_column: &str,
        change_set: &ChangeSet,
    ) -> Result<Option<Update>> {
        let mut update = Update::new();
        update.table(metadata.table.clone());
        let mut touched_columns = false;
        for (field, change) in &change_set.fields {
            match change {
                FieldChange::Scalar { new, .. } => {
                    let column = metadata
                        .column(field)
                        .ok_or_else(|| OrmError::metadata(format!("{}.{field} has no column info", metadata.class)))?;
                    update.set(column.column_name.clone(), new.clone())?;
                    touched_columns = true;
                }
                FieldChange::Relation { new, .. } => {
                    let fk_column = metadata
                        .relation(field)
                        .and_then(owning_fk_column)
                        .ok_or_else(|| {
                            OrmError::metadata(format!("{}.{field} is not an owning relation", metadata.class))
                        })?
                        .to_string();
                    let value = match new {
                        RefChange::Null => Value::Null,
                        RefChange::Id(v) => v.clone(),
                        RefChange::PendingRef(target) => self
                            .identity_map
                            .get_entity(*target)
                            .and_then(|e| e.primary_key())
                            .unwrap_or(Value::Null),
                    };
                    update.set(fk_column, value)?;
                    touched_columns = true;
                }
            }
        }

        if touched_columns {
            update.r#where(id_column.to_string(), pk, Comparison::Eq, Link::And);
            Ok(Some(update))
        } else {
            Ok(None)
        }
    }

    async fn apply_deferred_fk_updates(&mut self, deferred: &[DeferredFk]) -> Result<()> {
        for fk in deferred {
            let target_pk = self
                .identity_map
                .get_entity(fk.target)
                .and_then(|e| e.primary_key())
                .ok_or_else(|| OrmError::cycle_break("deferred fk target still has no primary key after its insert"))?;

            let dependent_class = self
                .identity_map
                .get_metadata(fk.dependent)
                .ok_or_else(|| OrmError::state("deferred fk update: dependent vanished"))?
                .class
                .clone();
            let metadata = self.registry.get(&dependent_class)?.clone();
            let id_column = metadata
                .column(&metadata.id_field)
                .ok_or_else(|| OrmError::metadata(format!("{dependent_class} has no column info for its id field")))?
                .column_name
                .clone();
            let dependent_pk = self
                .identity_map
                .get_entity(fk.dependent)
                .and_then(|e| e.primary_key())
                .ok_or_else(|| OrmError::state("deferred fk update: dependent has no primary key"))?;

            let mut update = Update::new();
            update.table(metadata.table.clone());
            update.set(fk.fk_column.clone(), target_pk.clone())?;
            update.r#where(id_column, dependent_pk, Comparison::Eq, Link::And);
            let affected = update.execute(self.db).await?;
            tracing::debug!(class = %dependent_class, affected, "applied deferred fk update after cycle break");

            if let Some(entity) = self.identity_map.get_entity_mut(fk.dependent) {
                entity.set_relation_id(&fk.field, Some(target_pk));
            }
            let snapshot = {
                let entity = self
                    .identity_map
                    .get_entity(fk.dependent)
                    .ok_or_else(|| OrmError::state("deferred fk update: dependent vanished"))?;
                capture_snapshot(entity, &metadata)
            };
            self.identity_map.replace_snapshot(fk.dependent, snapshot);
        }
        Ok(())
    }

    async fn run_update_phase(
        &mut self,
        updates: &[EntityHandle],
        change_sets: &mut HashMap<EntityHandle, ChangeSet>,
        scheduled: &mut Vec<Box<dyn Entity>>,
    ) -> Result<()> {
        for &handle in updates {
            let state = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("update phase: handle vanished"))?;
            let class = state.class.clone();
            let snapshot_before = state.snapshot.clone();
            let metadata = self.registry.get(&class)?.clone();

            let change_set_before = {
                let entity = self
                    .identity_map
                    .get_entity(handle)
                    .ok_or_else(|| OrmError::state("update phase: entity vanished"))?;
                detect_changes(entity, &metadata, &snapshot_before)
            };
            if change_set_before.is_empty() {
                // A listener earlier in this pass already cleaned this up.
                continue;
            }

            self.dispatch_entity_event(LifecycleEvent::PreUpdate, handle, Some(&change_set_before), scheduled)?;

            let change_set = {
                let entity = self
                    .identity_map
                    .get_entity(handle)
                    .ok_or_else(|| OrmError::state("update phase: entity vanished"))?;
                detect_changes(entity, &metadata, &snapshot_before)
            };
            if change_set.is_empty() {
                change_sets.insert(handle, change_set);
                continue;
            }

            let id_column = metadata
                .column(&metadata.id_field)
                .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
                .column_name
                .clone();
            let pk = self
                .identity_map
                .get_entity(handle)
                .and_then(|e| e.primary_key())
                .ok_or_else(|| OrmError::state("update phase: managed entity has no primary key"))?;

            if let Some(mut update) = self.update_statement_for(&metadata, pk, &id_column, &change_set)? {
                let affected = update.execute(self.db).await?;
                tracing::debug!(class = %class, affected, "emitted update");
            }

            let snapshot_after = {
                let entity = self
                    .identity_map
                    .get_entity(handle)
                    .ok_or_else(|| OrmError::state("update phase: entity vanished after update"))?;
                capture_snapshot(entity, &metadata)
            };
            self.identity_map.replace_snapshot(handle, snapshot_after);
            change_sets.insert(handle, change_set.clone());

            self.dispatch_entity_event(LifecycleEvent::PostUpdate, handle, Some(&change_set), scheduled)?;
            self.reconcile_listener_mutation(handle, &metadata).await?;
        }
        Ok(())
    }

    /// Emits DELETEs then INSERTs against each many-to-many link table for
    /// every membership change recorded in `change_sets` (§4.2 step 10). Runs
    /// after the insert/update phases so every owner already has a primary
    /// key to join on.
    async fn process_many_to_many(&mut self, change_sets: &HashMap<EntityHandle, ChangeSet>) -> Result<()> {
        for (&handle, change_set) in change_sets {
            if change_set.to_link.is_empty() && change_set.to_unlink.is_empty() {
                continue;
            }
            let class = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("link processing: handle vanished"))?
                .class
                .clone();
            let metadata = self.registry.get(&class)?.clone();
            let own_pk = self
                .identity_map
                .get_entity(handle)
                .and_then(|e| e.primary_key())
                .ok_or_else(|| OrmError::state("link processing: owner has no primary key"))?;

            for (field, related_pk) in &change_set.to_unlink {
                let Some(RelationInfo::ManyToMany { link_table, join_column, inverse_join_column, .. }) =
                    metadata.relation(field)
                else {
                    continue;
                };
                let mut delete = Delete::new();
                delete
                    .from(link_table.clone())
                    .r#where(join_column.clone(), own_pk.clone(), Comparison::Eq, Link::And)
                    .r#where(inverse_join_column.clone(), related_pk.clone(), Comparison::Eq, Link::And);
                let affected = delete.execute(self.db).await?;
                tracing::debug!(table = %link_table, affected, "unlinked a many-to-many row");
            }

            for (field, related_pk) in &change_set.to_link {
                let Some(RelationInfo::ManyToMany { link_table, join_column, inverse_join_column, .. }) =
                    metadata.relation(field)
                else {
                    continue;
                };
                let mut insert = Insert::new();
                insert.into(link_table.clone());
                insert.set(vec![
                    (join_column.as_str(), own_pk.clone()),
                    (inverse_join_column.as_str(), related_pk.clone()),
                ])?;
                insert.ignore();
                insert.execute(self.db).await?;
                tracing::debug!(table = %link_table, "linked a many-to-many row");
            }
        }
        Ok(())
    }

    async fn run_delete_phase(
        &mut self,
        flush_order: &dependency::FlushOrder,
        scheduled: &mut Vec<Box<dyn Entity>>,
    ) -> Result<()> {
        for &handle in &flush_order.order {
            self.dispatch_entity_event(LifecycleEvent::PreRemove, handle, None, scheduled)?;
        }

        for &handle in &flush_order.order {
            let state = self
                .identity_map
                .get_metadata(handle)
                .ok_or_else(|| OrmError::state("delete phase: handle vanished"))?;
            let class = state.class.clone();
            let metadata = self.registry.get(&class)?.clone();
            let pk = self
                .identity_map
                .get_entity(handle)
                .and_then(|e| e.primary_key())
                .ok_or_else(|| OrmError::state("delete phase: entity has no primary key"))?;
            let id_column = metadata
                .column(&metadata.id_field)
                .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
                .column_name
                .clone();

            let mut delete = Delete::new();
            delete.from(metadata.table.clone()).r#where(id_column, pk, Comparison::Eq, Link::And);
            let affected = delete.execute(self.db).await?;
            tracing::debug!(class = %class, affected, "emitted delete");
        }

        for &handle in &flush_order.order {
            self.dispatch_entity_event(LifecycleEvent::PostRemove, handle, None, scheduled)?;
            self.identity_map.remove(handle);
        }
        Ok(())
    }
}
