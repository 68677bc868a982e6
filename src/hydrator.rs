// ============================================================================
// Entity hydrator
// ============================================================================
//
// Converts result-set rows into managed entities, coalescing with whatever
// the identity map already holds and eagerly walking owned relations so that
// no proxy/lazy-loading object is ever needed (§1's non-goals, §4.6).
// Recursion depth is bounded by `EngineConfig::max_hydration_depth` via
// `async-recursion`, the same crate the teacher reaches for around its own
// recursive query evaluation.

use async_recursion::async_recursion;

use crate::change_detector::capture_snapshot;
use crate::database::{Database, Row};
use crate::entity::{Entity, EntityFactory, EntityHandle};
use crate::error::{OrmError, Result};
use crate::identity_map::{EntityLifecycleState, IdentityMap};
use crate::metadata::{MetadataRegistry, RelationInfo};
use crate::query::{Comparison, Link, Select};
use crate::value::Value;

pub struct Hydrator<'a> {
    pub registry: &'a dyn MetadataRegistry,
    pub factory: &'a dyn EntityFactory,
    pub db: &'a dyn Database,
    pub max_depth: u32,
}

impl<'a> Hydrator<'a> {
    pub async fn hydrate_row(
        &self,
        class: &str,
        row: &Row,
        identity_map: &mut IdentityMap,
    ) -> Result<EntityHandle> {
        self.hydrate_row_at_depth(class, row, identity_map, 0).await
    }

    #[async_recursion]
    async fn hydrate_row_at_depth(
        &self,
        class: &str,
        row: &Row,
        identity_map: &mut IdentityMap,
        depth: u32,
    ) -> Result<EntityHandle> {
        let metadata = self.registry.get(class)?;
        let id_column = &metadata
            .column(&metadata.id_field)
            .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
            .column_name;
        let primary_key = row
            .get(id_column)
            .cloned()
            .ok_or_else(|| OrmError::metadata(format!("row for {class} is missing its primary key column")))?;

        if let Some(existing) = identity_map.get_by_id(class, &primary_key) {
            return Ok(existing);
        }

        let mut entity = self
            .factory
            .create(class)
            .ok_or_else(|| OrmError::metadata(format!("no entity factory registered for {class}")))?;

        entity.set_primary_key(primary_key.clone());
        for (field, column) in &metadata.columns {
            if field == &metadata.id_field {
                continue;
            }
            if let Some(value) = row.get(&column.column_name) {
                entity.set_column(field, value.clone());
            }
        }
        for relation in &metadata.relations {
            if let RelationInfo::ManyToOne { field, fk_column, .. }
            | RelationInfo::OneToOne { field, fk_column, inverse: false, .. } = relation
            {
                if let Some(value) = row.get(fk_column) {
                    if !value.is_null() {
                        entity.set_relation_id(field, Some(value.clone()));
                    }
                }
            }
        }

        let snapshot = capture_snapshot(entity.as_ref(), metadata);
        let handle = identity_map.add(entity, Some(primary_key), EntityLifecycleState::Managed, snapshot);

        if depth < self.max_depth {
            self.eager_load_relations(class, handle, identity_map, depth).await?;
        }

        Ok(handle)
    }

    async fn eager_load_relations(
        &self,
        class: &str,
        handle: EntityHandle,
        identity_map: &mut IdentityMap,
        depth: u32,
    ) -> Result<()> {
        let metadata = self.registry.get(class)?.clone();
        let own_pk = identity_map
            .get_entity(handle)
            .and_then(|e| e.primary_key())
            .ok_or_else(|| OrmError::state("cannot eager-load relations for an entity without a primary key"))?;

        for relation in &metadata.relations {
            match relation {
                RelationInfo::ManyToOne { field, target_class, .. }
                | RelationInfo::OneToOne { field, target_class, inverse: false, .. } => {
                    let fk_value = identity_map.get_entity(handle).and_then(|e| match e.get_relation(field) {
                        crate::entity::RelatedValue::Id(v) => Some(v),
                        _ => None,
                    });
                    let Some(fk_value) = fk_value else { continue };
                    self.load_by_primary_key(target_class, &fk_value, identity_map, depth + 1).await?;
                }
                RelationInfo::OneToMany { target_class, mapped_by_field, .. } => {
                    self.load_collection(target_class, mapped_by_field, &own_pk, identity_map, depth + 1).await?;
                }
                RelationInfo::OneToOne { target_class, inverse: true, fk_column, .. } => {
                    self.load_collection(target_class, fk_column, &own_pk, identity_map, depth + 1).await?;
                }
                RelationInfo::ManyToMany { .. } => {
                    // Link-table traversal is driven by the engine's relation
                    // processing, not by hydration; no proxy object exists to
                    // populate here (§1 non-goals).
                }
            }
        }
        Ok(())
    }

    async fn load_by_primary_key(
        &self,
        class: &str,
        primary_key: &Value,
        identity_map: &mut IdentityMap,
        depth: u32,
    ) -> Result<()> {
        if identity_map.get_by_id(class, primary_key).is_some() {
            return Ok(());
        }
        let metadata = self.registry.get(class)?;
        let id_column = &metadata
            .column(&metadata.id_field)
            .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
            .column_name;
        let mut select = Select::new();
        select
            .from(metadata.table.clone(), None)
            .r#where(id_column.clone(), primary_key.clone(), Comparison::Eq, Link::And);
        if let Some(row) = select.fetch_one(self.db).await? {
            self.hydrate_row_at_depth(class, &row, identity_map, depth).await?;
        }
        Ok(())
    }

    async fn load_collection(
        &self,
        class: &str,
        fk_column: &str,
        owner_pk: &Value,
        identity_map: &mut IdentityMap,
        depth: u32,
    ) -> Result<()> {
        let metadata = self.registry.get(class)?;
        let mut select = Select::new();
        select
            .from(metadata.table.clone(), None)
            .r#where(fk_column.to_string(), owner_pk.clone(), Comparison::Eq, Link::And)
            .order_by(metadata.id_field.clone(), "ASC");
        let rows = select.fetch_all(self.db).await?;
        for row in rows {
            self.hydrate_row_at_depth(class, &row, identity_map, depth).await?;
        }
        Ok(())
    }
}

