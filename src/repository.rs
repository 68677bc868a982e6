// ============================================================================
// Repository
// ============================================================================
//
// A thin, per-class handle onto the query builder and hydrator: `find()` and
// `find_all()` are the read side of the engine (§6's "public engine API"),
// letting a caller fetch managed entities without reaching for `Select`
// directly. `Engine::get_repository` is the only place one of these gets
// constructed.

use crate::database::Database;
use crate::entity::{EntityFactory, EntityHandle};
use crate::error::{OrmError, Result};
use crate::hydrator::Hydrator;
use crate::identity_map::IdentityMap;
use crate::metadata::MetadataRegistry;
use crate::query::{Comparison, Link, Select};
use crate::value::Value;

pub struct Repository<'a> {
    class: String,
    table: String,
    id_column: String,
    registry: &'a dyn MetadataRegistry,
    factory: &'a dyn EntityFactory,
    db: &'a dyn Database,
    max_depth: u32,
}

impl<'a> Repository<'a> {
    pub(crate) fn new(
        class: &str,
        registry: &'a dyn MetadataRegistry,
        factory: &'a dyn EntityFactory,
        db: &'a dyn Database,
        max_depth: u32,
    ) -> Result<Self> {
        let metadata = registry.get(class)?;
        let id_column = metadata
            .column(&metadata.id_field)
            .ok_or_else(|| OrmError::metadata(format!("{class} has no column info for its id field")))?
            .column_name
            .clone();
        Ok(Self {
            class: class.to_string(),
            table: metadata.table.clone(),
            id_column,
            registry,
            factory,
            db,
            max_depth,
        })
    }

    /// A `Select` pre-seeded with this class's table, for building custom
    /// queries; rows still need to be run through the hydrator by hand.
    pub fn query(&self) -> Select {
        let mut select = Select::new();
        select.from(self.table.clone(), None);
        select
    }

    fn hydrator(&self) -> Hydrator<'a> {
        Hydrator {
            registry: self.registry,
            factory: self.factory,
            db: self.db,
            max_depth: self.max_depth,
        }
    }

    /// Looks up a single row by primary key, consulting `identity_map` before
    /// issuing a query.
    pub async fn find(&self, primary_key: Value, identity_map: &mut IdentityMap) -> Result<Option<EntityHandle>> {
        if let Some(existing) = identity_map.get_by_id(&self.class, &primary_key) {
            return Ok(Some(existing));
        }
        let mut select = self.query();
        select.r#where(self.id_column.clone(), primary_key, Comparison::Eq, Link::And);
        let Some(row) = select.fetch_one(self.db).await? else {
            return Ok(None);
        };
        let handle = self.hydrator().hydrate_row(&self.class, &row, identity_map).await?;
        Ok(Some(handle))
    }

    /// Loads every row of this class, ordered by primary key ascending.
    pub async fn find_all(&self, identity_map: &mut IdentityMap) -> Result<Vec<EntityHandle>> {
        let mut select = self.query();
        select.order_by(self.id_column.clone(), "ASC");
        let rows = select.fetch_all(self.db).await?;
        let hydrator = self.hydrator();
        let mut handles = Vec::with_capacity(rows.len());
        for row in &rows {
            handles.push(hydrator.hydrate_row(&self.class, row, identity_map).await?);
        }
        Ok(handles)
    }
}
