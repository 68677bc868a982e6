// ============================================================================
// Metadata registry (consumed interface)
// ============================================================================
//
// The attribute reader that extracts table/column/relation information from
// domain classes is out of scope (SPEC_FULL.md §1); the engine only consumes
// a read-only registry. `StaticMetadataRegistry` is the bootstrap-time
// implementation an embedding application builds once and hands to the
// engine; `load_from_path` is left as a stub an application can fill in
// against its own schema-description format.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub sql_type: crate::value::DataType,
    pub nullable: bool,
    pub auto_increment: bool,
}

impl ColumnInfo {
    pub fn new(column_name: impl Into<String>, sql_type: crate::value::DataType) -> Self {
        Self {
            column_name: column_name.into(),
            sql_type,
            nullable: true,
            auto_increment: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelationInfo {
    ManyToOne {
        field: String,
        target_class: String,
        fk_column: String,
        nullable: bool,
    },
    OneToOne {
        field: String,
        target_class: String,
        fk_column: String,
        inverse: bool,
    },
    OneToMany {
        field: String,
        target_class: String,
        mapped_by_field: String,
    },
    ManyToMany {
        field: String,
        target_class: String,
        link_table: String,
        join_column: String,
        inverse_join_column: String,
    },
}

impl RelationInfo {
    pub fn field(&self) -> &str {
        match self {
            RelationInfo::ManyToOne { field, .. }
            | RelationInfo::OneToOne { field, .. }
            | RelationInfo::OneToMany { field, .. }
            | RelationInfo::ManyToMany { field, .. } => field,
        }
    }

    pub fn target_class(&self) -> &str {
        match self {
            RelationInfo::ManyToOne { target_class, .. }
            | RelationInfo::OneToOne { target_class, .. }
            | RelationInfo::OneToMany { target_class, .. }
            | RelationInfo::ManyToMany { target_class, .. } => target_class,
        }
    }

    /// `true` for relations whose foreign key this entity owns, i.e. the
    /// side the dependency manager and change detector must watch.
    pub fn is_owning_fk(&self) -> bool {
        matches!(
            self,
            RelationInfo::ManyToOne { .. } | RelationInfo::OneToOne { inverse: false, .. }
        )
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self, RelationInfo::ManyToMany { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub class: String,
    pub table: String,
    pub id_field: String,
    pub columns: Vec<(String, ColumnInfo)>,
    pub relations: Vec<RelationInfo>,
}

impl EntityMetadata {
    pub fn new(class: impl Into<String>, table: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            table: table.into(),
            id_field: id_field.into(),
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn with_column(mut self, field: impl Into<String>, column: ColumnInfo) -> Self {
        self.columns.push((field.into(), column));
        self
    }

    pub fn with_relation(mut self, relation: RelationInfo) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn column(&self, field: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|(f, _)| f == field).map(|(_, c)| c)
    }

    pub fn relation(&self, field: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.field() == field)
    }

    /// Owning relations whose FK column lives on this table — what the
    /// dependency manager needs to build "must precede" edges (§4.3).
    pub fn owning_relations(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.iter().filter(|r| r.is_owning_fk())
    }

    pub fn many_to_many_relations(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.iter().filter(|r| r.is_many_to_many())
    }
}

/// Read-only map from entity class name to `EntityMetadata` (§6).
pub trait MetadataRegistry: Send + Sync {
    fn get(&self, class_name: &str) -> Result<&EntityMetadata>;
    fn has(&self, class_name: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct StaticMetadataRegistry {
    entries: HashMap<String, EntityMetadata>,
}

impl StaticMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metadata: EntityMetadata) -> &mut Self {
        self.entries.insert(metadata.class.clone(), metadata);
        self
    }

    /// Bulk-load descriptors during bootstrap. Schema-description formats are
    /// out of scope for this engine (SPEC_FULL.md §1); this is a seam an
    /// embedding application fills in for its own format.
    pub fn load_from_path(&mut self, directory: &Path) -> Result<()> {
        Err(OrmError::metadata(format!(
            "load_from_path is not implemented by this engine; \
             the embedding application must populate the registry for '{}'",
            directory.display()
        )))
    }
}

impl MetadataRegistry for StaticMetadataRegistry {
    fn get(&self, class_name: &str) -> Result<&EntityMetadata> {
        self.entries
            .get(class_name)
            .ok_or_else(|| OrmError::metadata(format!("class not registered: {class_name}")))
    }

    fn has(&self, class_name: &str) -> bool {
        self.entries.contains_key(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn user_metadata() -> EntityMetadata {
        EntityMetadata::new("User", "users", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("username", ColumnInfo::new("username", DataType::Text).not_null())
            .with_relation(RelationInfo::ManyToOne {
                field: "unit".to_string(),
                target_class: "Unit".to_string(),
                fk_column: "unit_id".to_string(),
                nullable: true,
            })
    }

    #[test]
    fn registry_looks_up_by_class_name() {
        let mut registry = StaticMetadataRegistry::new();
        registry.register(user_metadata());
        assert!(registry.has("User"));
        assert!(!registry.has("Missing"));
        assert_eq!(registry.get("User").unwrap().table, "users");
    }

    #[test]
    fn missing_class_is_a_metadata_error() {
        let registry = StaticMetadataRegistry::new();
        let err = registry.get("Ghost").unwrap_err();
        assert!(matches!(err, OrmError::Metadata(_)));
    }

    #[test]
    fn owning_relations_filters_out_inverse_sides() {
        let metadata = user_metadata().with_relation(RelationInfo::OneToMany {
            field: "orders".to_string(),
            target_class: "Order".to_string(),
            mapped_by_field: "user".to_string(),
        });
        let owning: Vec<_> = metadata.owning_relations().collect();
        assert_eq!(owning.len(), 1);
        assert_eq!(owning[0].field(), "unit");
    }
}
