//! The usual import set for application code: `use rustorm::prelude::*;`.

pub use crate::config::EngineConfig;
pub use crate::database::{Database, Row, Statement};
pub use crate::engine::Engine;
pub use crate::entity::{Entity, EntityFactory, EntityHandle, RelatedValue, StaticEntityFactory};
pub use crate::error::{OrmError, Result};
pub use crate::events::{EventContext, EventDispatcher, FnListener, LifecycleEvent, Listener};
pub use crate::metadata::{ColumnInfo, EntityMetadata, MetadataRegistry, RelationInfo, StaticMetadataRegistry};
pub use crate::query::{Comparison, Delete, Direction, Insert, Link, Select, Update};
pub use crate::repository::Repository;
pub use crate::value::{DataType, Value};
pub use rustorm_derive::Entity;
