// ============================================================================
// Query builder
// ============================================================================
//
// Four sibling builders — Select/Insert/Update/Delete — sharing clause
// helpers from `clause`. Each builder is a plain value type: build it up with
// its fluent methods, then either render it with `to_sql()`/`parameters()` or
// run it directly against a `Database` with `execute()`/`fetch_all()`/
// `fetch_one()`/`fetch_scalar()`.

pub mod clause;
pub mod delete;
pub mod insert;
pub mod select;
pub mod update;

pub use clause::{Comparison, Direction, JoinSpec, JoinType, Link};
pub use delete::Delete;
pub use insert::Insert;
pub use select::Select;
pub use update::Update;
