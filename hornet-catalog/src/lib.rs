//! Static catalog model shared by the queueing and speculative-execution layers.
//!
//! Everything in this crate is immutable after construction and is shared
//! behind an `Arc` between executor threads without further synchronization.

pub mod conflicts;
pub mod mappings;
pub mod schema;

pub use conflicts::{ConflictKind, ConflictMatrix, ConflictPair};
pub use mappings::{ParameterMapping, ParameterMappings};
pub use schema::{Catalog, CatalogBuilder, PkeyBinding, ProcedureDef, StatementDef, TableDef};
