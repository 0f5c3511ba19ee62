//! Schema model for relq
//!
//! Tables, fields and relationship descriptors, plus the process-wide
//! registry that resolves them into a normalized schema. Declaration is
//! explicit (`Registry::declare`) and resolution is a separate two-phase
//! pass (`Registry::resolve`), so tables may reference each other by name
//! in any order.

use thiserror::Error;

mod dump;
mod field;
mod registry;
mod table;
mod types;

pub use dump::{FieldDump, TableDump};
pub use field::{Field, FieldKind};
pub use registry::Registry;
pub use table::{snake_case, ManyRelation, ManyToManyRelation, Table};
pub use types::{FieldType, Value};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unsupported field type: {0}")]
    FieldType(String),

    #[error("field name error: {0}")]
    FieldName(String),

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("registry is already resolved: {0}")]
    Resolved(String),

    #[error("schema load error: {0}")]
    Load(String),
}
