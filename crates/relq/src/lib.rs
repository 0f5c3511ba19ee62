//! relq: relational schema modeling, lazy query building and dialect
//! SQL compilation.
//!
//! The facade re-exports the member crates and adds the execution
//! interfaces that carry compiled statements to a driver:
//!
//! - `relq-model`: tables, fields, relations, the registry
//! - `relq-expr`: the SQL expression builder and argument table
//! - `relq-query`: the query builder, join resolver and translator
//! - `relq-sql`: the Postgres and SQLite dialects
//!
//! ```no_run
//! use std::sync::Arc;
//! use relq::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut reg = Registry::new();
//! reg.declare(
//!     Table::new("Book")
//!         .field(Field::new("title", FieldType::Text))
//!         .field(Field::new("price", FieldType::Float)),
//! )?;
//! reg.resolve()?;
//!
//! let stmt = Query::bind(Arc::new(reg), &POSTGRES, "Book")?
//!     .select(["title"])?
//!     .filter_with(|s| Ok(s.f("price")?.lt(20.0)))?
//!     .compile()?;
//! println!("{}", stmt.sql);
//! # Ok(())
//! # }
//! ```

pub mod exec;
pub mod logging;

pub use relq_expr::{ArgTable, CaseExpr, ExprCtx, ExprDialect, ExprError, Operand, SqlExpr};
pub use relq_model::{
    Field, FieldKind, FieldType, ManyRelation, ManyToManyRelation, Registry, SchemaError, Table,
    Value,
};
pub use relq_query::{
    Capabilities, ChainMode, Query, QueryError, Scheme, Statement, SubqueryRef, TableCursor,
    TranslateError, Translator, Views,
};
pub use relq_sql::{Postgres, Sqlite, POSTGRES, SQLITE};

pub use exec::{
    execute_batch, junction_sync, run_in_transaction, AsyncConnection, Connection, JunctionSync,
    LinkWrite, Transaction,
};

/// The common imports, ready for a glob.
pub mod prelude {
    pub use crate::exec::{AsyncConnection, Connection, Transaction};
    pub use relq_expr::{ExprDialect, SqlExpr};
    pub use relq_model::{Field, FieldKind, FieldType, Registry, Table, Value};
    pub use relq_query::{Query, QueryError, Statement, Translator, Views};
    pub use relq_sql::{POSTGRES, SQLITE};
}
