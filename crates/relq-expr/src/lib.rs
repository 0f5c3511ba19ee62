//! SQL expression fragments for relq.
//!
//! An expression is a piece of already-rendered SQL text plus an
//! `aggregated` flag, built against a dialect's primitives and an
//! argument table shared with the owning query. Composition never
//! parses SQL back; it only concatenates rendered fragments.

use thiserror::Error;

mod args;
mod dialect;
mod expr;

pub use args::ArgTable;
pub use dialect::ExprDialect;
pub use expr::{case, CaseExpr, ExprCtx, Operand, SqlExpr};

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("variable `{0}` is not bound")]
    NotBound(String),

    #[error("wrong operation: {0}")]
    WrongOperation(String),

    #[error("no SQL encoding for {0}")]
    Translation(String),
}
