//! Query building and SQL compilation for relq.
//!
//! A `Query` accumulates clause state against a resolved schema; the
//! `Translator` trait compiles that state into dialect SQL. Field
//! access goes through `TableCursor`, which registers joins lazily and
//! dedups them by alias. Concrete dialects live in `relq-sql`.

use thiserror::Error;

pub mod query;
pub mod resolver;
pub mod translate;

pub use query::{
    Chained, Join, JoinKind, Query, QueryPlan, Rendered, Statement, SubqueryRef, WithClause,
};
pub use resolver::{Resolved, Scheme, TableCursor, ViewFn, Views};
pub use translate::{Capabilities, ChainMode, Translator};

use relq_expr::ExprError;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("unsupported by dialect: {0}")]
    Unsupported(String),

    #[error("cannot generate SQL: {0}")]
    Codegen(String),

    #[error(transparent)]
    Expr(#[from] ExprError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query `{0}` is frozen")]
    Frozen(String),

    #[error("variable `{0}` is not bound")]
    NotBound(String),

    #[error("unknown field: {0}")]
    FieldName(String),

    #[error("field type error: {0}")]
    FieldType(String),

    #[error("wrong operation: {0}")]
    WrongOperation(String),

    #[error(transparent)]
    Schema(#[from] relq_model::SchemaError),

    #[error(transparent)]
    Translate(#[from] TranslateError),
}

impl From<ExprError> for QueryError {
    fn from(e: ExprError) -> QueryError {
        QueryError::Translate(TranslateError::Expr(e))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use relq_expr::{ExprDialect, ExprError};
    use relq_model::{Field, FieldType, Registry, Table};

    use crate::translate::{Capabilities, Translator};
    use crate::TranslateError;

    /// A Postgres-flavored dialect for plan-level tests.
    pub struct TestDialect;

    pub static T: TestDialect = TestDialect;

    impl ExprDialect for TestDialect {
        fn name(&self) -> &'static str {
            "test"
        }

        fn placeholder(&self, name: &str) -> String {
            format!("%({name})s")
        }

        fn type_name(&self, ty: FieldType) -> &'static str {
            match ty {
                FieldType::Int | FieldType::IntEnum => "integer",
                FieldType::BigInt => "bigint",
                FieldType::Float => "double precision",
                FieldType::Bool => "boolean",
                FieldType::Text | FieldType::TextEnum => "text",
                FieldType::Bytes => "bytea",
                FieldType::Timestamp => "timestamp",
                FieldType::Date => "date",
                FieldType::Time => "time",
                FieldType::Interval => "interval",
                FieldType::Uuid => "uuid",
                FieldType::Json => "jsonb",
            }
        }

        fn json_get(&self, body: &str, key: &str) -> String {
            format!("{body}->>'{key}'")
        }

        fn json_decode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError> {
            Ok(self.type_cast(expr, ty))
        }

        fn json_encode(&self, expr: &str, _ty: FieldType) -> Result<String, ExprError> {
            Ok(expr.to_string())
        }

        fn json_object(&self, pairs: &[(String, String)]) -> String {
            let inner: Vec<String> = pairs.iter().map(|(k, v)| format!("'{k}', {v}")).collect();
            format!("jsonb_build_object({})", inner.join(", "))
        }

        fn json_merge(&self, left: &str, right: &str) -> String {
            format!("{left} || {right}")
        }
    }

    impl Translator for TestDialect {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_schema: true,
                supports_default: true,
                supports_copy: true,
            }
        }

        fn pk_column_sql(&self, field: &Field) -> Result<String, TranslateError> {
            Ok(format!("{} serial PRIMARY KEY", self.quote_ident(&field.column)))
        }

        fn array_agg(&self, expr: &str) -> String {
            format!("array_agg({expr})")
        }

        fn select_all_tables(&self) -> String {
            "SELECT table_name FROM information_schema.tables".into()
        }

        fn table_exists(&self) -> String {
            "SELECT 1 FROM information_schema.tables WHERE table_name = %(name)s".into()
        }
    }

    pub fn fixture() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.declare(Table::new("Author").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.declare(
            Table::new("Book")
                .field(Field::new("title", FieldType::Text))
                .field(Field::new("price", FieldType::Float))
                .field(Field::reference("author", "Author"))
                .many_to_many("sellers", "Seller"),
        )
        .unwrap();
        reg.declare(Table::new("Seller").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.declare(
            Table::new("Catalog")
                .extendable()
                .field(Field::cid("cid"))
                .field(Field::new("name", FieldType::Text)),
        )
        .unwrap();
        reg.declare(
            Table::new("ItemCatalog")
                .extending("Catalog")
                .field(Field::new("unit", FieldType::Text)),
        )
        .unwrap();
        reg.declare(
            Table::new("TreeNode")
                .field(Field::new("name", FieldType::Text))
                .field(Field::reference("next", "TreeNode").optional()),
        )
        .unwrap();
        reg.resolve().unwrap();
        Arc::new(reg)
    }
}
