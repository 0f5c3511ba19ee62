//! Dialect primitives expressions are rendered against.

use relq_model::FieldType;

use crate::ExprError;

/// The small object-safe surface a SQL dialect exposes to expression
/// rendering. Statement-level compilation builds on top of these in
/// the query crate; implementations live in `relq-sql`.
pub trait ExprDialect: Sync {
    fn name(&self) -> &'static str;

    /// Named bind-parameter syntax, e.g. `%(x)s` or `:x`.
    fn placeholder(&self, name: &str) -> String;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    /// Column type name used in DDL and casts.
    fn type_name(&self, ty: FieldType) -> &'static str;

    fn type_cast(&self, expr: &str, ty: FieldType) -> String {
        format!("CAST({expr} AS {})", self.type_name(ty))
    }

    /// Extract `key` from the JSON column expression `body` as text.
    fn json_get(&self, body: &str, key: &str) -> String;

    /// Convert the text extracted from JSON back to a typed value.
    /// Types without an encoding fail with `ExprError::Translation`.
    fn json_decode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError>;

    /// Convert a typed value to its JSON-storable form.
    fn json_encode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError>;

    /// Build a JSON object from already-rendered key/value pairs.
    fn json_object(&self, pairs: &[(String, String)]) -> String;

    /// Merge two JSON objects, right side winning.
    fn json_merge(&self, left: &str, right: &str) -> String;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A bare-bones dialect for expression tests.
    pub struct PlainDialect;

    pub static PLAIN: PlainDialect = PlainDialect;

    impl ExprDialect for PlainDialect {
        fn name(&self) -> &'static str {
            "plain"
        }

        fn placeholder(&self, name: &str) -> String {
            format!("%({name})s")
        }

        fn type_name(&self, ty: FieldType) -> &'static str {
            match ty {
                FieldType::Int => "integer",
                FieldType::BigInt => "bigint",
                FieldType::Float => "double precision",
                FieldType::Bool => "boolean",
                FieldType::Text => "text",
                FieldType::Bytes => "bytea",
                FieldType::Timestamp => "timestamp",
                FieldType::Date => "date",
                FieldType::Time => "time",
                FieldType::Interval => "interval",
                FieldType::Uuid => "uuid",
                FieldType::Json => "jsonb",
                FieldType::IntEnum => "integer",
                FieldType::TextEnum => "text",
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
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("'{k}', {v}"))
                .collect();
            format!("jsonb_build_object({})", inner.join(", "))
        }

        fn json_merge(&self, left: &str, right: &str) -> String {
            format!("{left} || {right}")
        }
    }
}
