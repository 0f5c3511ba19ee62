//! The client/server dialect, targeting Postgres-protocol databases.
//!
//! Temporal values inside JSON bodies are stored as epoch numbers and
//! rebuilt with `to_timestamp` on the way out.

use relq_expr::{ExprDialect, ExprError};
use relq_model::{Field, FieldKind, FieldType, Table};
use relq_query::{Capabilities, TranslateError, Translator};

pub struct Postgres;

/// The process-wide dialect instance queries bind against.
pub static POSTGRES: Postgres = Postgres;

impl ExprDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
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
        Ok(match ty {
            FieldType::Text | FieldType::TextEnum => expr.to_string(),
            FieldType::Timestamp => format!("to_timestamp(({expr})::double precision)"),
            FieldType::Date => format!("to_timestamp(({expr})::double precision)::date"),
            FieldType::Time => format!("to_timestamp(({expr})::double precision)::time"),
            FieldType::Interval => {
                format!("make_interval(secs => ({expr})::double precision)")
            }
            FieldType::Bytes => {
                return Err(ExprError::Translation(
                    "bytes stored in a JSON body".into(),
                ))
            }
            other => format!("({expr})::{}", self.type_name(other)),
        })
    }

    fn json_encode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError> {
        Ok(match ty {
            FieldType::Timestamp | FieldType::Date | FieldType::Time => {
                format!("extract(epoch from {expr})")
            }
            FieldType::Interval => format!("extract(epoch from {expr})"),
            FieldType::Bytes => {
                return Err(ExprError::Translation(
                    "bytes stored in a JSON body".into(),
                ))
            }
            _ => expr.to_string(),
        })
    }

    fn json_object(&self, pairs: &[(String, String)]) -> String {
        let inner: Vec<String> = pairs.iter().map(|(k, v)| format!("'{k}', {v}")).collect();
        format!("jsonb_build_object({})", inner.join(", "))
    }

    fn json_merge(&self, left: &str, right: &str) -> String {
        format!("{left} || {right}")
    }
}

impl Translator for Postgres {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_schema: true,
            supports_default: true,
            supports_copy: true,
        }
    }

    fn pk_column_sql(&self, field: &Field) -> Result<String, TranslateError> {
        let column = self.quote_ident(&field.column);
        match field.kind {
            FieldKind::Plain(FieldType::Int) => Ok(format!("{column} serial PRIMARY KEY")),
            FieldKind::Plain(FieldType::BigInt) => Ok(format!("{column} bigserial PRIMARY KEY")),
            FieldKind::Plain(FieldType::Uuid) => Ok(format!(
                "{column} uuid PRIMARY KEY DEFAULT gen_random_uuid()"
            )),
            _ => Err(TranslateError::Unsupported(format!(
                "primary key type of `{}`",
                field.name
            ))),
        }
    }

    fn array_agg(&self, expr: &str) -> String {
        format!("array_agg({expr})")
    }

    /// Delete through a USING join instead of an IN subselect.
    fn delete_selected(&self, table: &Table, sub_pk: &str, sub_sql: &str) -> String {
        format!(
            "DELETE FROM {table_ref} USING (\n{sub_sql}\n) AS {sel}\nWHERE {table_ref}.{pk} = {sel}.{sub_pk}",
            table_ref = self.table_ref(table),
            sel = self.quote_ident("_sel"),
            pk = self.quote_ident(&table.pk_field().column),
            sub_pk = self.quote_ident(sub_pk),
        )
    }

    fn select_all_tables(&self) -> String {
        "SELECT table_name FROM information_schema.tables WHERE table_schema = %(schema)s".into()
    }

    fn table_exists(&self) -> String {
        "SELECT 1 FROM information_schema.tables \
         WHERE table_schema = %(schema)s AND table_name = %(name)s"
            .into()
    }
}
