//! The embedded dialect, targeting SQLite.
//!
//! SQLite has no schemas, no in-place constraint DDL and no COPY, so
//! several statements become rebuild scripts or `Unsupported` errors.
//! Temporal body values are epoch numbers, decoded with the
//! `'unixepoch'` modifier.

use relq_expr::{ExprDialect, ExprError};
use relq_model::{Field, FieldKind, FieldType, Registry, Table};
use relq_query::{Capabilities, TranslateError, Translator};

pub struct Sqlite;

/// The process-wide dialect instance queries bind against.
pub static SQLITE: Sqlite = Sqlite;

impl ExprDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, name: &str) -> String {
        format!(":{name}")
    }

    fn type_name(&self, ty: FieldType) -> &'static str {
        match ty {
            FieldType::Int | FieldType::BigInt | FieldType::IntEnum => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::Bool => "BOOLEAN",
            FieldType::Text | FieldType::TextEnum => "TEXT",
            FieldType::Bytes => "BLOB",
            FieldType::Timestamp => "DATETIME",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Interval => "TIMEDELTA",
            FieldType::Uuid => "UUID",
            FieldType::Json => "JSON",
        }
    }

    fn json_get(&self, body: &str, key: &str) -> String {
        format!("json_extract({body}, '$.{key}')")
    }

    fn json_decode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError> {
        Ok(match ty {
            FieldType::Text | FieldType::TextEnum => expr.to_string(),
            FieldType::Timestamp => format!("datetime({expr}, 'unixepoch')"),
            FieldType::Date => format!("date({expr}, 'unixepoch')"),
            FieldType::Time => format!("time({expr}, 'unixepoch')"),
            FieldType::Interval => format!("CAST({expr} AS REAL)"),
            FieldType::Bytes => {
                return Err(ExprError::Translation(
                    "bytes stored in a JSON body".into(),
                ))
            }
            other => format!("CAST({expr} AS {})", self.type_name(other)),
        })
    }

    fn json_encode(&self, expr: &str, ty: FieldType) -> Result<String, ExprError> {
        Ok(match ty {
            FieldType::Timestamp | FieldType::Date | FieldType::Time => {
                format!("unixepoch({expr})")
            }
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
        format!("json_object({})", inner.join(", "))
    }

    fn json_merge(&self, left: &str, right: &str) -> String {
        format!("json_patch({left}, {right})")
    }
}

impl Translator for Sqlite {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_schema: false,
            supports_default: false,
            supports_copy: false,
        }
    }

    fn pk_column_sql(&self, field: &Field) -> Result<String, TranslateError> {
        match field.kind {
            FieldKind::Plain(FieldType::Int) | FieldKind::Plain(FieldType::BigInt) => Ok(format!(
                "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                self.quote_ident(&field.column)
            )),
            _ => Err(TranslateError::Unsupported(format!(
                "primary key type of `{}`",
                field.name
            ))),
        }
    }

    fn array_agg(&self, expr: &str) -> String {
        format!("group_concat({expr})")
    }

    // LIMIT must come first, and cannot be omitted when OFFSET is set.
    fn window_sql(&self, offset: Option<u64>, limit: Option<u64>) -> String {
        match (offset, limit) {
            (None, None) => String::new(),
            (None, Some(limit)) => format!("\nLIMIT {limit}"),
            (Some(offset), limit) => {
                format!("\nLIMIT {}\nOFFSET {offset}", limit.map_or(-1, |l| l as i64))
            }
        }
    }

    /// References can only be declared at creation time, so they go
    /// inline as table constraints.
    fn create_table(&self, registry: &Registry, table: &Table) -> Result<String, TranslateError> {
        let mut lines = Vec::new();
        for field in table.fields.values() {
            if field.is_property() {
                continue;
            }
            lines.push(format!("  {}", self.column_sql(registry, table, field)?));
        }
        for field in table.fields.values() {
            let Some(target_name) = field.ref_target() else {
                continue;
            };
            let target = registry.get(target_name).ok_or_else(|| {
                TranslateError::Codegen(format!("unknown table `{target_name}`"))
            })?;
            let on_delete = if field.required { "CASCADE" } else { "SET NULL" };
            lines.push(format!(
                "  FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {on_delete}",
                self.quote_ident(&field.column),
                self.table_ref(target),
                self.quote_ident(&target.pk_field().column)
            ));
        }
        Ok(format!(
            "CREATE TABLE {} (\n{}\n)",
            self.table_ref(table),
            lines.join(",\n")
        ))
    }

    fn drop_table_by_name(&self, _schema: Option<&str>, storage: &str) -> String {
        format!(
            "PRAGMA foreign_keys = OFF;\nDROP TABLE {};\nPRAGMA foreign_keys = ON",
            self.quote_ident(storage)
        )
    }

    /// Adding a constraint means rebuilding the table: rename it away,
    /// recreate with the reference inline, copy the rows back.
    fn add_reference(
        &self,
        registry: &Registry,
        table: &Table,
        _field: &Field,
    ) -> Result<String, TranslateError> {
        let name = self.quote_ident(&table.storage);
        let old = self.quote_ident(&format!("{}_old", table.storage));
        let create = self.create_table(registry, table)?;
        Ok(format!(
            "PRAGMA foreign_keys = OFF;\n\
             ALTER TABLE {name} RENAME TO {old};\n\
             {create};\n\
             INSERT INTO {name} SELECT * FROM {old};\n\
             DROP TABLE {old};\n\
             PRAGMA foreign_keys = ON"
        ))
    }

    fn drop_reference(&self, table: &Table, field: &Field) -> Result<String, TranslateError> {
        Err(TranslateError::Unsupported(format!(
            "dropping the `{}` reference of `{}` in place",
            field.name, table.name
        )))
    }

    fn alter_field_type(
        &self,
        table: &Table,
        column: &str,
        _ty: FieldType,
    ) -> Result<String, TranslateError> {
        Err(TranslateError::Unsupported(format!(
            "retyping `{column}` of `{}` in place",
            table.name
        )))
    }

    fn set_not_null(&self, table: &Table, column: &str) -> Result<String, TranslateError> {
        Err(TranslateError::Unsupported(format!(
            "altering nullability of `{column}` of `{}`",
            table.name
        )))
    }

    fn drop_not_null(&self, table: &Table, column: &str) -> Result<String, TranslateError> {
        Err(TranslateError::Unsupported(format!(
            "altering nullability of `{column}` of `{}`",
            table.name
        )))
    }

    fn select_all_tables(&self) -> String {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'".into()
    }

    fn table_exists(&self) -> String {
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = :name".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relq_model::{Field, FieldType, Registry, Table};

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.declare(Table::new("Author").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.declare(
            Table::new("Book")
                .field(Field::new("title", FieldType::Text))
                .field(Field::reference("author", "Author"))
                .field(
                    Field::new("kind", FieldType::Text)
                        .optional()
                        .default_sql("'paper'"),
                ),
        )
        .unwrap();
        reg.resolve().unwrap();
        reg
    }

    #[test]
    fn create_table_inlines_references_and_skips_defaults() {
        let reg = registry();
        let sql = SQLITE.create_table(&reg, reg.get("Book").unwrap()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE \"books\" (\n\
             \x20 \"title\" TEXT NOT NULL,\n\
             \x20 \"author\" INTEGER NOT NULL,\n\
             \x20 \"kind\" TEXT,\n\
             \x20 \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             \x20 FOREIGN KEY (\"author\") REFERENCES \"authors\" (\"id\") ON DELETE CASCADE\n\
             )"
        );
    }

    #[test]
    fn window_puts_limit_first() {
        assert_eq!(SQLITE.window_sql(Some(10), Some(5)), "\nLIMIT 5\nOFFSET 10");
        assert_eq!(SQLITE.window_sql(Some(10), None), "\nLIMIT -1\nOFFSET 10");
        assert_eq!(SQLITE.window_sql(None, Some(5)), "\nLIMIT 5");
        assert_eq!(SQLITE.window_sql(None, None), "");
    }

    #[test]
    fn schemas_are_ignored_in_table_refs() {
        let mut reg = Registry::new();
        reg.declare(
            Table::new("Gadget")
                .in_schema("shop")
                .field(Field::new("name", FieldType::Text)),
        )
        .unwrap();
        reg.resolve().unwrap();
        assert_eq!(SQLITE.table_ref(reg.get("Gadget").unwrap()), "\"gadgets\"");
    }

    #[test]
    fn temporal_json_codecs_use_unixepoch() {
        assert_eq!(
            SQLITE.json_decode("x", FieldType::Timestamp).unwrap(),
            "datetime(x, 'unixepoch')"
        );
        assert_eq!(
            SQLITE.json_encode(":at", FieldType::Time).unwrap(),
            "unixepoch(:at)"
        );
        assert!(SQLITE.json_encode("x", FieldType::Bytes).is_err());
    }

    #[test]
    fn add_reference_rebuilds_the_table() {
        let reg = registry();
        let book = reg.get("Book").unwrap();
        let sql = SQLITE
            .add_reference(&reg, book, &book.fields["author"])
            .unwrap();
        assert!(sql.starts_with("PRAGMA foreign_keys = OFF;\nALTER TABLE \"books\" RENAME TO \"books_old\";\nCREATE TABLE \"books\" ("));
        assert!(sql.ends_with(
            "INSERT INTO \"books\" SELECT * FROM \"books_old\";\n\
             DROP TABLE \"books_old\";\n\
             PRAGMA foreign_keys = ON"
        ));
    }

    #[test]
    fn drop_table_toggles_foreign_keys() {
        let reg = registry();
        assert_eq!(
            SQLITE.drop_table(reg.get("Author").unwrap()),
            "PRAGMA foreign_keys = OFF;\nDROP TABLE \"authors\";\nPRAGMA foreign_keys = ON"
        );
    }

    #[test]
    fn in_place_alters_are_refused() {
        let reg = registry();
        let book = reg.get("Book").unwrap();
        assert!(SQLITE.alter_field_type(book, "title", FieldType::Int).is_err());
        assert!(SQLITE.set_not_null(book, "kind").is_err());
        assert!(SQLITE.drop_not_null(book, "title").is_err());
        assert!(SQLITE
            .drop_reference(book, &book.fields["author"])
            .is_err());
        assert!(SQLITE.copy_links(book, "a", "b").is_err());
        assert!(SQLITE.set_default_value(book, "kind", "'paper'").is_err());
    }

    #[test]
    fn placeholders_are_named_colons() {
        let reg = registry();
        let sql = SQLITE.insert(reg.get("Author").unwrap()).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"authors\" (\"name\")\nVALUES (:name)\nRETURNING \"id\""
        );
    }
}
