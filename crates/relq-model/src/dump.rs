//! Lossless schema dumps.
//!
//! A dump captures the physical shape of every table as a JSON tree,
//! so an external migration tool can diff a stored dump against the
//! live registry. Relation metadata is not dumped; junction tables
//! appear as ordinary tables with two reference columns.

use serde::{Deserialize, Serialize};

use crate::field::{Field, FieldKind};
use crate::registry::Registry;
use crate::table::Table;
use crate::types::FieldType;
use crate::SchemaError;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_true(v: &bool) -> bool {
    *v
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDump {
    pub name: String,
    /// Physical column, only when it differs from the field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Type tag, or the target table name for references.
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pk: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub discriminator: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub body: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reference: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub computed: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub extendable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    pub fields: Vec<FieldDump>,
}

impl FieldDump {
    fn of(field: &Field) -> FieldDump {
        let (field_type, reference, computed) = match &field.kind {
            FieldKind::Plain(ty) => (ty.tag().to_string(), false, false),
            FieldKind::Ref { target } => (target.clone(), true, false),
            FieldKind::Property(ty) => (ty.tag().to_string(), false, true),
        };
        FieldDump {
            name: field.name.clone(),
            column: (field.column != field.name).then(|| field.column.clone()),
            field_type,
            pk: field.pk,
            discriminator: field.cid,
            body: field.body,
            reference,
            computed,
            required: field.required,
            indexed: field.indexed,
            unique: field.unique,
            default_sql: field.default_sql.clone(),
            reverse_name: field.reverse_name.clone(),
        }
    }

    fn restore(self) -> Result<Field, SchemaError> {
        let kind = if self.reference {
            FieldKind::Ref {
                target: self.field_type,
            }
        } else {
            let ty = FieldType::from_tag(&self.field_type).ok_or_else(|| {
                SchemaError::Load(format!(
                    "unknown type tag `{}` for field `{}`",
                    self.field_type, self.name
                ))
            })?;
            if self.computed {
                FieldKind::Property(ty)
            } else {
                FieldKind::Plain(ty)
            }
        };
        let mut field = Field::new(self.name, FieldType::Int);
        field.kind = kind;
        if let Some(column) = self.column {
            field.column = column;
        }
        field.pk = self.pk;
        field.cid = self.discriminator;
        field.body = self.body;
        field.required = self.required;
        field.indexed = self.indexed;
        field.unique = self.unique;
        field.default_sql = self.default_sql;
        field.reverse_name = self.reverse_name;
        Ok(field)
    }
}

impl Table {
    pub fn dump(&self) -> TableDump {
        TableDump {
            name: self.name.clone(),
            storage: self.storage.clone(),
            schema: self.schema.clone(),
            extendable: self.extendable,
            discriminator: self.extendable.then(|| self.discriminator.clone()).flatten(),
            fields: self.fields.values().map(FieldDump::of).collect(),
        }
    }

    pub fn from_dump(dump: TableDump) -> Result<Table, SchemaError> {
        let mut table = Table::new(dump.name).storage(dump.storage);
        if let Some(schema) = dump.schema {
            table = table.in_schema(schema);
        }
        if dump.extendable {
            table = table.extendable();
        }
        if let Some(d) = dump.discriminator {
            table = table.discriminator(d);
        }
        for f in dump.fields {
            table = table.field(f.restore()?);
        }
        Ok(table)
    }
}

impl Registry {
    /// Serialize every table shape as one JSON tree.
    pub fn dump(&self) -> Result<serde_json::Value, SchemaError> {
        let tables: Vec<TableDump> = self.tables().map(Table::dump).collect();
        let tables = serde_json::to_value(tables).map_err(|e| SchemaError::Load(e.to_string()))?;
        Ok(serde_json::json!({ "tables": tables }))
    }

    /// Rebuild an unresolved registry from a dump produced by
    /// [`Registry::dump`]. Tables come back standalone; inheritance
    /// links are already flattened into the dumped field sets.
    pub fn load(value: &serde_json::Value) -> Result<Registry, SchemaError> {
        let tables = value
            .get("tables")
            .and_then(|t| t.as_array())
            .ok_or_else(|| SchemaError::Load("missing `tables` array".into()))?;
        let mut registry = Registry::new();
        for raw in tables {
            let dump: TableDump = serde_json::from_value(raw.clone())
                .map_err(|e| SchemaError::Load(e.to_string()))?;
            registry.declare(Table::from_dump(dump)?)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;

    fn sample() -> Registry {
        let mut reg = Registry::new();
        reg.declare(
            Table::new("Author")
                .field(Field::new("name", FieldType::Text).unique())
                .field(Field::body("data"))
                .field(Field::property("born", FieldType::Date)),
        )
        .unwrap();
        reg.declare(
            Table::new("Book")
                .storage("library_books")
                .field(Field::new("title", FieldType::Text))
                .field(
                    Field::reference("author", "Author")
                        .optional()
                        .indexed()
                        .column("author_id"),
                ),
        )
        .unwrap();
        reg
    }

    #[test]
    fn dump_load_round_trip() {
        let reg = sample();
        let tree = reg.dump().unwrap();
        let loaded = Registry::load(&tree).unwrap();

        for table in reg.tables() {
            let back = loaded.get(&table.name).unwrap();
            assert_eq!(back.storage, table.storage);
            assert_eq!(back.pk, table.pk);
            assert_eq!(back.body, table.body);
            let names: Vec<&String> = table.fields.keys().collect();
            let back_names: Vec<&String> = back.fields.keys().collect();
            assert_eq!(names, back_names);
            for (name, field) in &table.fields {
                assert_eq!(&back.fields[name], field, "field `{name}`");
            }
        }
        // A second dump of the loaded registry is identical.
        assert_eq!(loaded.dump().unwrap(), tree);
    }

    #[test]
    fn dump_omits_default_flags() {
        let reg = sample();
        let tree = reg.dump().unwrap();
        let title = &tree["tables"][1]["fields"][0];
        assert_eq!(title["name"], "title");
        assert_eq!(title["type"], "text");
        assert!(title.get("required").is_none());
        assert!(title.get("pk").is_none());

        let author_ref = &tree["tables"][1]["fields"][1];
        assert_eq!(author_ref["type"], "Author");
        assert_eq!(author_ref["reference"], true);
        assert_eq!(author_ref["required"], false);
        assert_eq!(author_ref["column"], "author_id");
    }

    #[test]
    fn bad_type_tag_is_a_load_error() {
        let tree = serde_json::json!({ "tables": [{
            "name": "X", "storage": "xs",
            "fields": [{ "name": "a", "type": "decimal" }]
        }]});
        assert!(matches!(
            Registry::load(&tree),
            Err(SchemaError::Load(_))
        ));
    }
}
