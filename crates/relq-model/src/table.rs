//! Table descriptors and relationship metadata.

use indexmap::IndexMap;

use crate::field::{Field, FieldKind};
use crate::types::FieldType;
use crate::SchemaError;

/// Reverse side of a `Ref` field: the "many" collection the target
/// table sees. `foreign_field` is filled in during resolution when the
/// relation was declared before the foreign key existed.
#[derive(Debug, Clone, PartialEq)]
pub struct ManyRelation {
    pub target: String,
    /// Name of the `Ref` field on the target table that points back here.
    pub foreign_field: Option<String>,
}

/// One side of a many-to-many relation. The junction table is
/// synthesized once per pair during resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ManyToManyRelation {
    pub target: String,
    /// Relation name on the target table.
    pub reverse_name: Option<String>,
    /// Synthesized junction table, set by resolution.
    pub junction: Option<String>,
}

/// Convert a model name to snake case, the way storage names and
/// reverse-relation defaults are derived.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if (prev.is_ascii_lowercase() || prev.is_ascii_digit())
                || (prev.is_ascii_uppercase() && next_lower)
            {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// A declared table. Built with chainable methods, then handed to
/// `Registry::declare`; resolution fills in inherited fields, reverse
/// relations and junction links.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    /// Physical table name; defaults to the pluralized snake case name.
    pub storage: String,
    pub schema: Option<String>,
    /// Snake case plural, used as the default reverse-relation name.
    pub snake_name: String,
    pub fields: IndexMap<String, Field>,
    /// Primary key field name. Filled by declaration.
    pub pk: String,
    /// Discriminator field name, for extendable tables.
    pub cid: Option<String>,
    /// JSON body field name, if any.
    pub body: Option<String>,
    pub extendable: bool,
    /// True for the root of an extendable family (or any plain table).
    pub is_root: bool,
    /// Parent model name, for extendable branches.
    pub parent: Option<String>,
    /// Discriminator value stored for rows of this shape.
    pub discriminator: Option<String>,
    pub many: IndexMap<String, ManyRelation>,
    pub many_to_many: IndexMap<String, ManyToManyRelation>,
    pub(crate) dup_names: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Table {
        let name = name.into();
        let snake = format!("{}s", snake_case(&name));
        Table {
            storage: snake.clone(),
            snake_name: snake,
            name,
            schema: None,
            fields: IndexMap::new(),
            pk: String::new(),
            cid: None,
            body: None,
            extendable: false,
            is_root: true,
            parent: None,
            discriminator: None,
            many: IndexMap::new(),
            many_to_many: IndexMap::new(),
            dup_names: Vec::new(),
        }
    }

    pub fn storage(mut self, storage: impl Into<String>) -> Table {
        self.storage = storage.into();
        self
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Table {
        self.schema = Some(schema.into());
        self
    }

    /// Mark as the root of a polymorphic family. Root rows carry a
    /// discriminator and branches share this table's storage.
    pub fn extendable(mut self) -> Table {
        self.extendable = true;
        self
    }

    /// Declare as a branch of the extendable table `parent`. Parent
    /// fields are inherited during resolution.
    pub fn extending(mut self, parent: impl Into<String>) -> Table {
        self.extendable = true;
        self.is_root = false;
        self.parent = Some(parent.into());
        self
    }

    /// Override the discriminator value (defaults to the model name).
    pub fn discriminator(mut self, value: impl Into<String>) -> Table {
        self.discriminator = Some(value.into());
        self
    }

    pub fn field(mut self, field: Field) -> Table {
        let name = field.name.clone();
        if self.fields.insert(name.clone(), field).is_some() {
            self.dup_names.push(name);
        }
        self
    }

    /// Declare the reverse-many collection explicitly. The foreign key
    /// on `target` is matched up during resolution.
    pub fn has_many(mut self, name: impl Into<String>, target: impl Into<String>) -> Table {
        let name = name.into();
        let rel = ManyRelation {
            target: target.into(),
            foreign_field: None,
        };
        if self.many.insert(name.clone(), rel).is_some() {
            self.dup_names.push(name);
        }
        self
    }

    pub fn many_to_many(mut self, name: impl Into<String>, target: impl Into<String>) -> Table {
        self.many_to_many_named(name, target, None::<String>)
    }

    /// Many-to-many with an explicit reverse relation name on `target`.
    pub fn many_to_many_named(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        reverse: Option<impl Into<String>>,
    ) -> Table {
        let name = name.into();
        let rel = ManyToManyRelation {
            target: target.into(),
            reverse_name: reverse.map(Into::into),
            junction: None,
        };
        if self.many_to_many.insert(name.clone(), rel).is_some() {
            self.dup_names.push(name);
        }
        self
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn pk_field(&self) -> &Field {
        &self.fields[&self.pk]
    }

    /// Validate the declaration and fill in the pk / cid / body
    /// pointers. Called by `Registry::declare`.
    pub(crate) fn finish(&mut self) -> Result<(), SchemaError> {
        if let Some(dup) = self.dup_names.first() {
            return Err(SchemaError::FieldName(format!(
                "duplicate name `{dup}` in table `{}`",
                self.name
            )));
        }
        for name in self.many.keys().chain(self.many_to_many.keys()) {
            if self.fields.contains_key(name) {
                return Err(SchemaError::FieldName(format!(
                    "relation `{name}` collides with a field of table `{}`",
                    self.name
                )));
            }
        }

        let pks: Vec<&str> = self
            .fields
            .values()
            .filter(|f| f.pk)
            .map(|f| f.name.as_str())
            .collect();
        match pks.len() {
            0 if self.parent.is_none() => {
                let pk = Field::new("id", FieldType::Int).primary_key();
                self.pk = pk.name.clone();
                self.fields.insert(pk.name.clone(), pk);
            }
            0 => {} // branches inherit the root pk during resolution
            1 => self.pk = pks[0].to_string(),
            _ => {
                return Err(SchemaError::FieldName(format!(
                    "table `{}` declares more than one primary key",
                    self.name
                )))
            }
        }

        let mut cid = None;
        let mut body = None;
        for f in self.fields.values() {
            if f.cid {
                if cid.replace(f.name.clone()).is_some() {
                    return Err(SchemaError::FieldName(format!(
                        "table `{}` declares more than one discriminator",
                        self.name
                    )));
                }
            }
            if f.body {
                if body.replace(f.name.clone()).is_some() {
                    return Err(SchemaError::FieldName(format!(
                        "table `{}` declares more than one body column",
                        self.name
                    )));
                }
            }
        }
        if cid.is_some() && !self.extendable {
            return Err(SchemaError::FieldType(format!(
                "table `{}` has a discriminator but is not extendable",
                self.name
            )));
        }
        self.cid = cid;
        self.body = body;

        if self.extendable && self.discriminator.is_none() {
            self.discriminator = Some(self.name.clone());
        }

        for f in self.fields.values() {
            if f.is_property() && self.body.is_none() {
                return Err(SchemaError::FieldType(format!(
                    "property `{}` needs a body column on table `{}`",
                    f.name, self.name
                )));
            }
            if matches!(f.kind, FieldKind::Property(FieldType::Json)) && f.name == self.name {
                return Err(SchemaError::FieldName(format!(
                    "property `{}` shadows its table name",
                    f.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_handles_runs() {
        assert_eq!(snake_case("Book"), "book");
        assert_eq!(snake_case("ItemCatalog"), "item_catalog");
        assert_eq!(snake_case("HTTPServer"), "http_server");
        assert_eq!(snake_case("User2Role"), "user2_role");
    }

    #[test]
    fn auto_pk_is_added() {
        let mut t = Table::new("Book").field(Field::new("title", FieldType::Text));
        t.finish().unwrap();
        assert_eq!(t.pk, "id");
        assert!(t.fields["id"].pk);
        assert_eq!(t.storage, "books");
    }

    #[test]
    fn explicit_pk_wins() {
        let mut t = Table::new("Doc").field(Field::new("key", FieldType::Uuid).primary_key());
        t.finish().unwrap();
        assert_eq!(t.pk, "key");
        assert!(!t.fields.contains_key("id"));
    }

    #[test]
    fn duplicate_field_rejected() {
        let mut t = Table::new("X")
            .field(Field::new("a", FieldType::Int))
            .field(Field::new("a", FieldType::Text));
        assert!(matches!(t.finish(), Err(SchemaError::FieldName(_))));
    }

    #[test]
    fn relation_name_collision_rejected() {
        let mut t = Table::new("X")
            .field(Field::new("items", FieldType::Int))
            .has_many("items", "Item");
        assert!(matches!(t.finish(), Err(SchemaError::FieldName(_))));
    }

    #[test]
    fn cid_requires_extendable() {
        let mut t = Table::new("X").field(Field::cid("cid"));
        assert!(matches!(t.finish(), Err(SchemaError::FieldType(_))));
    }

    #[test]
    fn property_requires_body() {
        let mut t = Table::new("X").field(Field::property("width", FieldType::Float));
        assert!(matches!(t.finish(), Err(SchemaError::FieldType(_))));
    }
}
