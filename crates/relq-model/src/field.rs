//! Field descriptors.

use crate::types::FieldType;

/// What a field stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A real column of a scalar type.
    Plain(FieldType),
    /// A foreign key to another table, named by its model name.
    Ref { target: String },
    /// A computed property stored inside the table's JSON body column.
    Property(FieldType),
}

/// A declared field. Built with the chainable constructors and refined
/// during `Registry::resolve`.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    /// Physical column name; defaults to the field name.
    pub column: String,
    pub kind: FieldKind,
    pub pk: bool,
    /// Discriminator column of an extendable family.
    pub cid: bool,
    /// JSON body column that backs `Property` fields.
    pub body: bool,
    pub required: bool,
    pub indexed: bool,
    pub unique: bool,
    /// Raw SQL default expression, emitted verbatim in DDL.
    pub default_sql: Option<String>,
    /// Name the reverse-many relation gets on the target table.
    pub reverse_name: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Field {
        let name = name.into();
        Field {
            column: name.clone(),
            name,
            kind: FieldKind::Plain(ty),
            pk: false,
            cid: false,
            body: false,
            required: true,
            indexed: false,
            unique: false,
            default_sql: None,
            reverse_name: None,
        }
    }

    /// A foreign key to `target`. Required by default.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Field {
        let mut f = Field::new(name, FieldType::Int);
        f.kind = FieldKind::Ref {
            target: target.into(),
        };
        f
    }

    /// A computed property living in the table's JSON body.
    pub fn property(name: impl Into<String>, ty: FieldType) -> Field {
        let mut f = Field::new(name, ty);
        f.kind = FieldKind::Property(ty);
        f.required = false;
        f
    }

    /// The JSON body column. At most one per table.
    pub fn body(name: impl Into<String>) -> Field {
        let mut f = Field::new(name, FieldType::Json);
        f.body = true;
        f.required = false;
        f
    }

    /// The discriminator column of an extendable root.
    pub fn cid(name: impl Into<String>) -> Field {
        let mut f = Field::new(name, FieldType::Text);
        f.cid = true;
        f
    }

    pub fn primary_key(mut self) -> Field {
        self.pk = true;
        self
    }

    pub fn optional(mut self) -> Field {
        self.required = false;
        self
    }

    pub fn indexed(mut self) -> Field {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Field {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Field {
        self.column = column.into();
        self
    }

    pub fn default_sql(mut self, sql: impl Into<String>) -> Field {
        self.default_sql = Some(sql.into());
        self
    }

    /// Override the name of the reverse-many relation created on the
    /// referenced table.
    pub fn reverse_name(mut self, name: impl Into<String>) -> Field {
        self.reverse_name = Some(name.into());
        self
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.kind, FieldKind::Ref { .. })
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, FieldKind::Property(_))
    }

    /// Referenced table name, for `Ref` fields.
    pub fn ref_target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Ref { target } => Some(target),
            _ => None,
        }
    }

    /// Scalar type of the stored value, for non-ref fields.
    pub fn value_type(&self) -> Option<FieldType> {
        match self.kind {
            FieldKind::Plain(ty) | FieldKind::Property(ty) => Some(ty),
            FieldKind::Ref { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_flags() {
        let f = Field::new("name", FieldType::Text);
        assert!(f.required && !f.pk && !f.body);
        assert_eq!(f.column, "name");

        let r = Field::reference("author", "Author").optional().indexed();
        assert_eq!(r.ref_target(), Some("Author"));
        assert!(!r.required && r.indexed);

        let p = Field::property("width", FieldType::Float);
        assert!(p.is_property() && !p.required);
        assert_eq!(p.value_type(), Some(FieldType::Float));

        let b = Field::body("data");
        assert!(b.body);
        assert_eq!(b.value_type(), Some(FieldType::Json));
    }

    #[test]
    fn unique_implies_indexed() {
        let f = Field::new("code", FieldType::Text).unique();
        assert!(f.unique && f.indexed);
    }
}
