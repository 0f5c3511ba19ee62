//! The schema registry: declaration and two-phase resolution.

use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::debug;

use crate::field::Field;
use crate::table::{ManyRelation, ManyToManyRelation, Table};
use crate::SchemaError;

/// All declared tables of one database. Tables are declared in any
/// order, then `resolve` links inheritance, back-fills reverse-many
/// relations and synthesizes junction tables. After resolution the
/// registry is frozen; further declarations are rejected.
#[derive(Debug, Default)]
pub struct Registry {
    tables: IndexMap<String, Table>,
    resolved: bool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn declare(&mut self, mut table: Table) -> Result<(), SchemaError> {
        if self.resolved {
            return Err(SchemaError::Resolved(format!(
                "cannot declare `{}`",
                table.name
            )));
        }
        table.finish()?;
        if self.tables.contains_key(&table.name) {
            return Err(SchemaError::FieldName(format!(
                "table `{}` is already declared",
                table.name
            )));
        }
        debug!(table = %table.name, storage = %table.storage, "declare");
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn expect(&self, name: &str) -> Result<&Table, SchemaError> {
        self.tables
            .get(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// All tables sharing the storage of the extendable root `name`,
    /// root included, in declaration order.
    pub fn family(&self, name: &str) -> Result<Vec<&Table>, SchemaError> {
        let root = self.expect(name)?;
        if !root.extendable {
            return Err(SchemaError::FieldType(format!(
                "table `{name}` is not extendable"
            )));
        }
        Ok(self
            .tables
            .values()
            .filter(|t| t.extendable && t.storage == root.storage)
            .collect())
    }

    /// Resolve the whole schema. Idempotent; a second call is a no-op.
    pub fn resolve(&mut self) -> Result<(), SchemaError> {
        if self.resolved {
            return Ok(());
        }
        self.link_branches()?;
        self.check_targets()?;
        self.backfill_reverse_many()?;
        self.synthesize_junctions()?;
        self.resolved = true;
        debug!(tables = self.tables.len(), "schema resolved");
        Ok(())
    }

    /// True when `anc` appears on the parent chain of `name`.
    fn is_ancestor(&self, anc: &str, name: &str) -> bool {
        let mut cur = name;
        while let Some(t) = self.tables.get(cur) {
            match &t.parent {
                Some(p) if p == anc => return true,
                Some(p) => cur = p,
                None => return false,
            }
        }
        false
    }

    fn link_branches(&mut self) -> Result<(), SchemaError> {
        let names: Vec<String> = self.tables.keys().cloned().collect();
        let mut linked = HashSet::new();
        for name in &names {
            self.link_one(name, &mut linked, &mut Vec::new())?;
        }
        Ok(())
    }

    fn link_one(
        &mut self,
        name: &str,
        linked: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        if linked.contains(name) {
            return Ok(());
        }
        let parent_name = match self.expect(name)?.parent.clone() {
            Some(p) => p,
            None => {
                linked.insert(name.to_string());
                return Ok(());
            }
        };
        if stack.iter().any(|n| n == name) {
            return Err(SchemaError::FieldName(format!(
                "inheritance cycle through table `{name}`"
            )));
        }
        stack.push(name.to_string());
        self.link_one(&parent_name, linked, stack)?;
        stack.pop();

        let parent = self.expect(&parent_name)?;
        if !parent.extendable {
            return Err(SchemaError::FieldType(format!(
                "table `{}` extends `{parent_name}`, which is not extendable",
                name
            )));
        }
        let parent = parent.clone();
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))?;

        if table.fields.values().any(|f| f.pk) {
            return Err(SchemaError::FieldName(format!(
                "branch `{name}` cannot redeclare the primary key"
            )));
        }
        if table.cid.is_some() && parent.cid.is_some() {
            return Err(SchemaError::FieldName(format!(
                "branch `{name}` cannot redeclare the discriminator"
            )));
        }

        // Parent fields come first; own fields override by name.
        let mut fields = parent.fields.clone();
        for (k, v) in std::mem::take(&mut table.fields) {
            fields.insert(k, v);
        }
        table.fields = fields;
        table.pk = parent.pk.clone();
        if table.cid.is_none() {
            table.cid = parent.cid.clone();
        }
        if table.body.is_none() {
            table.body = parent.body.clone();
        }
        table.storage = parent.storage.clone();
        table.schema = parent.schema.clone();
        for (k, v) in &parent.many {
            table.many.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &parent.many_to_many {
            table
                .many_to_many
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        linked.insert(name.to_string());
        Ok(())
    }

    fn check_targets(&self) -> Result<(), SchemaError> {
        for t in self.tables.values() {
            for f in t.fields.values() {
                if let Some(target) = f.ref_target() {
                    if !self.tables.contains_key(target) {
                        return Err(SchemaError::UnknownTable(format!(
                            "{target} (referenced by `{}.{}`)",
                            t.name, f.name
                        )));
                    }
                }
            }
            for rel in t.many.values().map(|r| &r.target).chain(
                t.many_to_many.values().map(|r| &r.target),
            ) {
                if !self.tables.contains_key(rel) {
                    return Err(SchemaError::UnknownTable(format!(
                        "{rel} (related to `{}`)",
                        t.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn backfill_reverse_many(&mut self) -> Result<(), SchemaError> {
        struct Backfill {
            target: String,
            rel_name: String,
            source: String,
            field: String,
        }
        let mut fills = Vec::new();
        for t in self.tables.values() {
            for f in t.fields.values() {
                let Some(target) = f.ref_target() else { continue };
                fills.push(Backfill {
                    target: target.to_string(),
                    rel_name: f
                        .reverse_name
                        .clone()
                        .unwrap_or_else(|| t.snake_name.clone()),
                    source: t.name.clone(),
                    field: f.name.clone(),
                });
            }
        }
        for fill in fills {
            let existing = self
                .tables
                .get(&fill.target)
                .and_then(|t| t.many.get(&fill.rel_name))
                .map(|r| r.target.clone());
            match existing {
                Some(owner) if owner != fill.source => {
                    // Inherited refs re-register under the branch; the
                    // ancestor's relation already covers them.
                    if self.is_ancestor(&owner, &fill.source)
                        || self.is_ancestor(&fill.source, &owner)
                    {
                        continue;
                    }
                    return Err(SchemaError::FieldName(format!(
                        "reverse relation `{}` on table `{}` is taken by `{owner}`; \
                         set a different reverse name on `{}.{}`",
                        fill.rel_name, fill.target, fill.source, fill.field
                    )));
                }
                _ => {}
            }
            let target = self
                .tables
                .get_mut(&fill.target)
                .ok_or_else(|| SchemaError::UnknownTable(fill.target.clone()))?;
            target
                .many
                .entry(fill.rel_name)
                .and_modify(|r| r.foreign_field = Some(fill.field.clone()))
                .or_insert(ManyRelation {
                    target: fill.source,
                    foreign_field: Some(fill.field),
                });
        }

        // Every explicit collection must now be backed by a foreign key.
        for t in self.tables.values() {
            for (name, rel) in &t.many {
                let fk_ok = rel.foreign_field.as_ref().is_some_and(|fk| {
                    self.tables
                        .get(&rel.target)
                        .is_some_and(|ft| ft.fields.contains_key(fk))
                });
                if !fk_ok {
                    return Err(SchemaError::FieldType(format!(
                        "no reference from `{}` back to `{}` for collection `{name}`; \
                         add the foreign key or use many-to-many",
                        rel.target, t.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn synthesize_junctions(&mut self) -> Result<(), SchemaError> {
        struct Junction {
            a: String,
            rel: String,
            b: String,
            rev: String,
            table: Table,
        }
        let mut specs = Vec::new();
        let mut claimed: HashSet<(String, String)> = HashSet::new();
        for (aname, a) in &self.tables {
            for (rel_name, rel) in &a.many_to_many {
                if rel.junction.is_some() || claimed.contains(&(aname.clone(), rel_name.clone())) {
                    continue;
                }
                let b = self.expect(&rel.target)?;
                if b.storage == a.storage {
                    return Err(SchemaError::FieldName(format!(
                        "self-referential many-to-many `{}` on table `{aname}` is not supported",
                        rel_name
                    )));
                }
                let rev = match b
                    .many_to_many
                    .iter()
                    .find(|(_, r)| r.target == *aname)
                {
                    Some((name, _)) => name.clone(),
                    None => rel
                        .reverse_name
                        .clone()
                        .unwrap_or_else(|| a.snake_name.clone()),
                };
                if let Some(r) = b.many_to_many.get(&rev) {
                    if r.target != *aname {
                        return Err(SchemaError::FieldName(format!(
                            "many-to-many name `{rev}` on table `{}` is taken by `{}`; \
                             set a different reverse name",
                            b.name, r.target
                        )));
                    }
                }

                let junction_name = format!("{aname}{}", capitalize(rel_name));
                let junction = Table::new(&junction_name)
                    .storage(format!("{}_{rel_name}", a.storage))
                    .field(Field::reference(&b.storage, &b.name).indexed())
                    .field(Field::reference(&a.storage, aname).indexed());
                specs.push(Junction {
                    a: aname.clone(),
                    rel: rel_name.clone(),
                    b: b.name.clone(),
                    rev: rev.clone(),
                    table: junction,
                });
                claimed.insert((b.name.clone(), rev));
            }
        }
        for mut spec in specs {
            spec.table.finish()?;
            if self.tables.contains_key(&spec.table.name) {
                return Err(SchemaError::FieldName(format!(
                    "junction table `{}` collides with a declared table",
                    spec.table.name
                )));
            }
            let junction_name = spec.table.name.clone();
            debug!(junction = %junction_name, "synthesize junction table");
            self.tables.insert(junction_name.clone(), spec.table);

            let a = self
                .tables
                .get_mut(&spec.a)
                .ok_or_else(|| SchemaError::UnknownTable(spec.a.clone()))?;
            if let Some(rel) = a.many_to_many.get_mut(&spec.rel) {
                rel.junction = Some(junction_name.clone());
                rel.reverse_name = Some(spec.rev.clone());
            }
            let b = self
                .tables
                .get_mut(&spec.b)
                .ok_or_else(|| SchemaError::UnknownTable(spec.b.clone()))?;
            let entry = b
                .many_to_many
                .entry(spec.rev)
                .or_insert(ManyToManyRelation {
                    target: spec.a.clone(),
                    reverse_name: None,
                    junction: None,
                });
            entry.junction = Some(junction_name);
            entry.reverse_name = Some(spec.rel);
        }
        Ok(())
    }

    /// The combined shape of an extendable family: every member's
    /// fields merged into one table, branch additions made nullable.
    pub fn combined(&self, root_name: &str) -> Result<Table, SchemaError> {
        let root = self.expect(root_name)?;
        if !root.extendable || !root.is_root {
            return Err(SchemaError::FieldType(format!(
                "table `{root_name}` is not an extendable root"
            )));
        }
        let mut combined = root.clone();
        combined.name = format!("{root_name}Combined");
        combined.discriminator = None;
        combined.many.clear();
        combined.many_to_many.clear();

        let mut owner: IndexMap<String, String> = IndexMap::new();
        for f in root.fields.keys() {
            owner.insert(f.clone(), root.name.clone());
        }
        for member in self.family(root_name)? {
            if member.name == root.name {
                continue;
            }
            for f in member.fields.values() {
                match combined.fields.get(&f.name) {
                    Some(existing) if existing.kind != f.kind => {
                        let first = owner
                            .get(&f.name)
                            .map(String::as_str)
                            .unwrap_or(root_name);
                        if self.is_ancestor(first, &member.name)
                            || self.is_ancestor(&member.name, first)
                        {
                            continue;
                        }
                        return Err(SchemaError::FieldType(format!(
                            "field `{}` differs between `{first}` and `{}`",
                            f.name, member.name
                        )));
                    }
                    Some(_) => {}
                    None => {
                        let mut f = f.clone();
                        f.required = false;
                        owner.insert(f.name.clone(), member.name.clone());
                        combined.fields.insert(f.name.clone(), f);
                    }
                }
            }
        }
        Ok(combined)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn library() -> Registry {
        let mut reg = Registry::new();
        reg.declare(
            Table::new("Author").field(Field::new("name", FieldType::Text)),
        )
        .unwrap();
        reg.declare(
            Table::new("Book")
                .field(Field::new("title", FieldType::Text))
                .field(Field::reference("author", "Author"))
                .many_to_many("sellers", "Seller"),
        )
        .unwrap();
        reg.declare(
            Table::new("Seller").field(Field::new("name", FieldType::Text)),
        )
        .unwrap();
        reg
    }

    #[test]
    fn reverse_many_is_backfilled() {
        let mut reg = library();
        reg.resolve().unwrap();
        let author = reg.get("Author").unwrap();
        let rel = author.many.get("books").unwrap();
        assert_eq!(rel.target, "Book");
        assert_eq!(rel.foreign_field.as_deref(), Some("author"));
    }

    #[test]
    fn one_junction_per_pair() {
        let mut reg = library();
        reg.resolve().unwrap();

        let junction = reg.get("BookSellers").unwrap();
        assert_eq!(junction.storage, "books_sellers");
        assert!(junction.fields["sellers"].is_ref());
        assert!(junction.fields["books"].is_ref());
        assert!(junction.fields["sellers"].indexed);

        let book_rel = &reg.get("Book").unwrap().many_to_many["sellers"];
        let seller_rel = &reg.get("Seller").unwrap().many_to_many["books"];
        assert_eq!(book_rel.junction.as_deref(), Some("BookSellers"));
        assert_eq!(seller_rel.junction.as_deref(), Some("BookSellers"));
        assert_eq!(seller_rel.reverse_name.as_deref(), Some("sellers"));

        assert_eq!(reg.tables().count(), 4);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut reg = library();
        reg.resolve().unwrap();
        let before: Vec<String> = reg.tables().map(|t| t.name.clone()).collect();
        reg.resolve().unwrap();
        let after: Vec<String> = reg.tables().map(|t| t.name.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn declare_after_resolve_fails() {
        let mut reg = library();
        reg.resolve().unwrap();
        let err = reg.declare(Table::new("Late")).unwrap_err();
        assert!(matches!(err, SchemaError::Resolved(_)));
    }

    #[test]
    fn dangling_reference_fails() {
        let mut reg = Registry::new();
        reg.declare(Table::new("A").field(Field::reference("b", "B")))
            .unwrap();
        assert!(matches!(
            reg.resolve(),
            Err(SchemaError::UnknownTable(_))
        ));
    }

    #[test]
    fn explicit_many_without_fk_fails() {
        let mut reg = Registry::new();
        reg.declare(Table::new("Box").has_many("fruits", "Fruit"))
            .unwrap();
        reg.declare(Table::new("Fruit").field(Field::new("name", FieldType::Text)))
            .unwrap();
        assert!(matches!(reg.resolve(), Err(SchemaError::FieldType(_))));
    }

    #[test]
    fn explicit_many_matches_fk() {
        let mut reg = Registry::new();
        reg.declare(Table::new("Box").has_many("fruits", "Fruit"))
            .unwrap();
        reg.declare(
            Table::new("Fruit")
                .field(Field::new("name", FieldType::Text))
                .field(Field::reference("box", "Box").reverse_name("fruits")),
        )
        .unwrap();
        reg.resolve().unwrap();
        let rel = &reg.get("Box").unwrap().many["fruits"];
        assert_eq!(rel.foreign_field.as_deref(), Some("box"));
    }

    fn catalog() -> Registry {
        let mut reg = Registry::new();
        reg.declare(
            Table::new("Catalog")
                .extendable()
                .field(Field::cid("cid"))
                .field(Field::new("name", FieldType::Text))
                .field(Field::reference("parent", "Catalog").optional()),
        )
        .unwrap();
        reg.declare(
            Table::new("ItemCatalog")
                .extending("Catalog")
                .field(Field::new("unit", FieldType::Text)),
        )
        .unwrap();
        reg.declare(
            Table::new("GroupCatalog")
                .extending("Catalog")
                .field(Field::new("random_id", FieldType::Int)),
        )
        .unwrap();
        reg
    }

    #[test]
    fn branches_share_storage_and_pk() {
        let mut reg = catalog();
        reg.resolve().unwrap();
        let item = reg.get("ItemCatalog").unwrap();
        assert_eq!(item.storage, "catalogs");
        assert_eq!(item.pk, "id");
        assert_eq!(item.cid.as_deref(), Some("cid"));
        assert_eq!(item.discriminator.as_deref(), Some("ItemCatalog"));
        assert!(item.fields.contains_key("name"));
        assert!(item.fields.contains_key("unit"));
        assert!(!item.fields.contains_key("random_id"));
    }

    #[test]
    fn combined_merges_branch_fields_nullable() {
        let mut reg = catalog();
        reg.resolve().unwrap();
        let combined = reg.combined("Catalog").unwrap();
        assert_eq!(combined.storage, "catalogs");
        let unit = &combined.fields["unit"];
        let random_id = &combined.fields["random_id"];
        assert!(!unit.required && !random_id.required);
        assert!(combined.fields["name"].required);
    }

    #[test]
    fn combined_rejects_conflicting_types() {
        let mut reg = catalog();
        reg.declare(
            Table::new("OddCatalog")
                .extending("Catalog")
                .field(Field::new("unit", FieldType::Int)),
        )
        .unwrap();
        reg.resolve().unwrap();
        assert!(matches!(
            reg.combined("Catalog"),
            Err(SchemaError::FieldType(_))
        ));
    }

    #[test]
    fn family_lists_all_members() {
        let mut reg = catalog();
        reg.resolve().unwrap();
        let names: Vec<&str> = reg
            .family("Catalog")
            .unwrap()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, ["Catalog", "ItemCatalog", "GroupCatalog"]);
    }
}
