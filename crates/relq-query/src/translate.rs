//! The dialect translator: compiles plans and schema objects to SQL.
//!
//! Dialect-independent compilation lives here as default trait
//! methods; concrete dialects override the small primitive surface
//! (placeholders, type names, window syntax, aggregation helpers) and
//! the few statements whose shape genuinely differs.

use relq_expr::ExprDialect;
use relq_model::{Field, FieldKind, FieldType, Registry, Table};

use crate::query::{JoinKind, QueryPlan, WithClause};
use crate::TranslateError;

/// What a dialect can and cannot do; drives every internal branch.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_schema: bool,
    pub supports_default: bool,
    pub supports_copy: bool,
}

/// Which arm of a recursive chain is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Anchor,
    Recursive,
}

pub trait Translator: ExprDialect {
    fn capabilities(&self) -> Capabilities;

    // --- naming -----------------------------------------------------

    fn table_ref_by_name(&self, schema: Option<&str>, storage: &str) -> String {
        match schema {
            Some(s) if self.capabilities().supports_schema => {
                format!("{}.{}", self.quote_ident(s), self.quote_ident(storage))
            }
            _ => self.quote_ident(storage),
        }
    }

    fn table_ref(&self, table: &Table) -> String {
        self.table_ref_by_name(table.schema.as_deref(), &table.storage)
    }

    // --- column primitives -----------------------------------------

    /// Primary key column definition; the one piece of DDL every
    /// dialect spells differently.
    fn pk_column_sql(&self, field: &Field) -> Result<String, TranslateError>;

    /// Aggregate a column's values into one row (id-list collection).
    fn array_agg(&self, expr: &str) -> String;

    /// OFFSET/LIMIT tail; dialects disagree on ordering and defaults.
    fn window_sql(&self, offset: Option<u64>, limit: Option<u64>) -> String {
        let mut out = String::new();
        if let Some(offset) = offset {
            out.push_str(&format!("\nOFFSET {offset}"));
        }
        if let Some(limit) = limit {
            out.push_str(&format!("\nLIMIT {limit}"));
        }
        out
    }

    /// The stored type of a column, resolving references to the target
    /// table's primary key type.
    fn column_type(&self, registry: &Registry, field: &Field) -> Result<String, TranslateError> {
        match &field.kind {
            FieldKind::Plain(ty) | FieldKind::Property(ty) => Ok(self.type_name(*ty).to_string()),
            FieldKind::Ref { target } => {
                let target = registry
                    .get(target)
                    .ok_or_else(|| TranslateError::Codegen(format!("unknown table `{target}`")))?;
                match target.pk_field().kind {
                    FieldKind::Plain(ty) => Ok(self.type_name(ty).to_string()),
                    _ => Err(TranslateError::Codegen(format!(
                        "table `{}` has a non-scalar primary key",
                        target.name
                    ))),
                }
            }
        }
    }

    fn column_sql(
        &self,
        registry: &Registry,
        table: &Table,
        field: &Field,
    ) -> Result<String, TranslateError> {
        if field.pk {
            return self.pk_column_sql(field);
        }
        let mut out = format!(
            "{} {}",
            self.quote_ident(&field.column),
            self.column_type(registry, field)?
        );
        if field.unique {
            out.push_str(" UNIQUE");
        }
        // Branch columns of an extendable family must stay nullable:
        // other branches do not fill them.
        if field.required && !table.extendable {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = &field.default_sql {
            if self.capabilities().supports_default {
                out.push_str(&format!(" DEFAULT {default}"));
            }
        }
        Ok(out)
    }

    // --- DDL --------------------------------------------------------

    fn create_schema(&self, schema: &str) -> Result<String, TranslateError> {
        if !self.capabilities().supports_schema {
            return Err(TranslateError::Unsupported("schemas".into()));
        }
        Ok(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            self.quote_ident(schema)
        ))
    }

    /// Property fields live inside the body column and are skipped.
    fn create_table(&self, registry: &Registry, table: &Table) -> Result<String, TranslateError> {
        let mut columns = Vec::new();
        for field in table.fields.values() {
            if field.is_property() {
                continue;
            }
            columns.push(format!("  {}", self.column_sql(registry, table, field)?));
        }
        Ok(format!(
            "CREATE TABLE {} (\n{}\n)",
            self.table_ref(table),
            columns.join(",\n")
        ))
    }

    fn drop_table(&self, table: &Table) -> String {
        self.drop_table_by_name(table.schema.as_deref(), &table.storage)
    }

    fn drop_table_by_name(&self, schema: Option<&str>, storage: &str) -> String {
        format!("DROP TABLE {}", self.table_ref_by_name(schema, storage))
    }

    fn index_name(&self, table: &Table, field: &Field) -> String {
        format!("idx_{}_{}", table.storage, field.column)
    }

    fn create_index(&self, table: &Table, field: &Field) -> String {
        let unique = if field.unique { "UNIQUE " } else { "" };
        format!(
            "CREATE {unique}INDEX {} ON {} ({})",
            self.quote_ident(&self.index_name(table, field)),
            self.table_ref(table),
            self.quote_ident(&field.column)
        )
    }

    fn drop_index(&self, table: &Table, field: &Field) -> String {
        format!("DROP INDEX {}", self.quote_ident(&self.index_name(table, field)))
    }

    fn add_column(
        &self,
        registry: &Registry,
        table: &Table,
        field: &Field,
    ) -> Result<String, TranslateError> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.table_ref(table),
            self.column_sql(registry, table, field)?
        ))
    }

    fn drop_column(&self, table: &Table, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.table_ref(table),
            self.quote_ident(column)
        )
    }

    fn rename_column(&self, table: &Table, old: &str, new: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.table_ref(table),
            self.quote_ident(old),
            self.quote_ident(new)
        )
    }

    fn rename_table(&self, table: &Table, new_storage: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.table_ref(table),
            self.quote_ident(new_storage)
        )
    }

    fn alter_field_type(
        &self,
        table: &Table,
        column: &str,
        ty: FieldType,
    ) -> Result<String, TranslateError> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.table_ref(table),
            self.quote_ident(column),
            self.type_name(ty)
        ))
    }

    fn set_not_null(&self, table: &Table, column: &str) -> Result<String, TranslateError> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            self.table_ref(table),
            self.quote_ident(column)
        ))
    }

    fn drop_not_null(&self, table: &Table, column: &str) -> Result<String, TranslateError> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            self.table_ref(table),
            self.quote_ident(column)
        ))
    }

    fn set_default_value(
        &self,
        table: &Table,
        column: &str,
        default_sql: &str,
    ) -> Result<String, TranslateError> {
        if !self.capabilities().supports_default {
            return Err(TranslateError::Unsupported("column defaults".into()));
        }
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {default_sql}",
            self.table_ref(table),
            self.quote_ident(column)
        ))
    }

    /// Required references cascade on delete; optional ones null out.
    fn add_reference(
        &self,
        registry: &Registry,
        table: &Table,
        field: &Field,
    ) -> Result<String, TranslateError> {
        let target_name = field.ref_target().ok_or_else(|| {
            TranslateError::Codegen(format!("`{}` is not a reference", field.name))
        })?;
        let target = registry
            .get(target_name)
            .ok_or_else(|| TranslateError::Codegen(format!("unknown table `{target_name}`")))?;
        let on_delete = if field.required { "CASCADE" } else { "SET NULL" };
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {on_delete}",
            self.table_ref(table),
            self.quote_ident(&format!("fk_{}_{}", table.storage, field.column)),
            self.quote_ident(&field.column),
            self.table_ref(target),
            self.quote_ident(&target.pk_field().column)
        ))
    }

    fn drop_reference(&self, table: &Table, field: &Field) -> Result<String, TranslateError> {
        Ok(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.table_ref(table),
            self.quote_ident(&format!("fk_{}_{}", table.storage, field.column))
        ))
    }

    // --- DML --------------------------------------------------------

    /// Full-shape insert: one placeholder per non-pk field, property
    /// fields assembled into the body column, RETURNING the key.
    fn insert(&self, table: &Table) -> Result<String, TranslateError> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut body_pairs: Vec<(String, String)> = Vec::new();
        for field in table.fields.values() {
            if field.pk {
                continue;
            }
            match &field.kind {
                FieldKind::Property(ty) => {
                    let encoded =
                        self.json_encode(&self.placeholder(&field.name), *ty)?;
                    body_pairs.push((field.name.clone(), encoded));
                }
                _ if field.body => {} // written through the properties
                _ => {
                    columns.push(self.quote_ident(&field.column));
                    values.push(self.placeholder(&field.name));
                }
            }
        }
        if let Some(body) = &table.body {
            columns.push(self.quote_ident(&table.fields[body].column));
            values.push(self.json_object(&body_pairs));
        }
        if columns.is_empty() {
            return Err(TranslateError::Codegen(format!(
                "table `{}` has no insertable columns",
                table.name
            )));
        }
        Ok(format!(
            "INSERT INTO {} ({})\nVALUES ({})\nRETURNING {}",
            self.table_ref(table),
            columns.join(", "),
            values.join(", "),
            self.quote_ident(&table.pk_field().column)
        ))
    }

    /// Update the named fields of one row, selected by primary key.
    /// Property updates merge into the body column.
    fn update(&self, table: &Table, fields: &[&str]) -> Result<String, TranslateError> {
        let mut sets = Vec::new();
        let mut body_pairs: Vec<(String, String)> = Vec::new();
        for name in fields {
            let field = table.fields.get(*name).ok_or_else(|| {
                TranslateError::Codegen(format!("unknown field `{name}` on `{}`", table.name))
            })?;
            match &field.kind {
                FieldKind::Property(ty) => {
                    let encoded = self.json_encode(&self.placeholder(&field.name), *ty)?;
                    body_pairs.push((field.name.clone(), encoded));
                }
                _ => sets.push(format!(
                    "{} = {}",
                    self.quote_ident(&field.column),
                    self.placeholder(&field.name)
                )),
            }
        }
        if !body_pairs.is_empty() {
            let body = table.body.as_ref().ok_or_else(|| {
                TranslateError::Codegen(format!("table `{}` has no body column", table.name))
            })?;
            let body_col = self.quote_ident(&table.fields[body].column);
            sets.push(format!(
                "{body_col} = {}",
                self.json_merge(&body_col, &self.json_object(&body_pairs))
            ));
        }
        if sets.is_empty() {
            return Err(TranslateError::Codegen("empty update".into()));
        }
        let pk = &table.pk_field().column;
        Ok(format!(
            "UPDATE {}\nSET {}\nWHERE {} = {}",
            self.table_ref(table),
            sets.join(", "),
            self.quote_ident(pk),
            self.placeholder(pk)
        ))
    }

    fn delete_all(&self, table: &Table) -> String {
        format!("DELETE FROM {}", self.table_ref(table))
    }

    fn delete_by_column(&self, table: &Table, column: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {} = {}",
            self.table_ref(table),
            self.quote_ident(column),
            self.placeholder(column)
        )
    }

    /// Delete the rows a subselect picked. The generic shape uses an
    /// IN subselect; Postgres overrides with a USING join.
    fn delete_selected(&self, table: &Table, sub_pk: &str, sub_sql: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN (SELECT {} FROM (\n{sub_sql}\n) AS {})",
            self.table_ref(table),
            self.quote_ident(&table.pk_field().column),
            self.quote_ident(sub_pk),
            self.quote_ident("_sel")
        )
    }

    // --- junction links --------------------------------------------

    /// Collect the far-side ids linked to one owner row.
    fn select_links(&self, junction: &Table, owner_col: &str, other_col: &str) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.array_agg(&self.quote_ident(other_col)),
            self.table_ref(junction),
            self.quote_ident(owner_col),
            self.placeholder("owner")
        )
    }

    /// Remove links; `ids` names the `_id_{i}` placeholders to bind,
    /// zero meaning every link of the owner.
    fn delete_links(&self, junction: &Table, owner_col: &str, other_col: &str, ids: usize) -> String {
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.table_ref(junction),
            self.quote_ident(owner_col),
            self.placeholder("owner")
        );
        if ids > 0 {
            let list: Vec<String> = (0..ids)
                .map(|i| self.placeholder(&format!("_id_{i}")))
                .collect();
            sql.push_str(&format!(
                " AND {} IN ({})",
                self.quote_ident(other_col),
                list.join(", ")
            ));
        }
        sql
    }

    /// Batched link insert with `_id_{i}` placeholders per row.
    fn insert_links(&self, junction: &Table, owner_col: &str, other_col: &str, ids: usize) -> String {
        let rows: Vec<String> = (0..ids)
            .map(|i| {
                format!(
                    "({}, {})",
                    self.placeholder("owner"),
                    self.placeholder(&format!("_id_{i}"))
                )
            })
            .collect();
        format!(
            "INSERT INTO {} ({}, {})\nVALUES {}",
            self.table_ref(junction),
            self.quote_ident(owner_col),
            self.quote_ident(other_col),
            rows.join(", ")
        )
    }

    /// Bulk link load via COPY, where the dialect supports it.
    fn copy_links(
        &self,
        junction: &Table,
        owner_col: &str,
        other_col: &str,
    ) -> Result<String, TranslateError> {
        if !self.capabilities().supports_copy {
            return Err(TranslateError::Unsupported("COPY FROM STDIN".into()));
        }
        Ok(format!(
            "COPY {} ({}, {}) FROM STDIN",
            self.table_ref(junction),
            self.quote_ident(owner_col),
            self.quote_ident(other_col)
        ))
    }

    // --- introspection ---------------------------------------------

    fn select_all_tables(&self) -> String;

    fn table_exists(&self) -> String;

    // --- SELECT compilation ----------------------------------------

    fn with_item(&self, clause: &WithClause) -> String {
        let hint = if clause.not_materialized {
            " NOT MATERIALIZED"
        } else {
            ""
        };
        format!(
            "{} AS{hint} (\n{}\n)",
            self.quote_ident(&clause.name),
            clause.sql
        )
    }

    /// Rewrite a sort expression for the statement wrapping the chain
    /// CTE: a column reference exported by the select list becomes the
    /// name it was exported under.
    fn chain_sort(&self, plan: &QueryPlan, text: &str) -> String {
        for (name, item) in &plan.select {
            if let Some(rest) = text.strip_prefix(item.text.as_str()) {
                return format!("{}{rest}", self.quote_ident(name));
            }
        }
        text.to_string()
    }

    /// Compile a plan into a full SELECT statement.
    fn select(&self, plan: &QueryPlan) -> Result<String, TranslateError> {
        if plan.chained.is_some() {
            let anchor = self.select_body(plan, Some(ChainMode::Anchor))?;
            let recursive = self.select_body(plan, Some(ChainMode::Recursive))?;
            let mut items: Vec<String> = plan.withs.iter().map(|w| self.with_item(w)).collect();
            items.push(format!(
                "{} AS (\n{anchor}\nUNION\n{recursive}\n)",
                self.quote_ident("_chain")
            ));
            // UNION arms cannot carry ORDER BY or a window; both apply
            // to the enclosing statement.
            let mut sql = format!(
                "WITH RECURSIVE {}\nSELECT * FROM {}",
                items.join(",\n"),
                self.quote_ident("_chain")
            );
            if !plan.sorts.is_empty() {
                let sorts: Vec<String> = plan
                    .sorts
                    .iter()
                    .map(|s| self.chain_sort(plan, &s.text))
                    .collect();
                sql.push_str(&format!("\nORDER BY {}", sorts.join(", ")));
            }
            sql.push_str(&self.window_sql(plan.offset, plan.limit));
            return Ok(sql);
        }
        let body = self.select_body(plan, None)?;
        if plan.withs.is_empty() {
            return Ok(body);
        }
        let items: Vec<String> = plan.withs.iter().map(|w| self.with_item(w)).collect();
        Ok(format!("WITH {}\n{body}", items.join(",\n")))
    }

    /// One SELECT body. In chain modes the WITH list, ORDER BY and the
    /// window are left to the enclosing statement.
    fn select_body(
        &self,
        plan: &QueryPlan,
        mode: Option<ChainMode>,
    ) -> Result<String, TranslateError> {
        if plan.select.is_empty() {
            return Err(TranslateError::Codegen(format!(
                "query `{}` selects nothing",
                plan.name
            )));
        }

        let mut sql = String::from("SELECT ");
        if plan.distinct {
            sql.push_str("DISTINCT ");
        }
        let items: Vec<String> = plan
            .select
            .iter()
            .map(|(name, item)| format!("{} AS {}", item.text, self.quote_ident(name)))
            .collect();
        sql.push_str(&items.join(", "));

        let mut from = String::new();
        for (alias, join) in &plan.joins {
            let target = format!("{} AS {}", join.target, self.quote_ident(alias));
            match join.kind {
                JoinKind::Source => {
                    if from.is_empty() {
                        from.push_str(&format!("\nFROM {target}"));
                    } else {
                        from.push_str(&format!(", {target}"));
                    }
                }
                JoinKind::Inner | JoinKind::Left => {
                    let keyword = if join.kind == JoinKind::Inner {
                        "INNER"
                    } else {
                        "LEFT"
                    };
                    let condition = join
                        .condition
                        .as_deref()
                        .unwrap_or("TRUE")
                        .replace("{alias}", &self.quote_ident(alias));
                    from.push_str(&format!("\n{keyword} JOIN {target} ON {condition}"));
                }
            }
        }
        if mode == Some(ChainMode::Recursive) {
            if let Some(chained) = &plan.chained {
                from.push_str(&format!(
                    "\nINNER JOIN {chain} ON {} = {chain}.{}",
                    chained.id_expr,
                    self.quote_ident(&chained.next_name),
                    chain = self.quote_ident("_chain")
                ));
            }
        }
        sql.push_str(&from);

        let mut filters: Vec<String> = plan.filters.iter().map(|f| f.text.clone()).collect();
        if mode == Some(ChainMode::Anchor) {
            if let Some(chained) = &plan.chained {
                filters.push(format!("({} = {})", chained.id_expr, chained.seed));
            }
        }
        if !filters.is_empty() {
            sql.push_str(&format!("\nWHERE {}", filters.join(" AND ")));
        }

        if !plan.groups.is_empty() {
            let groups: Vec<&str> = plan.groups.iter().map(|g| g.text.as_str()).collect();
            sql.push_str(&format!("\nGROUP BY {}", groups.join(", ")));
        } else if plan.has_aggregates() {
            // Group on the ordinal positions of the plain select items.
            let ordinals: Vec<String> = plan
                .select
                .values()
                .enumerate()
                .filter(|(_, item)| !item.aggregated)
                .map(|(i, _)| (i + 1).to_string())
                .collect();
            if !ordinals.is_empty() {
                sql.push_str(&format!("\nGROUP BY {}", ordinals.join(", ")));
            }
        }

        if !plan.group_filters.is_empty() {
            let having: Vec<String> =
                plan.group_filters.iter().map(|f| f.text.clone()).collect();
            sql.push_str(&format!("\nHAVING {}", having.join(" AND ")));
        }

        if mode.is_none() {
            if !plan.sorts.is_empty() {
                let sorts: Vec<&str> = plan.sorts.iter().map(|s| s.text.as_str()).collect();
                sql.push_str(&format!("\nORDER BY {}", sorts.join(", ")));
            }
            sql.push_str(&self.window_sql(plan.offset, plan.limit));
        }

        Ok(sql)
    }
}
