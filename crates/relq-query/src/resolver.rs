//! Lazy field and join resolution.
//!
//! A `TableCursor` is a handle on one aliased table inside a query.
//! Field access returns either a column expression or a deeper cursor;
//! the joins a cursor needs are registered on first use and deduped by
//! alias, so two paths through the same relation share one join.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use relq_expr::{ExprCtx, SqlExpr};
use relq_model::{FieldKind, Registry, Table};
use tracing::trace;

use crate::query::{Join, JoinKind, QueryPlan};
use crate::translate::Translator;
use crate::QueryError;

/// A computed accessor: receives the cursor it was reached through and
/// yields an expression built against it.
pub type ViewFn = Arc<dyn Fn(&TableCursor) -> Result<SqlExpr, QueryError> + Send + Sync>;

/// User-supplied computed accessors, dispatched by name during path
/// resolution when no field or relation matches. Registered once and
/// shared read-only across queries.
#[derive(Default, Clone)]
pub struct Views {
    map: IndexMap<(String, String), ViewFn>,
}

impl Views {
    pub fn new() -> Views {
        Views::default()
    }

    /// Make `name` resolvable on `table` in dotted paths.
    pub fn register(
        &mut self,
        table: impl Into<String>,
        name: impl Into<String>,
        f: impl Fn(&TableCursor) -> Result<SqlExpr, QueryError> + Send + Sync + 'static,
    ) {
        self.map.insert((table.into(), name.into()), Arc::new(f));
    }

    fn lookup(&self, table: &str, name: &str) -> Option<&ViewFn> {
        self.map.get(&(table.to_string(), name.to_string()))
    }
}

#[derive(Clone)]
struct PendingJoin {
    alias: String,
    kind: JoinKind,
    target: String,
    condition: Option<String>,
}

/// A cursor over one table occurrence. Cloning is cheap; clones share
/// the query plan and argument table.
#[derive(Clone)]
pub struct TableCursor {
    plan: Rc<RefCell<QueryPlan>>,
    ctx: ExprCtx,
    translator: &'static dyn Translator,
    registry: Arc<Registry>,
    views: Arc<Views>,
    table: String,
    alias: String,
    pending: Vec<PendingJoin>,
}

/// Result of a single field access.
pub enum Resolved {
    Column(SqlExpr),
    Cursor(TableCursor),
    /// Produced by a registered view accessor.
    ComputedView(SqlExpr),
}

impl TableCursor {
    fn quote(&self, ident: &str) -> String {
        self.ctx.dialect.quote_ident(ident)
    }

    /// Column expression `"alias"."column"`.
    fn column(&self, column: &str) -> SqlExpr {
        self.ctx
            .raw(format!("{}.{}", self.quote(&self.alias), self.quote(column)))
    }

    /// Register this cursor's pending joins, skipping aliases that are
    /// already present.
    pub(crate) fn join_now(&self) -> Result<(), QueryError> {
        let mut plan = self.plan.borrow_mut();
        for p in &self.pending {
            if plan.joins.contains_key(&p.alias) {
                continue;
            }
            trace!(alias = %p.alias, ?p.kind, "register join");
            plan.joins.insert(
                p.alias.clone(),
                Join {
                    kind: p.kind,
                    target: p.target.clone(),
                    condition: p.condition.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The primary key column of this cursor's table.
    pub fn pk(&self) -> Result<SqlExpr, QueryError> {
        let pk = self.registry.expect(&self.table)?.pk.clone();
        match self.get(&pk)? {
            Resolved::Column(e) | Resolved::ComputedView(e) => Ok(e),
            Resolved::Cursor(_) => Err(QueryError::FieldType(format!(
                "primary key `{pk}` of `{}` is not a column",
                self.table
            ))),
        }
    }

    /// Resolve one field name on this cursor.
    pub fn get(&self, name: &str) -> Result<Resolved, QueryError> {
        let table = self.registry.expect(&self.table)?.clone();

        if let Some(field) = table.fields.get(name) {
            return match &field.kind {
                FieldKind::Plain(_) => {
                    self.join_now()?;
                    Ok(Resolved::Column(self.column(&field.column)))
                }
                FieldKind::Property(ty) => {
                    self.join_now()?;
                    let body = table.body.as_ref().ok_or_else(|| {
                        QueryError::FieldType(format!(
                            "property `{name}` has no body column on `{}`",
                            table.name
                        ))
                    })?;
                    let body_col = &table.fields[body].column;
                    let body_path = format!(
                        "{}.{}",
                        self.quote(&self.alias),
                        self.quote(body_col)
                    );
                    let raw = self.ctx.dialect.json_get(&body_path, name);
                    let decoded = self.ctx.dialect.json_decode(&raw, *ty)?;
                    Ok(Resolved::Column(self.ctx.raw(decoded)))
                }
                FieldKind::Ref { target } => {
                    self.join_now()?;
                    let target_table = self.registry.expect(target)?;
                    let pk_col = target_table.pk_field().column.clone();
                    let alias = format!("{}__{name}", self.alias);
                    let kind = if field.required {
                        JoinKind::Inner
                    } else {
                        JoinKind::Left
                    };
                    let condition = format!(
                        "{}.{} = {{alias}}.{}",
                        self.quote(&self.alias),
                        self.quote(&field.column),
                        self.quote(&pk_col)
                    );
                    Ok(Resolved::Cursor(self.descend(
                        target,
                        alias.clone(),
                        vec![PendingJoin {
                            alias,
                            kind,
                            target: self.translator.table_ref(target_table),
                            condition: Some(condition),
                        }],
                    )))
                }
            };
        }

        if let Some(rel) = table.many.get(name) {
            self.join_now()?;
            let target = self.registry.expect(&rel.target)?;
            let fk = rel.foreign_field.as_ref().ok_or_else(|| {
                QueryError::WrongOperation(format!(
                    "relation `{name}` on `{}` is unresolved",
                    table.name
                ))
            })?;
            let fk_col = target.fields[fk].column.clone();
            let alias = format!("{}__{name}", self.alias);
            let condition = format!(
                "{{alias}}.{} = {}.{}",
                self.quote(&fk_col),
                self.quote(&self.alias),
                self.quote(&table.pk_field().column)
            );
            return Ok(Resolved::Cursor(self.descend(
                &rel.target,
                alias.clone(),
                vec![PendingJoin {
                    alias,
                    kind: JoinKind::Left,
                    target: self.translator.table_ref(target),
                    condition: Some(condition),
                }],
            )));
        }

        if let Some(rel) = table.many_to_many.get(name) {
            self.join_now()?;
            let junction_name = rel.junction.as_ref().ok_or_else(|| {
                QueryError::WrongOperation(format!(
                    "relation `{name}` on `{}` is unresolved",
                    table.name
                ))
            })?;
            let junction = self.registry.expect(junction_name)?;
            let target = self.registry.expect(&rel.target)?;
            // Junction columns are named after each side's storage.
            let near_col = junction.fields[&table.storage].column.clone();
            let far_col = junction.fields[&target.storage].column.clone();

            // Qualified by the near-side alias, so walking the same
            // relation from the other direction gets its own join.
            let junction_alias = format!("{}__{}", self.alias, junction.storage);
            let junction_join = PendingJoin {
                alias: junction_alias.clone(),
                kind: JoinKind::Left,
                target: self.translator.table_ref(junction),
                condition: Some(format!(
                    "{{alias}}.{} = {}.{}",
                    self.quote(&near_col),
                    self.quote(&self.alias),
                    self.quote(&table.pk_field().column)
                )),
            };
            let alias = format!("{}__{name}", self.alias);
            let far_join = PendingJoin {
                alias: alias.clone(),
                kind: JoinKind::Left,
                target: self.translator.table_ref(target),
                condition: Some(format!(
                    "{{alias}}.{} = {}.{}",
                    self.quote(&target.pk_field().column),
                    self.quote(&junction_alias),
                    self.quote(&far_col)
                )),
            };
            return Ok(Resolved::Cursor(self.descend(
                &rel.target,
                alias,
                vec![junction_join, far_join],
            )));
        }

        if let Some(view) = self.views.lookup(&table.name, name) {
            self.join_now()?;
            return Ok(Resolved::ComputedView(view(self)?));
        }

        Err(QueryError::FieldName(format!(
            "{}.{name}",
            table.name
        )))
    }

    /// Resolve one name to an expression; a Ref resolves to its
    /// foreign-key column. The handle view accessors work with.
    pub fn f(&self, name: &str) -> Result<SqlExpr, QueryError> {
        self.terminal(name)
    }

    /// Like `get`, but a terminal Ref resolves to its foreign-key
    /// column instead of descending.
    fn terminal(&self, name: &str) -> Result<SqlExpr, QueryError> {
        let table = self.registry.expect(&self.table)?;
        if let Some(field) = table.fields.get(name) {
            if matches!(field.kind, FieldKind::Ref { .. }) {
                let column = field.column.clone();
                self.join_now()?;
                return Ok(self.column(&column));
            }
        } else if table.many.contains_key(name) || table.many_to_many.contains_key(name) {
            return Err(QueryError::FieldType(format!(
                "`{name}` is a collection; select one of its fields"
            )));
        }
        match self.get(name)? {
            Resolved::Column(e) | Resolved::ComputedView(e) => Ok(e),
            Resolved::Cursor(_) => Err(QueryError::FieldName(format!(
                "{}.{name}",
                self.table
            ))),
        }
    }

    fn descend(&self, table: &str, alias: String, pending: Vec<PendingJoin>) -> TableCursor {
        TableCursor {
            plan: self.plan.clone(),
            ctx: self.ctx.clone(),
            translator: self.translator,
            registry: self.registry.clone(),
            views: self.views.clone(),
            table: table.to_string(),
            alias,
            pending,
        }
    }
}

/// The resolver entry point for one query: turns dotted paths into
/// column expressions, walking cursors along the way.
pub struct Scheme {
    root: Option<TableCursor>,
    plan: Rc<RefCell<QueryPlan>>,
    ctx: ExprCtx,
    translator: &'static dyn Translator,
    registry: Arc<Registry>,
    views: Arc<Views>,
}

impl Scheme {
    pub(crate) fn new(
        plan: Rc<RefCell<QueryPlan>>,
        ctx: ExprCtx,
        translator: &'static dyn Translator,
        registry: Arc<Registry>,
        views: Arc<Views>,
        table: Option<String>,
    ) -> Result<Scheme, QueryError> {
        let root = match table {
            Some(name) => Some(Scheme::cursor_for(
                &plan, &ctx, translator, &registry, &views, &name,
            )?),
            None => None,
        };
        Ok(Scheme {
            root,
            plan,
            ctx,
            translator,
            registry,
            views,
        })
    }

    fn cursor_for(
        plan: &Rc<RefCell<QueryPlan>>,
        ctx: &ExprCtx,
        translator: &'static dyn Translator,
        registry: &Arc<Registry>,
        views: &Arc<Views>,
        table: &str,
    ) -> Result<TableCursor, QueryError> {
        let t = registry.expect(table)?;
        let alias = t.storage.clone();
        Ok(TableCursor {
            plan: plan.clone(),
            ctx: ctx.clone(),
            translator,
            registry: registry.clone(),
            views: views.clone(),
            table: table.to_string(),
            alias: alias.clone(),
            pending: vec![PendingJoin {
                alias,
                kind: JoinKind::Source,
                target: translator.table_ref(t),
                condition: None,
            }],
        })
    }

    /// The root cursor of a bound query.
    pub fn root(&self) -> Result<TableCursor, QueryError> {
        self.root.clone().ok_or_else(|| {
            QueryError::WrongOperation("query is not bound to a table".into())
        })
    }

    /// Resolve a dotted path to a column expression. On an unbound
    /// query the first segment names a table by its snake name.
    pub fn f(&self, path: &str) -> Result<SqlExpr, QueryError> {
        let segments: Vec<&str> = path.split('.').collect();
        let (mut cursor, rest) = self.start(&segments)?;
        let Some((last, middle)) = rest.split_last() else {
            return Err(QueryError::FieldName(path.to_string()));
        };
        for segment in middle {
            match cursor.get(segment)? {
                Resolved::Cursor(next) => cursor = next,
                Resolved::Column(_) | Resolved::ComputedView(_) => {
                    return Err(QueryError::FieldName(format!(
                        "`{segment}` in `{path}` is not a relation"
                    )))
                }
            }
        }
        cursor.terminal(last)
    }

    /// Resolve a path to a cursor, descending through relations.
    pub fn cursor(&self, path: &str) -> Result<TableCursor, QueryError> {
        let segments: Vec<&str> = path.split('.').collect();
        let (mut cursor, rest) = self.start(&segments)?;
        for segment in rest {
            match cursor.get(segment)? {
                Resolved::Cursor(next) => cursor = next,
                Resolved::Column(_) | Resolved::ComputedView(_) => {
                    return Err(QueryError::FieldType(format!(
                        "`{segment}` in `{path}` is not a relation"
                    )))
                }
            }
        }
        Ok(cursor)
    }

    fn start<'a>(
        &self,
        segments: &'a [&'a str],
    ) -> Result<(TableCursor, &'a [&'a str]), QueryError> {
        if let Some(root) = &self.root {
            return Ok((root.clone(), segments));
        }
        let Some((first, rest)) = segments.split_first() else {
            return Err(QueryError::FieldName(String::new()));
        };
        let table: Option<&Table> = self.registry.tables().find(|t| t.snake_name == *first);
        let table = table.ok_or_else(|| {
            QueryError::FieldName(format!("unknown table path `{first}`"))
        })?;
        let cursor = Scheme::cursor_for(
            &self.plan,
            &self.ctx,
            self.translator,
            &self.registry,
            &self.views,
            &table.name.clone(),
        )?;
        Ok((cursor, rest))
    }

    pub fn pk(&self) -> Result<SqlExpr, QueryError> {
        self.root()?.pk()
    }

    pub fn var(&self, name: &str) -> SqlExpr {
        self.ctx.var(name)
    }

    pub fn value(&self, value: impl Into<relq_model::Value>) -> SqlExpr {
        self.ctx.value(value)
    }

    pub fn raw(&self, text: impl Into<String>) -> SqlExpr {
        self.ctx.raw(text)
    }

    pub fn case(&self) -> relq_expr::CaseExpr {
        relq_expr::case(&self.ctx)
    }
}
