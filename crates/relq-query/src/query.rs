//! The query builder.
//!
//! A `Query` owns a `QueryPlan` behind `Rc<RefCell<..>>` so cursors
//! handed out by the resolver can register joins while the builder is
//! still being chained. All clause containers are ordered maps, which
//! makes compilation deterministic: the same build sequence always
//! yields byte-identical SQL.

use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use relq_expr::{case, CaseExpr, ExprCtx, ExprDialect, ExprError, SqlExpr};
use relq_model::{Registry, Value};
use tracing::debug;

use crate::resolver::{Scheme, TableCursor, Views};
use crate::translate::Translator;
use crate::QueryError;

static QUERY_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_query_name() -> String {
    format!("q{}", QUERY_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

/// A compiled statement: dialect SQL plus the named arguments to bind.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub args: IndexMap<String, Value>,
}

/// An expression fragment stored in a clause container. Only the text
/// and the aggregated flag survive into the plan.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub text: String,
    pub aggregated: bool,
}

impl From<SqlExpr> for Rendered {
    fn from(e: SqlExpr) -> Rendered {
        Rendered {
            text: e.text,
            aggregated: e.aggregated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// A FROM entry.
    Source,
    Inner,
    Left,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    /// Rendered relation text: a quoted table reference or a WITH name.
    pub target: String,
    /// ON condition template; `{alias}` is substituted at compile time.
    pub condition: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WithClause {
    pub name: String,
    pub sql: String,
    pub not_materialized: bool,
}

/// Recursive-walk descriptor. The same plan compiles twice: the anchor
/// arm seeds on `id = seed`, the recursive arm joins back to the chain.
#[derive(Debug, Clone)]
pub struct Chained {
    /// Select-list name of the id column.
    pub id_name: String,
    /// Rendered id column expression, e.g. `"nodes"."id"`.
    pub id_expr: String,
    /// Select-list name of the next-pointer column.
    pub next_name: String,
    /// Rendered seed placeholder.
    pub seed: String,
}

/// Everything the translator needs to compile a SELECT.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub name: String,
    pub table: Option<String>,
    pub select: IndexMap<String, Rendered>,
    pub joins: IndexMap<String, Join>,
    pub filters: Vec<Rendered>,
    pub groups: Vec<Rendered>,
    pub group_filters: Vec<Rendered>,
    pub sorts: Vec<Rendered>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub distinct: bool,
    pub withs: Vec<WithClause>,
    pub chained: Option<Chained>,
    pub frozen: Option<String>,
}

impl QueryPlan {
    fn new(name: String) -> QueryPlan {
        QueryPlan {
            name,
            table: None,
            select: IndexMap::new(),
            joins: IndexMap::new(),
            filters: Vec::new(),
            groups: Vec::new(),
            group_filters: Vec::new(),
            sorts: Vec::new(),
            offset: None,
            limit: None,
            distinct: false,
            withs: Vec::new(),
            chained: None,
            frozen: None,
        }
    }

    /// True when grouping must be inferred from the select list.
    pub fn has_aggregates(&self) -> bool {
        self.select.values().any(|r| r.aggregated) || !self.group_filters.is_empty()
    }
}

/// Anything a clause accepts: a ready expression or a dotted field
/// path resolved against the query's schema.
pub trait ToExpr {
    fn to_expr(self, query: &Query) -> Result<SqlExpr, QueryError>;
}

impl ToExpr for SqlExpr {
    fn to_expr(self, _query: &Query) -> Result<SqlExpr, QueryError> {
        Ok(self)
    }
}

impl ToExpr for &str {
    fn to_expr(self, query: &Query) -> Result<SqlExpr, QueryError> {
        query.resolve(self)
    }
}

impl ToExpr for String {
    fn to_expr(self, query: &Query) -> Result<SqlExpr, QueryError> {
        query.resolve(&self)
    }
}

pub struct Query {
    plan: Rc<RefCell<QueryPlan>>,
    ctx: ExprCtx,
    translator: &'static dyn Translator,
    registry: Arc<Registry>,
    views: Arc<Views>,
}

impl Query {
    /// An unbound query; the source comes from a WITH clause or raw
    /// expressions.
    pub fn new<T: Translator + 'static>(registry: Arc<Registry>, translator: &'static T) -> Query {
        let dialect: &'static dyn ExprDialect = translator;
        Query {
            plan: Rc::new(RefCell::new(QueryPlan::new(next_query_name()))),
            ctx: ExprCtx::new(dialect),
            translator,
            registry,
            views: Arc::new(Views::new()),
        }
    }

    /// Attach computed accessors; dotted paths may then name them.
    pub fn with_views(mut self, views: Arc<Views>) -> Result<Query, QueryError> {
        self.guard()?;
        self.views = views;
        Ok(self)
    }

    /// A query over one table. For an extendable table this installs
    /// the discriminator filter up front, so branch queries only see
    /// their own rows.
    pub fn bind<T: Translator + 'static>(
        registry: Arc<Registry>,
        translator: &'static T,
        table: &str,
    ) -> Result<Query, QueryError> {
        if !registry.is_resolved() {
            return Err(QueryError::WrongOperation(
                "registry is not resolved".into(),
            ));
        }
        let query = Query::new(registry, translator);
        let (cid, discriminator) = {
            let t = query.registry.expect(table)?;
            (t.cid.clone(), t.discriminator.clone())
        };
        query.plan.borrow_mut().table = Some(table.to_string());
        if let (Some(cid), Some(discriminator)) = (cid, discriminator) {
            let scheme = query.scheme()?;
            let filter = scheme.f(&cid)?.eq(discriminator.as_str());
            query.plan.borrow_mut().filters.push(filter.into());
        } else {
            // Register the source join eagerly so FROM is never empty.
            query.scheme()?.root()?.join_now()?;
        }
        Ok(query)
    }

    pub fn name(&self) -> String {
        self.plan.borrow().name.clone()
    }

    pub fn plan(&self) -> Ref<'_, QueryPlan> {
        self.plan.borrow()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn guard(&self) -> Result<(), QueryError> {
        let plan = self.plan.borrow();
        if plan.frozen.is_some() {
            return Err(QueryError::Frozen(plan.name.clone()));
        }
        Ok(())
    }

    /// The field resolver for this query.
    pub fn scheme(&self) -> Result<Scheme, QueryError> {
        Scheme::new(
            self.plan.clone(),
            self.ctx.clone(),
            self.translator,
            self.registry.clone(),
            self.views.clone(),
            self.plan.borrow().table.clone(),
        )
    }

    /// Resolve a dotted field path to a column expression.
    pub fn resolve(&self, path: &str) -> Result<SqlExpr, QueryError> {
        self.scheme()?.f(path)
    }

    pub fn raw(&self, text: impl Into<String>) -> SqlExpr {
        self.ctx.raw(text)
    }

    pub fn value(&self, value: impl Into<Value>) -> SqlExpr {
        self.ctx.value(value)
    }

    pub fn case(&self) -> CaseExpr {
        case(&self.ctx)
    }

    /// A named variable; bind it later with `set_var`.
    pub fn var(&self, name: &str) -> SqlExpr {
        self.ctx.var(name)
    }

    /// Variables may be rebound at any time, including on a frozen
    /// query: the SQL text never changes, only the bound value.
    pub fn set_var(&self, name: &str, value: impl Into<Value>) {
        self.ctx.args.borrow_mut().set_var(name, value.into());
    }

    // --- select -----------------------------------------------------

    /// Select fields by dotted path. The full path is the item's name,
    /// so `author.name` and `sellers.name` stay distinct columns.
    pub fn select<I, S>(self, paths: I) -> Result<Query, QueryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.guard()?;
        for path in paths {
            let path = path.as_ref();
            let expr = self.resolve(path)?;
            self.plan
                .borrow_mut()
                .select
                .insert(path.to_string(), expr.into());
        }
        Ok(self)
    }

    pub fn select_as(self, name: &str, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?;
        self.plan
            .borrow_mut()
            .select
            .insert(name.to_string(), expr.into());
        Ok(self)
    }

    pub fn select_with(
        self,
        name: &str,
        f: impl FnOnce(&Scheme) -> Result<SqlExpr, QueryError>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = f(&self.scheme()?)?;
        self.plan
            .borrow_mut()
            .select
            .insert(name.to_string(), expr.into());
        Ok(self)
    }

    /// Select every field of the bound table: plain columns and refs
    /// as-is, properties decoded from the body column, the body column
    /// itself skipped.
    pub fn select_all(self) -> Result<Query, QueryError> {
        self.guard()?;
        let table = {
            let plan = self.plan.borrow();
            plan.table.clone().ok_or_else(|| {
                QueryError::WrongOperation(format!("query `{}` is not bound to a table", plan.name))
            })?
        };
        let names: Vec<String> = {
            let t = self.registry.expect(&table)?;
            t.fields
                .values()
                .filter(|f| !f.body)
                .map(|f| f.name.clone())
                .collect()
        };
        let scheme = self.scheme()?;
        for name in names {
            let expr = scheme.f(&name)?;
            self.plan.borrow_mut().select.insert(name, expr.into());
        }
        Ok(self)
    }

    pub fn distinct(self) -> Result<Query, QueryError> {
        self.guard()?;
        self.plan.borrow_mut().distinct = true;
        Ok(self)
    }

    // --- filters ----------------------------------------------------

    fn push_filter(&self, expr: SqlExpr) {
        let mut plan = self.plan.borrow_mut();
        // Aggregated conditions belong to HAVING.
        if expr.aggregated {
            plan.group_filters.push(expr.into());
        } else {
            plan.filters.push(expr.into());
        }
    }

    pub fn filter(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?;
        self.push_filter(expr);
        Ok(self)
    }

    pub fn filter_with(
        self,
        f: impl FnOnce(&Scheme) -> Result<SqlExpr, QueryError>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = f(&self.scheme()?)?;
        self.push_filter(expr);
        Ok(self)
    }

    pub fn filter_eq(self, field: &str, value: impl Into<Value>) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = self.resolve(field)?.eq(value.into());
        self.push_filter(expr);
        Ok(self)
    }

    /// Negated filter.
    pub fn exclude(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?.not();
        self.push_filter(expr);
        Ok(self)
    }

    pub fn exclude_with(
        self,
        f: impl FnOnce(&Scheme) -> Result<SqlExpr, QueryError>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = f(&self.scheme()?)?.not();
        self.push_filter(expr);
        Ok(self)
    }

    // --- grouping & ordering ---------------------------------------

    pub fn group_by(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?;
        self.plan.borrow_mut().groups.push(expr.into());
        Ok(self)
    }

    /// A HAVING condition.
    pub fn group_filter(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?;
        self.plan.borrow_mut().group_filters.push(expr.into());
        Ok(self)
    }

    pub fn sort_by(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?;
        self.plan.borrow_mut().sorts.push(expr.into());
        Ok(self)
    }

    pub fn sort_by_desc(self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = item.to_expr(&self)?.desc();
        self.plan.borrow_mut().sorts.push(expr.into());
        Ok(self)
    }

    pub fn sort_with(
        self,
        f: impl FnOnce(&Scheme) -> Result<SqlExpr, QueryError>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let expr = f(&self.scheme()?)?;
        self.plan.borrow_mut().sorts.push(expr.into());
        Ok(self)
    }

    pub fn set_window(
        self,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let mut plan = self.plan.borrow_mut();
        plan.offset = offset;
        plan.limit = limit;
        drop(plan);
        Ok(self)
    }

    // --- aggregates -------------------------------------------------

    pub fn sum(&self, item: impl ToExpr) -> Result<SqlExpr, QueryError> {
        Ok(item.to_expr(self)?.sum())
    }

    pub fn avg(&self, item: impl ToExpr) -> Result<SqlExpr, QueryError> {
        Ok(item.to_expr(self)?.avg())
    }

    pub fn min(&self, item: impl ToExpr) -> Result<SqlExpr, QueryError> {
        Ok(item.to_expr(self)?.min())
    }

    pub fn max(&self, item: impl ToExpr) -> Result<SqlExpr, QueryError> {
        Ok(item.to_expr(self)?.max())
    }

    pub fn count(&self, item: impl ToExpr) -> Result<SqlExpr, QueryError> {
        Ok(item.to_expr(self)?.count())
    }

    pub fn count_all(&self) -> SqlExpr {
        let mut e = self.ctx.raw("count(*)");
        e.aggregated = true;
        e
    }

    // --- subqueries -------------------------------------------------

    /// Attach `sub` as a WITH clause. Its arguments are imported under
    /// its query name; the returned handle resolves its selected
    /// columns. When both queries bind the same table and the subquery
    /// selected the primary key, the clause is LEFT-joined on it;
    /// otherwise it becomes a FROM source.
    pub fn with_query(
        &self,
        sub: &Query,
        not_materialized: bool,
    ) -> Result<SubqueryRef, QueryError> {
        self.guard()?;
        if Rc::ptr_eq(&self.plan, &sub.plan) {
            return Err(QueryError::WrongOperation(
                "a query cannot be its own WITH clause".into(),
            ));
        }
        if self.ctx.dialect.name() != sub.ctx.dialect.name() {
            return Err(QueryError::WrongOperation(
                "WITH clause built for a different dialect".into(),
            ));
        }

        let sub_plan = sub.plan.borrow();
        let mut sql = match &sub_plan.frozen {
            Some(s) => s.clone(),
            None => self.translator.select(&sub_plan)?,
        };
        let renames = self
            .ctx
            .args
            .borrow_mut()
            .absorb(&sub.ctx.args.borrow(), &sub_plan.name);
        for (old, new) in renames {
            sql = sql.replace(
                &self.ctx.dialect.placeholder(&old),
                &self.ctx.dialect.placeholder(&new),
            );
        }

        let name = sub_plan.name.clone();
        let columns: Vec<String> = sub_plan.select.keys().cloned().collect();
        debug!(query = %self.plan.borrow().name, with = %name, "attach WITH clause");

        // Work out how the clause participates in FROM.
        let same_table = {
            let plan = self.plan.borrow();
            plan.table.is_some() && plan.table == sub_plan.table
        };
        drop(sub_plan);

        let join = if same_table {
            let table_name = self
                .plan
                .borrow()
                .table
                .clone()
                .ok_or_else(|| QueryError::WrongOperation("unbound query".into()))?;
            let pk = self.registry.expect(&table_name)?.pk.clone();
            if columns.iter().any(|c| c == &pk) {
                let root_pk = self.resolve(&pk)?;
                Some(Join {
                    kind: JoinKind::Left,
                    target: self.ctx.dialect.quote_ident(&name),
                    condition: Some(format!(
                        "{{alias}}.{} = {}",
                        self.ctx.dialect.quote_ident(&pk),
                        root_pk.text
                    )),
                })
            } else {
                None
            }
        } else {
            None
        };
        let join = join.unwrap_or(Join {
            kind: JoinKind::Source,
            target: self.ctx.dialect.quote_ident(&name),
            condition: None,
        });

        {
            let mut plan = self.plan.borrow_mut();
            plan.withs.push(WithClause {
                name: name.clone(),
                sql,
                not_materialized,
            });
            plan.joins.entry(name.clone()).or_insert(join);
        }

        Ok(SubqueryRef {
            name,
            columns,
            ctx: self.ctx.clone(),
        })
    }

    /// Turn the query into a recursive walk: start at the row whose
    /// `id_field` equals `seed`, then repeatedly follow `next_field`.
    /// The UNION dedup bounds the walk on cyclic data.
    pub fn chained(
        self,
        id_field: &str,
        next_field: &str,
        seed: impl Into<Value>,
    ) -> Result<Query, QueryError> {
        self.guard()?;
        let table = {
            let plan = self.plan.borrow();
            plan.table.clone().ok_or_else(|| {
                QueryError::WrongOperation(format!("query `{}` is not bound to a table", plan.name))
            })?
        };
        {
            let t = self.registry.expect(&table)?;
            for field in [id_field, next_field] {
                if !t.fields.contains_key(field) {
                    return Err(QueryError::FieldName(format!("{}.{field}", t.name)));
                }
            }
            if let Some(target) = t.fields[next_field].ref_target() {
                if target != table {
                    return Err(QueryError::FieldType(format!(
                        "`{next_field}` must point back to `{table}` to chain"
                    )));
                }
            }
        }

        let id_expr = self.resolve(id_field)?;
        let next_expr = self.resolve(next_field)?;
        // Both ends of the walk must be visible in the chain CTE.
        {
            let mut plan = self.plan.borrow_mut();
            if !plan.select.contains_key(id_field) {
                plan.select
                    .insert(id_field.to_string(), id_expr.clone().into());
            }
            if !plan.select.contains_key(next_field) {
                plan.select.insert(next_field.to_string(), next_expr.into());
            }
        }
        let seed = self.value(seed);
        self.plan.borrow_mut().chained = Some(Chained {
            id_name: id_field.to_string(),
            id_expr: id_expr.text,
            next_name: next_field.to_string(),
            seed: seed.text,
        });
        Ok(self)
    }

    // --- compilation ------------------------------------------------

    /// Compile once and pin the SQL text. Mutators fail from here on;
    /// only variables may still be rebound.
    pub fn freeze(&self) -> Result<(), QueryError> {
        if self.plan.borrow().frozen.is_some() {
            return Ok(());
        }
        let sql = {
            let plan = self.plan.borrow();
            self.translator.select(&plan)?
        };
        debug!(query = %self.plan.borrow().name, "freeze");
        self.plan.borrow_mut().frozen = Some(sql);
        Ok(())
    }

    pub fn compile(&self) -> Result<Statement, QueryError> {
        let sql = {
            let plan = self.plan.borrow();
            match &plan.frozen {
                Some(sql) => sql.clone(),
                None => self.translator.select(&plan)?,
            }
        };
        let args = self.ctx.args.borrow().resolved().map_err(|e| match e {
            ExprError::NotBound(name) => QueryError::NotBound(name),
            other => other.into(),
        })?;
        Ok(Statement { sql, args })
    }

    /// An independent copy: clause containers and arguments are deep
    /// copies, the name is regenerated, any frozen text is dropped.
    pub fn fork(&self) -> Query {
        let mut plan = self.plan.borrow().clone();
        plan.name = next_query_name();
        plan.frozen = None;
        let args = self.ctx.args.borrow().clone();
        Query {
            plan: Rc::new(RefCell::new(plan)),
            ctx: ExprCtx {
                dialect: self.ctx.dialect,
                args: Rc::new(RefCell::new(args)),
            },
            translator: self.translator,
            registry: self.registry.clone(),
            views: self.views.clone(),
        }
    }

    fn to_aggregate(
        &self,
        item: impl ToExpr,
        apply: impl FnOnce(SqlExpr) -> SqlExpr,
    ) -> Result<Query, QueryError> {
        let fork = self.fork();
        {
            let mut plan = fork.plan.borrow_mut();
            plan.select.clear();
            plan.sorts.clear();
            plan.offset = None;
            plan.limit = None;
            plan.distinct = false;
        }
        let expr = apply(item.to_expr(&fork)?);
        fork.select_as("result", expr)
    }

    /// Derive a single-row aggregate query with one `result` column.
    pub fn to_count(&self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.to_aggregate(item, |e| e.count())
    }

    pub fn to_sum(&self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.to_aggregate(item, |e| e.sum())
    }

    pub fn to_min(&self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.to_aggregate(item, |e| e.min())
    }

    pub fn to_max(&self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.to_aggregate(item, |e| e.max())
    }

    pub fn to_avg(&self, item: impl ToExpr) -> Result<Query, QueryError> {
        self.to_aggregate(item, |e| e.avg())
    }
}

/// Handle to an attached WITH clause; resolves the subquery's selected
/// columns by name.
pub struct SubqueryRef {
    name: String,
    columns: Vec<String>,
    ctx: ExprCtx,
}

impl SubqueryRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, column: &str) -> Result<SqlExpr, QueryError> {
        if !self.columns.iter().any(|c| c == column) {
            return Err(QueryError::FieldName(format!(
                "{}.{column}",
                self.name
            )));
        }
        Ok(self.ctx.raw(format!(
            "{}.{}",
            self.ctx.dialect.quote_ident(&self.name),
            self.ctx.dialect.quote_ident(column)
        )))
    }
}
