//! Rendered SQL fragments and their composition.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use relq_model::{FieldType, Value};

use crate::args::ArgTable;
use crate::dialect::ExprDialect;

/// Shared rendering context: the dialect primitives and the argument
/// table of the owning query. Cloning is cheap and keeps both sides
/// pointed at the same argument table.
#[derive(Clone)]
pub struct ExprCtx {
    pub dialect: &'static dyn ExprDialect,
    pub args: Rc<RefCell<ArgTable>>,
}

impl ExprCtx {
    pub fn new(dialect: &'static dyn ExprDialect) -> ExprCtx {
        ExprCtx {
            dialect,
            args: Rc::new(RefCell::new(ArgTable::new())),
        }
    }

    /// A raw SQL fragment. The text is emitted verbatim.
    pub fn raw(&self, text: impl Into<String>) -> SqlExpr {
        SqlExpr {
            text: text.into(),
            aggregated: false,
            ctx: self.clone(),
        }
    }

    /// Intern a literal and reference it through a placeholder.
    pub fn value(&self, value: impl Into<Value>) -> SqlExpr {
        let value = value.into();
        if value.is_null() {
            return self.raw("NULL");
        }
        let name = self.args.borrow_mut().bind(value);
        self.raw(self.dialect.placeholder(&name))
    }

    /// A named variable, bound later with `set_var`.
    pub fn var(&self, name: &str) -> SqlExpr {
        self.args.borrow_mut().declare_var(name);
        self.raw(self.dialect.placeholder(name))
    }
}

impl fmt::Debug for ExprCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprCtx")
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

/// A rendered SQL expression. `aggregated` marks fragments containing
/// an aggregate function call; the query compiler uses it to infer
/// GROUP BY lists.
#[derive(Debug, Clone)]
pub struct SqlExpr {
    pub text: String,
    pub aggregated: bool,
    pub(crate) ctx: ExprCtx,
}

/// Anything usable as the right-hand side of an expression operation:
/// another expression, or a literal that gets interned on use.
pub enum Operand {
    Expr(SqlExpr),
    Value(Value),
}

impl From<SqlExpr> for Operand {
    fn from(e: SqlExpr) -> Operand {
        Operand::Expr(e)
    }
}

macro_rules! operand_from_value {
    ($($ty:ty),* $(,)?) => {$(
        impl From<$ty> for Operand {
            fn from(v: $ty) -> Operand {
                Operand::Value(v.into())
            }
        }
    )*};
}

operand_from_value!(
    Value,
    bool,
    i32,
    i64,
    f64,
    &str,
    String,
    NaiveDateTime,
    NaiveDate,
    NaiveTime,
    Duration,
    uuid::Uuid,
    serde_json::Value,
);

impl<T> From<Option<T>> for Operand
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Operand {
        Operand::Value(v.into())
    }
}

impl SqlExpr {
    fn make(&self, text: String, aggregated: bool) -> SqlExpr {
        SqlExpr {
            text,
            aggregated,
            ctx: self.ctx.clone(),
        }
    }

    /// Render `op` against this expression's context.
    fn rhs(&self, op: impl Into<Operand>) -> SqlExpr {
        match op.into() {
            Operand::Expr(e) => e,
            Operand::Value(v) => self.ctx.value(v),
        }
    }

    fn binary(&self, op: &str, rhs: impl Into<Operand>) -> SqlExpr {
        let rhs = self.rhs(rhs);
        self.make(
            format!("({} {op} {})", self.text, rhs.text),
            self.aggregated || rhs.aggregated,
        )
    }

    pub fn eq(&self, rhs: impl Into<Operand>) -> SqlExpr {
        match rhs.into() {
            Operand::Value(Value::Null) => self.is_null(),
            other => self.binary("=", other),
        }
    }

    pub fn ne(&self, rhs: impl Into<Operand>) -> SqlExpr {
        match rhs.into() {
            Operand::Value(Value::Null) => self.is_not_null(),
            other => self.binary("<>", other),
        }
    }

    pub fn gt(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary(">", rhs)
    }

    pub fn ge(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary(">=", rhs)
    }

    pub fn lt(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("<", rhs)
    }

    pub fn le(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("<=", rhs)
    }

    pub fn like(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("LIKE", rhs)
    }

    pub fn and(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("AND", rhs)
    }

    pub fn or(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("OR", rhs)
    }

    pub fn not(&self) -> SqlExpr {
        self.make(format!("NOT ({})", self.text), self.aggregated)
    }

    pub fn is_null(&self) -> SqlExpr {
        self.make(format!("({} IS NULL)", self.text), self.aggregated)
    }

    pub fn is_not_null(&self) -> SqlExpr {
        self.make(format!("({} IS NOT NULL)", self.text), self.aggregated)
    }

    pub fn is_in<I, T>(&self, items: I) -> SqlExpr
    where
        I: IntoIterator<Item = T>,
        T: Into<Operand>,
    {
        let mut aggregated = self.aggregated;
        let rendered: Vec<String> = items
            .into_iter()
            .map(|item| {
                let e = self.rhs(item);
                aggregated |= e.aggregated;
                e.text
            })
            .collect();
        self.make(
            format!("{} IN ({})", self.text, rendered.join(", ")),
            aggregated,
        )
    }

    pub fn add(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("+", rhs)
    }

    pub fn sub(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("-", rhs)
    }

    pub fn mul(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("*", rhs)
    }

    pub fn div(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("/", rhs)
    }

    pub fn rem(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("%", rhs)
    }

    pub fn neg(&self) -> SqlExpr {
        self.make(format!("(-{})", self.text), self.aggregated)
    }

    pub fn concat(&self, rhs: impl Into<Operand>) -> SqlExpr {
        self.binary("||", rhs)
    }

    pub fn contains(&self, rhs: impl Into<Operand>) -> SqlExpr {
        let rhs = self.rhs(rhs);
        self.make(
            format!("({} LIKE ('%' || {} || '%'))", self.text, rhs.text),
            self.aggregated || rhs.aggregated,
        )
    }

    pub fn starts_with(&self, rhs: impl Into<Operand>) -> SqlExpr {
        let rhs = self.rhs(rhs);
        self.make(
            format!("({} LIKE ({} || '%'))", self.text, rhs.text),
            self.aggregated || rhs.aggregated,
        )
    }

    pub fn ends_with(&self, rhs: impl Into<Operand>) -> SqlExpr {
        let rhs = self.rhs(rhs);
        self.make(
            format!("({} LIKE ('%' || {}))", self.text, rhs.text),
            self.aggregated || rhs.aggregated,
        )
    }

    pub fn substr(&self, start: impl Into<Operand>, length: impl Into<Operand>) -> SqlExpr {
        let start = self.rhs(start);
        let length = self.rhs(length);
        self.make(
            format!("substr({}, {}, {})", self.text, start.text, length.text),
            self.aggregated || start.aggregated || length.aggregated,
        )
    }

    pub fn length(&self) -> SqlExpr {
        self.make(format!("length({})", self.text), self.aggregated)
    }

    pub fn cast(&self, ty: FieldType) -> SqlExpr {
        self.make(self.ctx.dialect.type_cast(&self.text, ty), self.aggregated)
    }

    pub fn as_text(&self) -> SqlExpr {
        self.cast(FieldType::Text)
    }

    pub fn as_integer(&self) -> SqlExpr {
        self.cast(FieldType::BigInt)
    }

    pub fn as_float(&self) -> SqlExpr {
        self.cast(FieldType::Float)
    }

    fn aggregate(&self, func: &str) -> SqlExpr {
        self.make(format!("{func}({})", self.text), true)
    }

    pub fn sum(&self) -> SqlExpr {
        self.aggregate("sum")
    }

    pub fn avg(&self) -> SqlExpr {
        self.aggregate("avg")
    }

    pub fn min(&self) -> SqlExpr {
        self.aggregate("min")
    }

    pub fn max(&self) -> SqlExpr {
        self.aggregate("max")
    }

    pub fn count(&self) -> SqlExpr {
        self.aggregate("count")
    }

    pub fn count_distinct(&self) -> SqlExpr {
        self.make(format!("count(DISTINCT {})", self.text), true)
    }

    /// Attach an OVER clause. The result is a window expression, not a
    /// grouping aggregate, so the aggregated flag is cleared.
    pub fn over(&self, partition_by: &[SqlExpr], order_by: &[SqlExpr]) -> SqlExpr {
        let mut clause = String::new();
        if !partition_by.is_empty() {
            let cols: Vec<&str> = partition_by.iter().map(|e| e.text.as_str()).collect();
            clause.push_str(&format!("PARTITION BY {}", cols.join(", ")));
        }
        if !order_by.is_empty() {
            if !clause.is_empty() {
                clause.push(' ');
            }
            let cols: Vec<&str> = order_by.iter().map(|e| e.text.as_str()).collect();
            clause.push_str(&format!("ORDER BY {}", cols.join(", ")));
        }
        self.make(format!("{} OVER ({clause})", self.text), false)
    }

    pub fn desc(&self) -> SqlExpr {
        self.make(format!("{} DESC", self.text), self.aggregated)
    }

    pub fn coalesce(&self, rhs: impl Into<Operand>) -> SqlExpr {
        let rhs = self.rhs(rhs);
        self.make(
            format!("coalesce({}, {})", self.text, rhs.text),
            self.aggregated || rhs.aggregated,
        )
    }

    pub fn upper(&self) -> SqlExpr {
        self.make(format!("upper({})", self.text), self.aggregated)
    }

    pub fn lower(&self) -> SqlExpr {
        self.make(format!("lower({})", self.text), self.aggregated)
    }

    /// Prepend a raw operator or keyword, verbatim.
    pub fn prefix(&self, op: &str) -> SqlExpr {
        self.make(format!("{op} {}", self.text), self.aggregated)
    }

    /// Append a raw operator or keyword, verbatim.
    pub fn postfix(&self, op: &str) -> SqlExpr {
        self.make(format!("{} {op}", self.text), self.aggregated)
    }

    pub fn ctx(&self) -> &ExprCtx {
        &self.ctx
    }
}

/// Start a CASE expression. Arms are added with `when`; the builder
/// only yields a `SqlExpr` through `otherwise`, so a missing default
/// cannot compile.
pub fn case(ctx: &ExprCtx) -> CaseExpr {
    CaseExpr {
        ctx: ctx.clone(),
        arms: Vec::new(),
        aggregated: false,
    }
}

pub struct CaseExpr {
    ctx: ExprCtx,
    arms: Vec<(String, String)>,
    aggregated: bool,
}

impl CaseExpr {
    pub fn when(mut self, cond: SqlExpr, then: impl Into<Operand>) -> CaseExpr {
        let then = match then.into() {
            Operand::Expr(e) => e,
            Operand::Value(v) => self.ctx.value(v),
        };
        self.aggregated |= cond.aggregated || then.aggregated;
        self.arms.push((cond.text, then.text));
        self
    }

    pub fn otherwise(self, val: impl Into<Operand>) -> SqlExpr {
        let val = match val.into() {
            Operand::Expr(e) => e,
            Operand::Value(v) => self.ctx.value(v),
        };
        let aggregated = self.aggregated || val.aggregated;
        let mut text = String::from("CASE");
        for (cond, then) in &self.arms {
            text.push_str(&format!(" WHEN {cond} THEN {then}"));
        }
        text.push_str(&format!(" ELSE {} END", val.text));
        SqlExpr {
            text,
            aggregated,
            ctx: self.ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::testing::PLAIN;

    fn ctx() -> ExprCtx {
        ExprCtx::new(&PLAIN)
    }

    #[test]
    fn literals_are_interned_once() {
        let ctx = ctx();
        let a = ctx.raw("\"t1\".\"price\"");
        let e = a.gt(100).and(a.lt(100).or(a.eq(100)));
        assert_eq!(
            e.text,
            "((\"t1\".\"price\" > %(_arg_1)s) AND \
             ((\"t1\".\"price\" < %(_arg_1)s) OR (\"t1\".\"price\" = %(_arg_1)s)))"
        );
        assert_eq!(ctx.args.borrow().args().count(), 1);
    }

    #[test]
    fn eq_null_becomes_is_null() {
        let ctx = ctx();
        let a = ctx.raw("x");
        assert_eq!(a.eq(Value::Null).text, "(x IS NULL)");
        assert_eq!(a.ne(None::<i64>).text, "(x IS NOT NULL)");
        assert!(ctx.args.borrow().is_empty());
    }

    #[test]
    fn aggregated_flag_propagates() {
        let ctx = ctx();
        let price = ctx.raw("price");
        let qty = ctx.raw("qty");
        let total = price.mul(qty.clone()).sum();
        assert!(total.aggregated);
        assert_eq!(total.text, "sum((price * qty))");
        assert!(total.gt(10).aggregated);
        assert!(!qty.aggregated);
    }

    #[test]
    fn window_clears_aggregated() {
        let ctx = ctx();
        let e = ctx.raw("price").sum().over(&[ctx.raw("kind")], &[ctx.raw("id")]);
        assert!(!e.aggregated);
        assert_eq!(e.text, "sum(price) OVER (PARTITION BY kind ORDER BY id)");
    }

    #[test]
    fn vars_use_their_own_name() {
        let ctx = ctx();
        let e = ctx.raw("id").eq(ctx.var("uid"));
        assert_eq!(e.text, "(id = %(uid)s)");
        assert!(ctx.args.borrow().has_var("uid"));
    }

    #[test]
    fn case_expression() {
        let ctx = ctx();
        let kind = ctx.raw("kind");
        let e = case(&ctx)
            .when(kind.eq("new"), 1)
            .when(kind.eq("used"), 2)
            .otherwise(0);
        assert_eq!(
            e.text,
            "CASE WHEN (kind = %(_arg_1)s) THEN %(_arg_2)s \
             WHEN (kind = %(_arg_3)s) THEN %(_arg_4)s ELSE %(_arg_5)s END"
        );
    }

    #[test]
    fn in_list_renders_placeholders() {
        let ctx = ctx();
        let e = ctx.raw("id").is_in([1, 2, 3]);
        assert_eq!(e.text, "id IN (%(_arg_1)s, %(_arg_2)s, %(_arg_3)s)");
    }
}
