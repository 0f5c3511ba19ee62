//! Query argument interning.

use indexmap::IndexMap;
use relq_model::Value;

use crate::ExprError;

/// Arguments collected while a query is being built. Literal values
/// are interned by structural equality, so binding the same value
/// twice reuses one parameter. Named variables are declared up front
/// and may be (re)bound any time before execution, including on a
/// frozen query.
#[derive(Debug, Default, Clone)]
pub struct ArgTable {
    args: IndexMap<String, Value>,
    vars: IndexMap<String, Option<Value>>,
    counter: usize,
}

impl ArgTable {
    pub fn new() -> ArgTable {
        ArgTable::default()
    }

    /// Intern `value` and return its parameter name.
    pub fn bind(&mut self, value: Value) -> String {
        if let Some((name, _)) = self.args.iter().find(|(_, v)| **v == value) {
            return name.clone();
        }
        self.counter += 1;
        let name = format!("_arg_{}", self.counter);
        self.args.insert(name.clone(), value);
        name
    }

    /// Declare a named variable without a value yet.
    pub fn declare_var(&mut self, name: &str) {
        self.vars.entry(name.to_string()).or_insert(None);
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), Some(value));
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.vars.is_empty()
    }

    /// Interned arguments, in binding order.
    pub fn args(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The full parameter map for execution. Fails on any variable
    /// that was declared but never bound.
    pub fn resolved(&self) -> Result<IndexMap<String, Value>, ExprError> {
        let mut out = self.args.clone();
        for (name, value) in &self.vars {
            match value {
                Some(v) => {
                    out.insert(name.clone(), v.clone());
                }
                None => return Err(ExprError::NotBound(name.clone())),
            }
        }
        Ok(out)
    }

    /// Absorb a subquery's arguments under `prefix`, returning the
    /// renames to apply to its SQL text. Variables keep their names
    /// and share one namespace with ours.
    pub fn absorb(&mut self, other: &ArgTable, prefix: &str) -> Vec<(String, String)> {
        let mut renames = Vec::with_capacity(other.args.len());
        for (name, value) in &other.args {
            let new_name = format!("{prefix}{name}");
            self.args.insert(new_name.clone(), value.clone());
            renames.push((name.clone(), new_name));
        }
        for (name, value) in &other.vars {
            match self.vars.get_mut(name) {
                Some(slot) => {
                    if slot.is_none() {
                        slot.clone_from(value);
                    }
                }
                None => {
                    self.vars.insert(name.clone(), value.clone());
                }
            }
        }
        // Longest first, so `_arg_1` cannot clobber `_arg_10`.
        renames.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        renames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_interns_by_value() {
        let mut t = ArgTable::new();
        let a = t.bind(Value::from(5));
        let b = t.bind(Value::from("x"));
        let c = t.bind(Value::from(5));
        assert_eq!(a, "_arg_1");
        assert_eq!(b, "_arg_2");
        assert_eq!(c, a);
        assert_eq!(t.args().count(), 2);
    }

    #[test]
    fn unbound_var_is_an_error() {
        let mut t = ArgTable::new();
        t.declare_var("uid");
        assert!(matches!(t.resolved(), Err(ExprError::NotBound(_))));
        t.set_var("uid", Value::from(7));
        let all = t.resolved().unwrap();
        assert_eq!(all["uid"], Value::from(7));
    }

    #[test]
    fn absorb_prefixes_and_orders_renames() {
        let mut inner = ArgTable::new();
        for i in 0..10 {
            inner.bind(Value::from(i));
        }
        let mut outer = ArgTable::new();
        outer.bind(Value::from("keep"));
        let renames = outer.absorb(&inner, "q2");
        assert_eq!(renames[0].0, "_arg_10");
        assert_eq!(renames[0].1, "q2_arg_10");
        let all = outer.resolved().unwrap();
        assert_eq!(all["q2_arg_3"], Value::from(2));
        assert_eq!(all["_arg_1"], Value::from("keep"));
    }
}
