//! Execution interfaces: how compiled statements reach a database.
//!
//! The crate never talks to a driver itself. Callers implement
//! [`Connection`] or [`AsyncConnection`] over whatever client they
//! use and feed it [`Statement`] values; everything here stays pure
//! planning plus transaction bookkeeping.

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use relq_model::{Table, Value};
use relq_query::{Statement, TranslateError, Translator};

/// Above this many new links a COPY-capable dialect streams them
/// instead of batching placeholders.
const COPY_THRESHOLD: usize = 100;

pub trait Connection {
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&mut self, stmt: &Statement) -> Result<u64, Self::Error>;
    fn begin(&mut self) -> Result<(), Self::Error>;
    fn commit(&mut self) -> Result<(), Self::Error>;
    fn rollback(&mut self) -> Result<(), Self::Error>;
}

#[async_trait]
pub trait AsyncConnection {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn execute(&mut self, stmt: &Statement) -> Result<u64, Self::Error>;
    async fn begin(&mut self) -> Result<(), Self::Error>;
    async fn commit(&mut self) -> Result<(), Self::Error>;
    async fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// An open transaction. Rolls back on drop unless committed.
pub struct Transaction<'a, C: Connection> {
    conn: &'a mut C,
    done: bool,
}

impl<'a, C: Connection> Transaction<'a, C> {
    pub fn new(conn: &'a mut C) -> Result<Transaction<'a, C>, C::Error> {
        conn.begin()?;
        Ok(Transaction { conn, done: false })
    }

    pub fn execute(&mut self, stmt: &Statement) -> Result<u64, C::Error> {
        self.conn.execute(stmt)
    }

    pub fn commit(mut self) -> Result<(), C::Error> {
        self.done = true;
        self.conn.commit()
    }
}

impl<C: Connection> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        if !self.done {
            debug!("rolling back abandoned transaction");
            let _ = self.conn.rollback();
        }
    }
}

/// Run a closure inside a transaction, committing on success.
pub fn run_in_transaction<C, T>(
    conn: &mut C,
    f: impl FnOnce(&mut Transaction<C>) -> Result<T, C::Error>,
) -> Result<T, C::Error>
where
    C: Connection,
{
    let mut tx = Transaction::new(conn)?;
    let out = f(&mut tx)?;
    tx.commit()?;
    Ok(out)
}

/// Execute statements inside one transaction, rolling back on the
/// first failure. Returns the summed affected-row count.
pub async fn execute_batch<C: AsyncConnection>(
    conn: &mut C,
    stmts: &[Statement],
) -> Result<u64, C::Error> {
    conn.begin().await?;
    let mut total = 0;
    for stmt in stmts {
        match conn.execute(stmt).await {
            Ok(n) => total += n,
            Err(e) => {
                let _ = conn.rollback().await;
                return Err(e);
            }
        }
    }
    conn.commit().await?;
    Ok(total)
}

/// How new junction links get written.
#[derive(Debug, Clone)]
pub enum LinkWrite {
    /// Stream rows through a COPY statement.
    Copy {
        sql: String,
        rows: Vec<(Value, Value)>,
    },
    /// Batched INSERT with bound arguments.
    Batch(Statement),
}

/// The write plan that reconciles one owner's links.
#[derive(Debug, Clone)]
pub struct JunctionSync {
    pub delete: Option<Statement>,
    pub insert: Option<LinkWrite>,
}

impl JunctionSync {
    pub fn is_empty(&self) -> bool {
        self.delete.is_none() && self.insert.is_none()
    }
}

/// Plan the statements that bring one owner's junction rows from
/// `current` to `desired`. Links present on both sides are untouched.
pub fn junction_sync<T>(
    translator: &T,
    junction: &Table,
    owner_col: &str,
    other_col: &str,
    owner: &Value,
    current: &[Value],
    desired: &[Value],
) -> Result<JunctionSync, TranslateError>
where
    T: Translator + ?Sized,
{
    let removed: Vec<&Value> = current.iter().filter(|v| !desired.contains(v)).collect();
    let added: Vec<&Value> = desired.iter().filter(|v| !current.contains(v)).collect();

    let delete = if desired.is_empty() && !current.is_empty() {
        // Clearing everything needs no id list.
        let sql = translator.delete_links(junction, owner_col, other_col, 0);
        let mut args = IndexMap::new();
        args.insert("owner".to_string(), owner.clone());
        Some(Statement { sql, args })
    } else if !removed.is_empty() {
        let sql = translator.delete_links(junction, owner_col, other_col, removed.len());
        let mut args = IndexMap::new();
        args.insert("owner".to_string(), owner.clone());
        for (i, id) in removed.iter().enumerate() {
            args.insert(format!("_id_{i}"), (*id).clone());
        }
        Some(Statement { sql, args })
    } else {
        None
    };

    let insert = if added.is_empty() {
        None
    } else if translator.capabilities().supports_copy && added.len() >= COPY_THRESHOLD {
        let sql = translator.copy_links(junction, owner_col, other_col)?;
        let rows = added
            .iter()
            .map(|id| (owner.clone(), (*id).clone()))
            .collect();
        Some(LinkWrite::Copy { sql, rows })
    } else {
        let sql = translator.insert_links(junction, owner_col, other_col, added.len());
        let mut args = IndexMap::new();
        args.insert("owner".to_string(), owner.clone());
        for (i, id) in added.iter().enumerate() {
            args.insert(format!("_id_{i}"), (*id).clone());
        }
        Some(LinkWrite::Batch(Statement { sql, args }))
    };

    debug!(
        junction = %junction.name,
        removed = removed.len(),
        added = added.len(),
        "planned junction sync"
    );
    Ok(JunctionSync { delete, insert })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relq_model::{Field, FieldType, Registry, Table};
    use relq_sql::{POSTGRES, SQLITE};

    use super::*;

    fn shop() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.declare(
            Table::new("Book")
                .field(Field::new("title", FieldType::Text))
                .many_to_many("sellers", "Seller"),
        )
        .unwrap();
        reg.declare(Table::new("Seller").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.resolve().unwrap();
        Arc::new(reg)
    }

    #[derive(Default)]
    struct MockConn {
        executed: Vec<String>,
        committed: bool,
        rolled_back: bool,
        fail_on: Option<usize>,
    }

    impl MockConn {
        fn run(&mut self, sql: &str) -> Result<u64, std::io::Error> {
            if self.fail_on == Some(self.executed.len()) {
                return Err(std::io::Error::other("boom"));
            }
            self.executed.push(sql.to_string());
            Ok(1)
        }
    }

    impl Connection for MockConn {
        type Error = std::io::Error;

        fn execute(&mut self, stmt: &Statement) -> Result<u64, Self::Error> {
            self.run(&stmt.sql)
        }

        fn begin(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn commit(&mut self) -> Result<(), Self::Error> {
            self.committed = true;
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), Self::Error> {
            self.rolled_back = true;
            Ok(())
        }
    }

    #[async_trait]
    impl AsyncConnection for MockConn {
        type Error = std::io::Error;

        async fn execute(&mut self, stmt: &Statement) -> Result<u64, Self::Error> {
            self.run(&stmt.sql)
        }

        async fn begin(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), Self::Error> {
            self.committed = true;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), Self::Error> {
            self.rolled_back = true;
            Ok(())
        }
    }

    fn stmt(sql: &str) -> Statement {
        Statement {
            sql: sql.to_string(),
            args: IndexMap::new(),
        }
    }

    #[test]
    fn transaction_commits_on_success() {
        let mut conn = MockConn::default();
        run_in_transaction(&mut conn, |tx| tx.execute(&stmt("DELETE FROM x"))).unwrap();
        assert!(conn.committed);
        assert!(!conn.rolled_back);
    }

    #[test]
    fn transaction_rolls_back_on_drop() {
        let mut conn = MockConn::default();
        let tx = Transaction::new(&mut conn).unwrap();
        drop(tx);
        assert!(conn.rolled_back);
        assert!(!conn.committed);
    }

    #[tokio::test]
    async fn batch_rolls_back_on_the_first_failure() {
        let mut conn = MockConn {
            fail_on: Some(1),
            ..MockConn::default()
        };
        let stmts = [stmt("INSERT 1"), stmt("INSERT 2"), stmt("INSERT 3")];
        assert!(execute_batch(&mut conn, &stmts).await.is_err());
        assert_eq!(conn.executed, ["INSERT 1"]);
        assert!(conn.rolled_back);
    }

    #[test]
    fn sync_deletes_and_inserts_the_difference() {
        let reg = shop();
        let junction = reg.get("BookSellers").unwrap();
        let plan = junction_sync(
            &POSTGRES,
            junction,
            "books",
            "sellers",
            &Value::from(1),
            &[Value::from(10), Value::from(11)],
            &[Value::from(11), Value::from(12)],
        )
        .unwrap();
        let delete = plan.delete.unwrap();
        assert_eq!(
            delete.sql,
            "DELETE FROM \"books_sellers\" WHERE \"books\" = %(owner)s \
             AND \"sellers\" IN (%(_id_0)s)"
        );
        assert_eq!(delete.args["_id_0"], Value::from(10));
        match plan.insert.unwrap() {
            LinkWrite::Batch(insert) => {
                assert_eq!(
                    insert.sql,
                    "INSERT INTO \"books_sellers\" (\"books\", \"sellers\")\n\
                     VALUES (%(owner)s, %(_id_0)s)"
                );
                assert_eq!(insert.args["_id_0"], Value::from(12));
            }
            other => panic!("expected a batch insert, got {other:?}"),
        }
    }

    #[test]
    fn sync_clears_with_one_statement() {
        let reg = shop();
        let junction = reg.get("BookSellers").unwrap();
        let plan = junction_sync(
            &SQLITE,
            junction,
            "books",
            "sellers",
            &Value::from(1),
            &[Value::from(10), Value::from(11)],
            &[],
        )
        .unwrap();
        let delete = plan.delete.unwrap();
        assert_eq!(
            delete.sql,
            "DELETE FROM \"books_sellers\" WHERE \"books\" = :owner"
        );
        assert_eq!(delete.args.len(), 1);
        assert!(plan.insert.is_none());
    }

    #[test]
    fn sync_streams_large_additions_over_copy() {
        let reg = shop();
        let junction = reg.get("BookSellers").unwrap();
        let desired: Vec<Value> = (0..200).map(Value::from).collect();
        let plan = junction_sync(
            &POSTGRES,
            junction,
            "books",
            "sellers",
            &Value::from(1),
            &[],
            &desired,
        )
        .unwrap();
        match plan.insert.unwrap() {
            LinkWrite::Copy { sql, rows } => {
                assert_eq!(
                    sql,
                    "COPY \"books_sellers\" (\"books\", \"sellers\") FROM STDIN"
                );
                assert_eq!(rows.len(), 200);
            }
            other => panic!("expected COPY, got {other:?}"),
        }
    }

    #[test]
    fn sync_without_changes_is_empty() {
        let reg = shop();
        let junction = reg.get("BookSellers").unwrap();
        let current = [Value::from(10)];
        let plan = junction_sync(
            &SQLITE,
            junction,
            "books",
            "sellers",
            &Value::from(1),
            &current,
            &current,
        )
        .unwrap();
        assert!(plan.is_empty());
    }
}
