//! Concrete SQL dialects for relq.
//!
//! `POSTGRES` speaks to Postgres-protocol servers; `SQLITE` speaks to
//! embedded SQLite files. Both implement `Translator`, so any query
//! bound against one compiles without further configuration.

pub mod postgres;
pub mod sqlite;

pub use postgres::{Postgres, POSTGRES};
pub use sqlite::{Sqlite, SQLITE};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relq_model::{Field, FieldType, Registry, Table};
    use relq_query::Query;

    use crate::{POSTGRES, SQLITE};

    fn shop() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.declare(Table::new("Author").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.declare(
            Table::new("Book")
                .field(Field::new("title", FieldType::Text))
                .field(Field::new("price", FieldType::Float))
                .field(Field::reference("author", "Author"))
                .many_to_many("sellers", "Seller"),
        )
        .unwrap();
        reg.declare(Table::new("Seller").field(Field::new("name", FieldType::Text)))
            .unwrap();
        reg.resolve().unwrap();
        Arc::new(reg)
    }

    #[test]
    fn postgres_compiles_a_joined_select() {
        let q = Query::bind(shop(), &POSTGRES, "Book")
            .unwrap()
            .select(["title", "author.name"])
            .unwrap()
            .filter_with(|s| Ok(s.f("price")?.lt(50.0)))
            .unwrap();
        let stmt = q.compile().unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"books\".\"title\" AS \"title\", \
             \"books__author\".\"name\" AS \"author.name\"\n\
             FROM \"books\" AS \"books\"\n\
             INNER JOIN \"authors\" AS \"books__author\" \
             ON \"books\".\"author\" = \"books__author\".\"id\"\n\
             WHERE (\"books\".\"price\" < %(_arg_1)s)"
        );
    }

    #[test]
    fn sqlite_windows_come_out_limit_first() {
        let q = Query::bind(shop(), &SQLITE, "Book")
            .unwrap()
            .select(["title"])
            .unwrap()
            .set_window(Some(20), None)
            .unwrap();
        let stmt = q.compile().unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"books\".\"title\" AS \"title\"\n\
             FROM \"books\" AS \"books\"\n\
             LIMIT -1\nOFFSET 20"
        );
    }

    #[test]
    fn both_dialects_walk_the_junction() {
        for dialect_sql in [
            Query::bind(shop(), &POSTGRES, "Book"),
            Query::bind(shop(), &SQLITE, "Book"),
        ] {
            let q = dialect_sql
                .unwrap()
                .select(["title", "sellers.name"])
                .unwrap();
            let stmt = q.compile().unwrap();
            assert!(stmt
                .sql
                .contains("LEFT JOIN \"books_sellers\" AS \"books__books_sellers\""));
            assert!(stmt.sql.contains("LEFT JOIN \"sellers\" AS \"books__sellers\""));
        }
    }
}
