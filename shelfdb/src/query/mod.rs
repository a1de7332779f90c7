// Read side: filtering, ordering, paging and reference resolution

pub mod filter;
mod finder;
mod reference;

pub use filter::{compare_values, Condition, Filter, Op};
pub use finder::Finder;
pub use reference::{format_record, ReadOptions, Reference, RAW_KEY};

use crate::error::Result;
use crate::schema::{Record, PRIMARY_KEY};
use crate::storage;
use crate::table::Table;
use serde_json::Value;
use std::cmp::Ordering;

/// A query over one table.
///
/// Conditions are matched against stored values, so predicates on dates and
/// numbers are converted first. Results come back ordered by the `order`
/// field (ties and the default order go by `_id`) and paged with
/// `skip`/`limit`.
///
/// ```no_run
/// # fn demo(users: &shelfdb::Table) -> shelfdb::Result<()> {
/// use shelfdb::query::Op;
/// let rows = users
///     .query()
///     .where_op("age", Op::Gt, 20)
///     .order_desc("age")
///     .limit(10)
///     .select("name, age")
///     .exec()?;
/// # let _ = rows;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Query<'a> {
    table: &'a Table,
    filter: Filter,
    order: Option<(String, bool)>,
    skip: usize,
    limit: Option<usize>,
    options: ReadOptions<'a>,
}

impl<'a> Query<'a> {
    pub fn new(table: &'a Table) -> Self {
        Self {
            table,
            filter: Filter::new(),
            order: None,
            skip: 0,
            limit: None,
            options: ReadOptions::default(),
        }
    }

    /// Add every condition of `filter`.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = self.filter.merge(filter);
        self
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(field, value);
        self
    }

    pub fn where_op(mut self, field: &str, op: Op, value: impl Into<Value>) -> Self {
        self.filter = self.filter.op(field, op, value);
        self
    }

    pub fn order(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), false));
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.order = Some((field.to_string(), true));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn select(mut self, fields: &str) -> Self {
        self.options.set_select(fields);
        self
    }

    pub fn format(mut self) -> Self {
        self.options.format = true;
        self
    }

    /// Replace the foreign key in `field` with the record it points at in `table`.
    pub fn belongs_to(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::BelongsTo {
            table,
            field: field.to_string(),
        });
        self
    }

    /// Attach the records of `table` whose `field` refers to each result.
    pub fn has_many(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::HasMany {
            table,
            field: field.to_string(),
            count: false,
        });
        self
    }

    /// Like [`Query::has_many`] but attaches only the number of related
    /// records. A counter maintained by `field` is used when there is one.
    pub fn has_many_count(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::HasMany {
            table,
            field: field.to_string(),
            count: true,
        });
        self
    }

    pub fn exec(&self) -> Result<Vec<Record>> {
        let rows = self.load()?;
        self.page(rows)
            .iter()
            .map(|r| self.options.finish(self.table, r))
            .collect()
    }

    pub async fn exec_async(&self) -> Result<Vec<Record>> {
        let rows = self.load_async().await?;
        let mut out = Vec::new();
        for r in self.page(rows) {
            out.push(self.options.finish_async(self.table, &r).await?);
        }
        Ok(out)
    }

    /// Number of matching records, ignoring `skip` and `limit`.
    pub fn count(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub async fn count_async(&self) -> Result<usize> {
        Ok(self.load_async().await?.len())
    }

    /// Ids of the records `exec` would return, in the same order.
    pub(crate) fn matching_ids(&self) -> Result<Vec<String>> {
        Ok(ids(self.page(self.load()?)))
    }

    pub(crate) async fn matching_ids_async(&self) -> Result<Vec<String>> {
        Ok(ids(self.page(self.load_async().await?)))
    }

    /// Stored records matching the filter, unordered.
    fn load(&self) -> Result<Vec<Record>> {
        let schema = self.table.schema();
        let conn = self.table.connection();
        let name = self.table.name();
        let Some(filter) = self.filter.normalized(schema) else {
            return Ok(Vec::new());
        };

        let candidates = match filter.point_lookup(schema) {
            Some((PRIMARY_KEY, id)) => match storage::index_key(id) {
                Some(id) => conn.find(name, &id)?.into_iter().collect(),
                None => Vec::new(),
            },
            Some((field, value)) => conn.find_by(name, field, value)?.into_iter().collect(),
            None => conn.find_all(name)?,
        };
        Ok(candidates.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn load_async(&self) -> Result<Vec<Record>> {
        let schema = self.table.schema();
        let conn = self.table.connection();
        let name = self.table.name();
        let Some(filter) = self.filter.normalized(schema) else {
            return Ok(Vec::new());
        };

        let candidates = match filter.point_lookup(schema) {
            Some((PRIMARY_KEY, id)) => match storage::index_key(id) {
                Some(id) => conn.find_async(name, &id).await?.into_iter().collect(),
                None => Vec::new(),
            },
            Some((field, value)) => conn
                .find_by_async(name, field, value)
                .await?
                .into_iter()
                .collect(),
            None => conn.find_all_async(name).await?,
        };
        Ok(candidates.into_iter().filter(|r| filter.matches(r)).collect())
    }

    fn page(&self, mut rows: Vec<Record>) -> Vec<Record> {
        match &self.order {
            Some((field, desc)) => rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                let ord = if *desc { ord.reverse() } else { ord };
                ord.then_with(|| reference::by_id(a, b))
            }),
            None => rows.sort_by(reference::by_id),
        }
        let rows = rows.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}

fn ids(rows: Vec<Record>) -> Vec<String> {
    rows.iter()
        .filter_map(|r| r.get(PRIMARY_KEY).and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::{FieldDefinition, Schema, ValueDomain};
    use crate::storage::Connection;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn id_of(record: &Record) -> String {
        record[PRIMARY_KEY].as_str().unwrap().to_string()
    }

    struct Blog {
        _tmp: TempDir,
        users: Table,
        posts: Table,
        comments: Table,
    }

    fn blog() -> Blog {
        let tmp = TempDir::new().unwrap();
        let conn = Connection::new(tmp.path(), "json");
        let config = StoreConfig::default();
        let users = Table::open(
            conn.clone(),
            "user",
            Schema::new([
                ("name", FieldDefinition::string()),
                ("email", FieldDefinition::email().unique()),
                ("age", FieldDefinition::int().suffix(" yrs")),
                (
                    "role",
                    FieldDefinition::enumeration(ValueDomain::from_pairs([
                        ("a", "Admin"),
                        ("m", "Member"),
                    ])),
                ),
                ("born", FieldDefinition::date()),
                ("post_count", FieldDefinition::int().default_value(0)),
            ])
            .unwrap(),
            &config,
        )
        .unwrap();
        let posts = Table::open(
            conn.clone(),
            "post",
            Schema::new([
                ("title", FieldDefinition::string()),
                ("author", FieldDefinition::counter_reference("user", "post_count")),
            ])
            .unwrap(),
            &config,
        )
        .unwrap();
        let comments = Table::open(
            conn,
            "comment",
            Schema::new([
                ("body", FieldDefinition::string()),
                ("post", FieldDefinition::reference("post")),
            ])
            .unwrap(),
            &config,
        )
        .unwrap();
        Blog {
            _tmp: tmp,
            users,
            posts,
            comments,
        }
    }

    fn seed(blog: &Blog) -> (Record, Record, Record) {
        let ann = blog
            .users
            .insert(&record(json!({
                "name": "Ann", "email": "ann@x.com", "age": 31, "role": "a", "born": "1993-04-01"
            })))
            .unwrap();
        let bob = blog
            .users
            .insert(&record(json!({
                "name": "Bob", "email": "bob@x.com", "age": 25, "role": "m", "born": "1999-12-31"
            })))
            .unwrap();
        let post = blog
            .posts
            .insert(&record(json!({ "title": "hello", "author": ann[PRIMARY_KEY] })))
            .unwrap();
        blog.posts
            .insert(&record(json!({ "title": "again", "author": ann[PRIMARY_KEY] })))
            .unwrap();
        blog.comments
            .insert(&record(json!({ "body": "nice", "post": post[PRIMARY_KEY] })))
            .unwrap();
        (ann, bob, post)
    }

    #[test]
    fn test_filter_on_converted_values() {
        let blog = blog();
        seed(&blog);

        let rows = blog
            .users
            .query()
            .where_op("born", Op::Gte, "1995-01-01")
            .exec()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Bob"));
        assert_eq!(rows[0]["born"], json!("1999-12-31"));

        let rows = blog.users.query().where_eq("age", "31").exec().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Ann"));

        let rows = blog
            .users
            .query()
            .where_op("name", Op::Like, "%o%")
            .exec()
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_order_skip_limit() {
        let blog = blog();
        seed(&blog);

        let names = |rows: Vec<Record>| -> Vec<String> {
            rows.iter()
                .map(|r| r["name"].as_str().unwrap().to_string())
                .collect()
        };
        let q = blog.users.query();
        assert_eq!(names(q.clone().order("age").exec().unwrap()), vec!["Bob", "Ann"]);
        assert_eq!(names(q.clone().order_desc("age").exec().unwrap()), vec!["Ann", "Bob"]);
        assert_eq!(names(q.clone().order("age").skip(1).exec().unwrap()), vec!["Ann"]);
        assert_eq!(names(q.clone().order("age").limit(1).exec().unwrap()), vec!["Bob"]);
        assert!(q.clone().skip(5).exec().unwrap().is_empty());
        assert_eq!(q.count().unwrap(), 2);
        assert_eq!(q.clone().limit(1).count().unwrap(), 2);
    }

    #[test]
    fn test_point_lookups() {
        let blog = blog();
        let (ann, _, _) = seed(&blog);

        let rows = blog
            .users
            .query()
            .where_eq("email", "ann@x.com")
            .where_eq("age", 31)
            .exec()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(blog
            .users
            .query()
            .where_eq("email", "ann@x.com")
            .where_eq("age", 30)
            .exec()
            .unwrap()
            .is_empty());

        let rows = blog
            .users
            .query()
            .where_eq(PRIMARY_KEY, ann[PRIMARY_KEY].clone())
            .exec()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(blog
            .users
            .query()
            .where_eq(PRIMARY_KEY, "../post")
            .exec()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_format_keeps_raw() {
        let blog = blog();
        let (ann, _, _) = seed(&blog);

        let found = blog
            .users
            .find(&id_of(&ann))
            .format()
            .select("name, age, role")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(
            found,
            record(json!({
                "name": "Ann",
                "age": "31 yrs",
                "role": "Admin",
                "_raw": { "age": 31, "role": "a" },
            }))
        );
    }

    #[test]
    fn test_belongs_to() {
        let blog = blog();
        let (ann, _, post) = seed(&blog);

        let found = blog
            .posts
            .find(&id_of(&post))
            .belongs_to(&blog.users, "author")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(found["author"]["name"], json!("Ann"));
        assert_eq!(found["author"][PRIMARY_KEY], ann[PRIMARY_KEY]);

        // unresolved keys are left alone
        let orphan = blog
            .posts
            .insert(&record(json!({ "title": "lost", "author": "ghost" })))
            .unwrap();
        let found = blog
            .posts
            .find(&id_of(&orphan))
            .belongs_to(&blog.users, "author")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(found["author"], json!("ghost"));
    }

    #[test]
    fn test_has_many() {
        let blog = blog();
        let (ann, bob, post) = seed(&blog);

        let rows = blog
            .users
            .query()
            .order("name")
            .has_many(&blog.posts, "author")
            .select("name")
            .exec()
            .unwrap();
        assert_eq!(rows[0]["name"], json!("Ann"));
        let titles: Vec<&Value> = rows[0]["post"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| &p["title"])
            .collect();
        assert_eq!(titles.len(), 2);
        assert!(titles.contains(&&json!("hello")));
        assert_eq!(rows[1]["post"], json!([]));

        // counted through the maintained counter
        let counted = blog
            .users
            .find(&id_of(&ann))
            .has_many_count(&blog.posts, "author")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(counted["post"], json!(2));
        let counted = blog
            .users
            .find(&id_of(&bob))
            .has_many_count(&blog.posts, "author")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(counted["post"], json!(0));

        // counted by scanning
        let counted = blog
            .posts
            .find(&id_of(&post))
            .has_many_count(&blog.comments, "post")
            .exec()
            .unwrap()
            .unwrap();
        assert_eq!(counted["comment"], json!(1));
    }

    #[test]
    fn test_find_by_non_unique_field_takes_lowest_id() {
        let blog = blog();
        seed(&blog);
        let first = blog
            .posts
            .query()
            .where_eq("title", "hello")
            .exec()
            .unwrap()
            .remove(0);
        let found = blog.posts.find_by("title", "hello").exec().unwrap().unwrap();
        assert_eq!(found, first);
        assert!(blog.posts.find_by("title", "nope").exec().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_unique_entry_is_not_found() {
        let blog = blog();
        let (ann, _, _) = seed(&blog);
        let conn = blog.users.connection().clone();

        // the record moves on while the old entry stays behind
        let mut raw = conn.find("user", &id_of(&ann)).unwrap().unwrap();
        raw.insert("email".into(), json!("ann2@x.com"));
        conn.save("user", &id_of(&ann), &raw).unwrap();
        assert!(conn
            .unique_file("user", "email", &json!("ann@x.com"))
            .unwrap()
            .symlink_metadata()
            .is_ok());

        assert!(blog.users.find_by("email", "ann@x.com").exec().unwrap().is_none());
        assert!(blog
            .users
            .find_by("email", "ann@x.com")
            .exec_async()
            .await
            .unwrap()
            .is_none());
        assert!(blog
            .users
            .query()
            .where_eq("email", "ann@x.com")
            .exec()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unconvertible_filter_value_matches_nothing() {
        let blog = blog();
        seed(&blog);

        assert!(blog.users.query().where_eq("age", "old").exec().unwrap().is_empty());
        assert_eq!(blog.users.count(Filter::new().op("age", Op::Lt, "old")).unwrap(), 0);
        assert_eq!(
            blog.users
                .query()
                .where_op("age", Op::Ne, "old")
                .count()
                .unwrap(),
            2
        );
        assert!(blog.users.find_by("age", "old").exec().unwrap().is_none());
        assert_eq!(blog.users.remove_all(Filter::new().eq("age", "old")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_async_reads() {
        let blog = blog();
        let (ann, _, _) = seed(&blog);

        let rows = blog
            .posts
            .query()
            .belongs_to(&blog.users, "author")
            .exec_async()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["author"]["name"] == json!("Ann")));

        let found = blog
            .users
            .find_by("email", "ann@x.com")
            .has_many(&blog.posts, "author")
            .exec_async()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found[PRIMARY_KEY], ann[PRIMARY_KEY]);
        assert_eq!(found["post"].as_array().unwrap().len(), 2);
        assert_eq!(blog.users.query().count_async().await.unwrap(), 2);
    }
}
