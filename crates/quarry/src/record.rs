//! Record instances: field values of one row of a record type.
//!
//! A [`Record`] tracks which fields were assigned since it was loaded or saved,
//! so [`Record::save`] only writes what changed. Columns of a result row that are
//! not declared fields (aggregates, aliases) are kept as extras.

use crate::client::GenericClient;
use crate::error::{BuildError, OrmError, OrmResult};
use crate::qb::delete::DeleteQuery;
use crate::qb::insert::{Fields, InsertQuery};
use crate::qb::select::SelectQuery;
use crate::qb::traits::Mutation;
use crate::qb::update::UpdateQuery;
use crate::row::RawRow;
use crate::schema::{RecordType, Schema};
use crate::transaction::rollback_with;
use crate::value::{FromValue, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, PartialEq)]
pub struct Record {
    record: &'static RecordType,
    /// One slot per declared field; `None` when never assigned or loaded.
    values: Vec<Option<Value>>,
    dirty: Vec<bool>,
    /// Primary key as stored in the database; `None` until persisted.
    pk: Option<Value>,
    extras: BTreeMap<String, Value>,
    deleted: bool,
}

impl Record {
    /// An empty, unsaved instance.
    pub fn new(record: &'static RecordType) -> Self {
        let n = record.fields().len();
        Self {
            record,
            values: vec![None; n],
            dirty: vec![false; n],
            pk: None,
            extras: BTreeMap::new(),
            deleted: false,
        }
    }

    /// An unsaved instance with every given field assigned.
    pub fn from_fields(record: &'static RecordType, fields: Fields) -> Result<Self, BuildError> {
        let mut out = Self::new(record);
        for (name, value) in fields {
            out.set(&name, value)?;
        }
        Ok(out)
    }

    /// Rebuild a just-inserted row from its input mapping.
    pub(crate) fn from_inserted(record: &'static RecordType, fields: &Fields) -> Result<Self, BuildError> {
        let mut out = Self::from_fields(record, fields.clone())?;
        out.pk = out.value(record.primary_key_name()).cloned();
        out.mark_clean();
        if out.pk.is_none() {
            tracing::warn!(
                target: "quarry.sql",
                table = record.table(),
                "inserted row has no known primary key; the record stays unsaved"
            );
        }
        Ok(out)
    }

    /// Map a result row. Declared fields are matched by column name; every other
    /// column becomes an extra.
    pub fn from_row(record: &'static RecordType, row: &RawRow) -> Self {
        let mut out = Self::new(record);
        for (column, value) in row.iter() {
            match record.field_index(column) {
                Some(i) if out.values[i].is_none() => out.values[i] = Some(value.clone()),
                _ => {
                    out.extras.insert(column.to_string(), value.clone());
                }
            }
        }
        out.pk = out.value(record.primary_key_name()).cloned();
        out
    }

    pub fn record_type(&self) -> &'static RecordType {
        self.record
    }

    /// Assign a field and mark it dirty.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), BuildError> {
        let index = self
            .record
            .field_index(name)
            .ok_or_else(|| BuildError::unknown_field(self.record.table(), name))?;
        let value = value.into();
        self.record.fields()[index].check_value(self.record, &value)?;
        self.values[index] = Some(value);
        self.dirty[index] = true;
        Ok(())
    }

    /// Value of a declared field, `None` when it was never assigned or loaded.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.value(name)
    }

    pub fn get_as<T: FromValue>(&self, name: &str) -> OrmResult<T> {
        let value = self.value(name).cloned().unwrap_or(Value::Null);
        T::from_value(value).map_err(|message| OrmError::decode(name, message))
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.record
            .field_index(name)
            .and_then(|i| self.values[i].as_ref())
            .filter(|v| !v.is_null())
    }

    /// A result column that is not a declared field, such as an annotation.
    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extras.get(name)
    }

    pub fn extras(&self) -> &BTreeMap<String, Value> {
        &self.extras
    }

    pub fn pk(&self) -> Option<&Value> {
        self.pk.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.pk.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.record
            .field_index(name)
            .is_some_and(|i| self.dirty[i])
    }

    pub fn dirty_fields(&self) -> Vec<&'static str> {
        self.record
            .fields()
            .iter()
            .zip(&self.dirty)
            .filter(|(_, dirty)| **dirty)
            .map(|(f, _)| f.name())
            .collect()
    }

    /// Field values in declaration order. Unassigned fields are NULL; the primary
    /// key is left out while it has no value.
    pub fn to_row(&self) -> Vec<Value> {
        let pk_name = self.record.primary_key_name();
        self.record
            .fields()
            .iter()
            .zip(&self.values)
            .filter(|(f, v)| f.name() != pk_name || v.as_ref().is_some_and(|v| !v.is_null()))
            .map(|(_, v)| v.clone().unwrap_or(Value::Null))
            .collect()
    }

    /// Assigned fields and extras as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (field, value) in self.record.fields().iter().zip(&self.values) {
            if let Some(value) = value {
                map.insert(field.name().to_string(), json_value(value));
            }
        }
        for (name, value) in &self.extras {
            map.insert(name.clone(), json_value(value));
        }
        serde_json::Value::Object(map)
    }

    fn assigned_fields(&self) -> Fields {
        self.collect_fields(|i| self.values[i].is_some())
    }

    fn dirty_assignments(&self) -> Fields {
        self.collect_fields(|i| self.dirty[i])
    }

    fn collect_fields(&self, keep: impl Fn(usize) -> bool) -> Fields {
        self.record
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, _)| keep(*i))
            .map(|(i, f)| {
                let value = self.values[i].clone().unwrap_or(Value::Null);
                (f.name().to_string(), value)
            })
            .collect()
    }

    fn mark_clean(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
    }

    fn persisted_pk(&self) -> OrmResult<Value> {
        self.pk.clone().ok_or_else(|| {
            BuildError::invalid_argument(format!(
                "'{}' record has not been saved yet",
                self.record.table()
            ))
            .into()
        })
    }

    /// Un-executed query for the records whose relation named `name` points here,
    /// e.g. `user.related(&schema, "tweets")`.
    pub fn related(&self, schema: &Schema, name: &str) -> OrmResult<SelectQuery> {
        let (child, relation) = schema.related(self.record, name)?;
        let pk = self.persisted_pk()?;
        Ok(SelectQuery::new(child).filter(child.col(relation.field()).eq(pk)))
    }

    /// Un-executed query for the record the foreign key `field` points at.
    pub fn foreign(&self, field: &str) -> OrmResult<SelectQuery> {
        let relation = self
            .record
            .relations()
            .iter()
            .find(|r| r.field() == field)
            .ok_or_else(|| BuildError::unknown_field(self.record.table(), field))?;
        let value = self.value(field).cloned().ok_or_else(|| {
            BuildError::invalid_argument(format!(
                "{}.{field} is not set",
                self.record.table()
            ))
        })?;
        let target = relation.references();
        Ok(SelectQuery::new(target).filter(target.pk().eq(value)))
    }

    /// Insert a row and return it as a persisted record.
    pub async fn create(
        db: &impl GenericClient,
        record: &'static RecordType,
        fields: Fields,
    ) -> OrmResult<Record> {
        InsertQuery::new(record, fields)
            .execute_returning(db)
            .await?
            .pop()
            .ok_or_else(|| OrmError::not_found("INSERT returned no row"))
    }

    /// INSERT when not persisted, otherwise UPDATE the dirty fields by primary key.
    /// A clean persisted record issues no statement. Returns the affected row count.
    pub async fn save(&mut self, db: &impl GenericClient) -> OrmResult<u64> {
        if self.deleted {
            return Err(BuildError::invalid_argument(format!(
                "'{}' record was deleted",
                self.record.table()
            ))
            .into());
        }
        let Some(pk) = self.pk.clone() else {
            let created = Record::create(db, self.record, self.assigned_fields()).await?;
            let extras = std::mem::take(&mut self.extras);
            *self = Record { extras, ..created };
            return Ok(1);
        };

        let changes = self.dirty_assignments();
        if changes.is_empty() {
            return Ok(0);
        }
        let affected = UpdateQuery::new(self.record)
            .set_fields(changes)
            .filter(self.record.pk().eq(pk))
            .execute(db)
            .await?;
        if let Some(pk) = self.value(self.record.primary_key_name()) {
            self.pk = Some(pk.clone());
        }
        self.mark_clean();
        Ok(affected)
    }

    /// DELETE this record by primary key.
    pub async fn delete_instance(&mut self, db: &impl GenericClient) -> OrmResult<u64> {
        let pk = self.persisted_pk()?;
        let affected = DeleteQuery::new(self.record)
            .filter(self.record.pk().eq(pk))
            .execute(db)
            .await?;
        self.deleted = true;
        Ok(affected)
    }

    /// Delete this record and everything that depends on it, in one scope.
    ///
    /// Dependents reached through a nullable foreign key are kept and get NULL;
    /// the others are deleted, deepest first. Returns the number of deleted rows.
    pub async fn delete_instance_recursive<G: GenericClient>(
        &mut self,
        schema: &Schema,
        db: &mut G,
    ) -> OrmResult<u64> {
        let pk = self.persisted_pk()?;
        let scope = db.atomic().await?;
        match delete_cascade(schema, &scope, self.record, pk).await {
            Ok(deleted) => {
                scope.commit().await?;
                self.deleted = true;
                Ok(deleted)
            }
            Err(err) => Err(rollback_with(scope, err).await),
        }
    }
}

async fn delete_cascade(
    schema: &Schema,
    db: &impl GenericClient,
    record: &'static RecordType,
    pk: Value,
) -> OrmResult<u64> {
    let mut doomed: Vec<(&'static RecordType, Value)> = vec![(record, pk)];
    let mut next = 0;
    while next < doomed.len() {
        let (owner, key) = doomed[next].clone();
        next += 1;
        for (child, relation) in schema.dependents(owner) {
            let fk = child.col(relation.field());
            let nullable = child
                .field(relation.field())
                .is_some_and(|f| f.is_nullable());
            if nullable {
                UpdateQuery::new(child)
                    .set(relation.field(), Value::Null)
                    .filter(fk.eq(key.clone()))
                    .execute(db)
                    .await?;
                continue;
            }
            let children = SelectQuery::new(child)
                .columns([child.pk()])
                .filter(fk.eq(key.clone()))
                .fetch_all(db)
                .await?;
            for found in children {
                if let Some(child_pk) = found.pk() {
                    let entry = (child, child_pk.clone());
                    if !doomed.contains(&entry) {
                        doomed.push(entry);
                    }
                }
            }
        }
    }

    let mut deleted = 0;
    for (target, key) in doomed.into_iter().rev() {
        deleted += DeleteQuery::new(target)
            .filter(target.pk().eq(key))
            .execute(db)
            .await?;
    }
    Ok(deleted)
}

fn json_value(value: &Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// A record stands for its primary key, so it can be assigned to a foreign key.
impl From<&Record> for Value {
    fn from(record: &Record) -> Self {
        record.pk.clone().unwrap_or(Value::Null)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: BTreeMap<&str, &Value> = self
            .record
            .fields()
            .iter()
            .zip(&self.values)
            .filter_map(|(field, v)| v.as_ref().map(|v| (field.name(), v)))
            .collect();
        f.debug_struct("Record")
            .field("table", &self.record.table())
            .field("fields", &fields)
            .field("extras", &self.extras)
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::testing::{MockConnection, PERSON, Reply, TWEET, USER, sample_schema};
    use crate::Database;
    use std::sync::Arc;

    fn user_row(values: Vec<Value>) -> RawRow {
        let columns: Arc<[String]> = ["id", "username", "age", "active"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        RawRow::new(columns, values)
    }

    #[test]
    fn test_from_row_then_to_row_round_trips() {
        let row = user_row(vec![
            Value::Int(1),
            Value::from("alice"),
            Value::Int(31),
            Value::Bool(true),
        ]);
        let user = Record::from_row(&USER, &row);
        assert!(user.is_persisted());
        assert_eq!(user.pk(), Some(&Value::Int(1)));
        assert_eq!(user.to_row(), row.values());
        assert!(user.dirty_fields().is_empty());
    }

    #[test]
    fn test_to_row_omits_unset_primary_key() {
        let user = Record::from_fields(&USER, fields!["username" => "bob", "active" => true]).unwrap();
        assert_eq!(
            user.to_row(),
            [Value::from("bob"), Value::Null, Value::Bool(true)]
        );
        assert!(!user.is_persisted());
    }

    #[test]
    fn test_extra_columns_are_kept() {
        let columns: Arc<[String]> = ["id", "username", "count"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let row = RawRow::new(columns, vec![Value::Int(1), Value::from("alice"), Value::Int(4)]);
        let user = Record::from_row(&USER, &row);
        assert_eq!(user.extra("count"), Some(&Value::Int(4)));
        assert_eq!(user.get("count"), None);
        assert_eq!(
            user.to_json(),
            serde_json::json!({"id": 1, "username": "alice", "count": 4})
        );
    }

    #[test]
    fn test_set_checks_names_and_types() {
        let mut user = Record::new(&USER);
        assert!(matches!(
            user.set("nickname", "x"),
            Err(BuildError::UnknownField { .. })
        ));
        assert!(user.set("age", "old").is_err());
        user.set("age", 40).unwrap();
        assert!(user.is_dirty("age"));
        assert_eq!(user.get_as::<i32>("age").unwrap(), 40);
        assert_eq!(user.get_as::<Option<String>>("username").unwrap(), None);
    }

    #[test]
    fn test_related_and_foreign_are_lazy_queries() {
        let schema = sample_schema();
        let user = Record::from_row(
            &USER,
            &user_row(vec![Value::Int(7), Value::from("a"), Value::Null, Value::Bool(true)]),
        );
        let tweets = user.related(&schema, "tweets").unwrap().compile().unwrap();
        assert_eq!(
            tweets.sql(),
            "SELECT id, user_id, message FROM tweets WHERE user_id = $1"
        );
        assert_eq!(tweets.params(), &[Value::Int(7)]);

        let mut tweet = Record::new(&TWEET);
        tweet.set("user_id", &user).unwrap();
        let owner = tweet.foreign("user_id").unwrap().compile().unwrap();
        assert_eq!(
            owner.sql(),
            "SELECT id, username, age, active FROM users WHERE id = $1"
        );
        assert!(Record::new(&USER).related(&schema, "tweets").is_err());
        assert!(user.related(&schema, "followers").is_err());
    }

    #[tokio::test]
    async fn test_save_inserts_then_updates_dirty_fields() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(
            &["id", "username", "age", "active"],
            vec![vec![Value::Int(5), Value::from("carol"), Value::Null, Value::Bool(true)]],
        ));
        let db = Database::new(conn);

        let mut user = Record::from_fields(&USER, fields!["username" => "carol", "active" => true]).unwrap();
        assert_eq!(user.save(&db).await.unwrap(), 1);
        assert_eq!(user.pk(), Some(&Value::Int(5)));

        // clean: no statement
        assert_eq!(user.save(&db).await.unwrap(), 0);

        user.set("age", 22).unwrap();
        user.save(&db).await.unwrap();
        assert!(user.dirty_fields().is_empty());

        assert_eq!(
            db.connection().unwrap().log(),
            [
                "INSERT INTO users (username, active) VALUES ($1, $2) RETURNING id, username, age, active",
                "UPDATE users SET age = $1 WHERE id = $2",
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_instance_marks_deleted() {
        let db = Database::new(MockConnection::new());
        let mut user = Record::from_row(
            &USER,
            &user_row(vec![Value::Int(3), Value::from("d"), Value::Null, Value::Bool(false)]),
        );
        assert_eq!(user.delete_instance(&db).await.unwrap(), 1);
        assert!(user.is_deleted());
        assert!(user.save(&db).await.unwrap_err().is_build_error());
        assert_eq!(
            db.connection().unwrap().log(),
            ["DELETE FROM users WHERE id = $1"]
        );
    }

    #[tokio::test]
    async fn test_recursive_delete_nulls_optional_references() {
        let mut db = Database::new(MockConnection::new());
        let columns: Arc<[String]> = ["id", "name"].iter().map(|c| c.to_string()).collect();
        let mut owner = Record::from_row(
            &PERSON,
            &RawRow::new(columns, vec![Value::Int(1), Value::from("ann")]),
        );
        owner
            .delete_instance_recursive(&sample_schema(), &mut db)
            .await
            .unwrap();

        let log = db.connection().unwrap().log();
        assert_eq!(
            log,
            [
                "BEGIN",
                "UPDATE pets SET owner_id = $1 WHERE owner_id = $2",
                "DELETE FROM people WHERE id = $1",
                "COMMIT",
            ]
        );
        assert!(owner.is_deleted());
    }

    #[tokio::test]
    async fn test_recursive_delete_removes_children_first() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(&["id"], vec![vec![Value::Int(10)], vec![Value::Int(11)]]));
        let mut db = Database::new(conn);
        let mut user = Record::from_row(
            &USER,
            &user_row(vec![Value::Int(1), Value::from("a"), Value::Null, Value::Bool(true)]),
        );
        user.delete_instance_recursive(&sample_schema(), &mut db)
            .await
            .unwrap();

        assert_eq!(
            db.connection().unwrap().log(),
            [
                "BEGIN",
                "SELECT id FROM tweets WHERE user_id = $1",
                "DELETE FROM tweets WHERE id = $1",
                "DELETE FROM tweets WHERE id = $1",
                "DELETE FROM users WHERE id = $1",
                "COMMIT",
            ]
        );
        let params = db.connection().unwrap().params();
        assert_eq!(params[1], [Value::Int(11)]);
        assert_eq!(params[2], [Value::Int(10)]);
    }

    const USER_COLUMNS: [&str; 4] = ["id", "username", "age", "active"];
    const SELECT_EVE: &str =
        "SELECT id, username, age, active FROM users WHERE username = $1 LIMIT 1";
    const INSERT_EVE: &str =
        "INSERT INTO users (username, active) VALUES ($1, $2) RETURNING id, username, age, active";

    fn eve(id: i64) -> Vec<Value> {
        vec![Value::Int(id), Value::from("eve"), Value::Null, Value::Bool(true)]
    }

    #[tokio::test]
    async fn test_get_or_create_inserts_when_missing() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(&USER_COLUMNS, vec![]));
        conn.reply(Reply::rows(&USER_COLUMNS, vec![eve(9)]));
        let mut db = Database::new(conn);

        let (user, created) = db
            .get_or_create(&USER, USER.col("username").eq("eve"), fields!["active" => true])
            .await
            .unwrap();
        assert!(created);
        assert_eq!(user.pk(), Some(&Value::Int(9)));
        assert_eq!(
            db.connection().unwrap().log(),
            [SELECT_EVE, "BEGIN", INSERT_EVE, "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing_row() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(&USER_COLUMNS, vec![eve(4)]));
        let mut db = Database::new(conn);

        let (user, created) = db
            .get_or_create(&USER, USER.col("username").eq("eve"), fields!["active" => true])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(user.get_as::<String>("username").unwrap(), "eve");
        assert_eq!(db.connection().unwrap().log(), [SELECT_EVE]);
    }

    #[tokio::test]
    async fn test_get_or_create_recovers_from_lost_race() {
        let conn = MockConnection::new();
        conn.reply(Reply::rows(&USER_COLUMNS, vec![]));
        conn.reply(Reply::Fail(OrmError::UniqueViolation("users_username_key".into())));
        conn.reply(Reply::rows(&USER_COLUMNS, vec![eve(2)]));
        let mut db = Database::new(conn);

        let (user, created) = db
            .get_or_create(&USER, USER.col("username").eq("eve"), fields!["active" => true])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(user.pk(), Some(&Value::Int(2)));
        assert_eq!(
            db.connection().unwrap().log(),
            [SELECT_EVE, "BEGIN", INSERT_EVE, "ROLLBACK", SELECT_EVE]
        );
    }

    #[tokio::test]
    async fn test_create_or_get_falls_back_to_fetch() {
        let conn = MockConnection::new();
        conn.reply(Reply::Fail(OrmError::UniqueViolation("users_username_key".into())));
        conn.reply(Reply::rows(&USER_COLUMNS, vec![eve(2)]));
        let mut db = Database::new(conn);

        let (_, created) = db
            .create_or_get(&USER, fields!["username" => "eve"])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(
            db.connection().unwrap().log(),
            [
                "BEGIN",
                "INSERT INTO users (username) VALUES ($1) RETURNING id, username, age, active",
                "ROLLBACK",
                SELECT_EVE,
            ]
        );
    }
}
