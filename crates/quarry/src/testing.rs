//! Shared fixtures for unit tests: a small schema and a scripted connection.

use crate::client::Connection;
use crate::error::{OrmError, OrmResult};
use crate::row::RawRow;
use crate::schema::{FieldDescriptor, RecordType, Relation, Schema, SqlType};
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) static USER: RecordType = RecordType::new(
    "users",
    &[
        FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
        FieldDescriptor::new("username", SqlType::Text).unique(),
        FieldDescriptor::new("age", SqlType::Integer).nullable(),
        FieldDescriptor::new("active", SqlType::Boolean),
    ],
);

pub(crate) static TWEET: RecordType = RecordType::new(
    "tweets",
    &[
        FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
        FieldDescriptor::new("user_id", SqlType::BigInt),
        FieldDescriptor::new("message", SqlType::Text),
    ],
)
.with_relations(&[Relation::new("user_id", &USER).related_name("tweets")]);

pub(crate) static PERSON: RecordType = RecordType::new(
    "people",
    &[
        FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
        FieldDescriptor::new("name", SqlType::Text),
    ],
);

pub(crate) static PET: RecordType = RecordType::new(
    "pets",
    &[
        FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
        FieldDescriptor::new("owner_id", SqlType::BigInt).nullable(),
        FieldDescriptor::new("name", SqlType::Text),
    ],
)
.with_relations(&[Relation::new("owner_id", &PERSON).related_name("pets")]);

pub(crate) fn sample_schema() -> Schema {
    Schema::builder()
        .record(&USER)
        .record(&TWEET)
        .record(&PERSON)
        .record(&PET)
        .build()
        .expect("sample schema is valid")
}

/// One scripted answer, consumed by the next `execute` or `query`
/// (or by the next transaction command, when queued with `batch_reply`).
pub(crate) enum Reply {
    Rows(Vec<RawRow>),
    Affected(u64),
    Fail(OrmError),
    /// Sleep, then answer as if nothing was scripted.
    Delay(Duration),
}

impl Reply {
    pub(crate) fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
        Reply::Rows(
            rows.into_iter()
                .map(|values| RawRow::new(Arc::clone(&columns), values))
                .collect(),
        )
    }
}

/// Records every statement and transaction command. Unscripted statements
/// affect one row; unscripted queries return no rows.
#[derive(Default)]
pub(crate) struct MockConnection {
    log: Mutex<Vec<String>>,
    params: Mutex<Vec<Vec<Value>>>,
    replies: Mutex<VecDeque<Reply>>,
    batch_replies: Mutex<VecDeque<Reply>>,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn batch_reply(&self, reply: Reply) {
        self.batch_replies.lock().unwrap().push_back(reply);
    }

    /// Every SQL string seen, transaction commands included.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Bound parameters of each `execute`/`query`, in order.
    pub(crate) fn params(&self) -> Vec<Vec<Value>> {
        self.params.lock().unwrap().clone()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Option<Reply> {
        self.log.lock().unwrap().push(sql.to_string());
        self.params.lock().unwrap().push(params.to_vec());
        self.replies.lock().unwrap().pop_front()
    }
}

impl Connection for MockConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        match self.record(sql, params) {
            Some(Reply::Affected(n)) => Ok(n),
            Some(Reply::Rows(rows)) => Ok(rows.len() as u64),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(1)
            }
            None => Ok(1),
        }
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<RawRow>> {
        match self.record(sql, params) {
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Affected(_)) | None => Ok(Vec::new()),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(Vec::new())
            }
        }
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        self.log.lock().unwrap().push(sql.to_string());
        let reply = self.batch_replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
