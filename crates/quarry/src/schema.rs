//! Static schema declarations.
//!
//! Record types are declared once as `static` items and then collected into a
//! [`Schema`], which checks the cross-type invariants (relations must point at
//! registered types, inverse names must be unique).
//!
//! ```ignore
//! use quarry::schema::{FieldDescriptor, RecordType, Relation, SqlType};
//!
//! pub static USER: RecordType = RecordType::new("users", &[
//!     FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
//!     FieldDescriptor::new("username", SqlType::Text).unique(),
//! ]);
//!
//! pub static TWEET: RecordType = RecordType::new("tweets", &[
//!     FieldDescriptor::new("id", SqlType::BigInt).primary_key(),
//!     FieldDescriptor::new("user_id", SqlType::BigInt),
//!     FieldDescriptor::new("message", SqlType::Text),
//! ])
//! .with_relations(&[Relation::new("user_id", &USER).related_name("tweets")]);
//!
//! quarry::register_record!(USER, TWEET);
//! ```

use crate::error::BuildError;
use crate::ident::check_ident;
use crate::qb::expr::{ColumnRef, Expr};
use crate::value::Value;
use std::fmt;

/// SQL column types understood by the literal checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Text,
    Bytes,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
}

impl SqlType {
    pub fn sql_name(self) -> &'static str {
        match self {
            SqlType::SmallInt => "smallint",
            SqlType::Integer => "integer",
            SqlType::BigInt => "bigint",
            SqlType::Real => "real",
            SqlType::Double => "double precision",
            SqlType::Numeric => "numeric",
            SqlType::Boolean => "boolean",
            SqlType::Text => "text",
            SqlType::Bytes => "bytea",
            SqlType::Date => "date",
            SqlType::Timestamp => "timestamp",
            SqlType::TimestampTz => "timestamptz",
            SqlType::Uuid => "uuid",
            SqlType::Json => "jsonb",
        }
    }

    /// Whether a non-null literal can be stored in a column of this type.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (SqlType::SmallInt | SqlType::Integer | SqlType::BigInt, Value::Int(_))
                | (SqlType::Real | SqlType::Double, Value::Float(_) | Value::Int(_))
                | (SqlType::Numeric, Value::Numeric(_) | Value::Int(_) | Value::Float(_))
                | (SqlType::Boolean, Value::Bool(_))
                | (SqlType::Text, Value::Text(_))
                | (SqlType::Bytes, Value::Bytes(_))
                | (SqlType::Date, Value::Date(_))
                | (
                    SqlType::Timestamp | SqlType::TimestampTz,
                    Value::Timestamp(_) | Value::TimestampTz(_)
                )
                | (SqlType::Uuid, Value::Uuid(_) | Value::Text(_))
                | (SqlType::Json, Value::Json(_))
        )
    }
}

/// One declared column of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    name: &'static str,
    sql_type: SqlType,
    nullable: bool,
    unique: bool,
    primary_key: bool,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            nullable: false,
            unique: false,
            primary_key: false,
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    pub const fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    /// Primary keys are implicitly unique and never nullable.
    pub const fn primary_key(self) -> Self {
        Self {
            primary_key: true,
            unique: true,
            nullable: false,
            ..self
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    /// Check a literal about to be written into this field.
    pub(crate) fn check_value(&self, record: &RecordType, value: &Value) -> Result<(), BuildError> {
        let ok = match value {
            Value::Null => self.nullable,
            other => self.sql_type.accepts(other),
        };
        if ok {
            Ok(())
        } else {
            Err(BuildError::InvalidArgument(format!(
                "{} value cannot be stored in {}.{} ({}{})",
                value.type_name(),
                record.table,
                self.name,
                self.sql_type.sql_name(),
                if self.nullable { "" } else { " not null" },
            )))
        }
    }
}

/// A foreign key from a field of the owning type to another record type.
#[derive(Clone, Copy)]
pub struct Relation {
    field: &'static str,
    references: &'static RecordType,
    related_name: Option<&'static str>,
}

impl Relation {
    pub const fn new(field: &'static str, references: &'static RecordType) -> Self {
        Self {
            field,
            references,
            related_name: None,
        }
    }

    /// Name of the inverse collection on the referenced type (`user.tweets`).
    pub const fn related_name(self, name: &'static str) -> Self {
        Self {
            related_name: Some(name),
            ..self
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn references(&self) -> &'static RecordType {
        self.references
    }

    pub fn inverse_name(&self) -> Option<&'static str> {
        self.related_name
    }
}

// Relations may be cyclic, so only the target's table is printed.
impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("field", &self.field)
            .field("references", &self.references.table)
            .field("related_name", &self.related_name)
            .finish()
    }
}

/// A table with its ordered fields and outgoing relations.
#[derive(Debug)]
pub struct RecordType {
    table: &'static str,
    fields: &'static [FieldDescriptor],
    relations: &'static [Relation],
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
    }
}

impl Eq for RecordType {}

impl RecordType {
    pub const fn new(table: &'static str, fields: &'static [FieldDescriptor]) -> Self {
        Self {
            table,
            fields,
            relations: &[],
        }
    }

    pub const fn with_relations(self, relations: &'static [Relation]) -> Self {
        Self { relations, ..self }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    pub fn relations(&self) -> &'static [Relation] {
        self.relations
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Name of the primary-key column, `id` when none is declared.
    pub fn primary_key_name(&self) -> &'static str {
        self.primary_key().map_or("id", |f| f.name)
    }

    /// Column expression for a field of this type.
    pub fn col(&'static self, name: &str) -> Expr {
        Expr::Column(ColumnRef::new(self, name))
    }

    /// Column expression for the primary key.
    pub fn pk(&'static self) -> Expr {
        self.col(self.primary_key_name())
    }

    /// Every declared field as a column expression, in declaration order.
    pub fn columns(&'static self) -> Vec<Expr> {
        self.fields.iter().map(|f| self.col(f.name)).collect()
    }

    /// The relation of this type pointing at `other`, if any.
    pub fn relation_to(&self, other: &RecordType) -> Option<&'static Relation> {
        self.relations.iter().find(|r| r.references == other)
    }

    /// Check the per-type invariants.
    pub fn validate(&self) -> Result<(), BuildError> {
        check_ident("table name", self.table)?;
        let pk_count = self.fields.iter().filter(|f| f.primary_key).count();
        if pk_count != 1 {
            return Err(BuildError::InvalidArgument(format!(
                "'{}' must declare exactly one primary key, found {pk_count}",
                self.table
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            check_ident("field name", field.name)?;
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(BuildError::InvalidArgument(format!(
                    "'{}' declares field '{}' twice",
                    self.table, field.name
                )));
            }
        }
        for relation in self.relations {
            if self.field(relation.field).is_none() {
                return Err(BuildError::unknown_field(self.table, relation.field));
            }
            if let Some(name) = relation.related_name {
                check_ident("related name", name)?;
            }
        }
        Ok(())
    }
}

/// Link-time registration of a record type, see [`register_record!`](crate::register_record).
pub struct RecordRegistration(pub &'static RecordType);

inventory::collect!(RecordRegistration);

/// Register record types so that [`Schema::from_registry`] picks them up.
#[macro_export]
macro_rules! register_record {
    ($($record:path),+ $(,)?) => {
        $(
            $crate::inventory::submit! {
                $crate::schema::RecordRegistration(&$record)
            }
        )+
    };
}

/// A validated set of record types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    records: Vec<&'static RecordType>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Build a schema from every type registered with `register_record!`.
    ///
    /// Registration order is unspecified, so records are sorted by table name.
    pub fn from_registry() -> Result<Self, BuildError> {
        let mut records: Vec<&'static RecordType> = inventory::iter::<RecordRegistration>
            .into_iter()
            .map(|reg| reg.0)
            .collect();
        records.sort_by_key(|r| r.table);
        SchemaBuilder { records }.build()
    }

    pub fn records(&self) -> &[&'static RecordType] {
        &self.records
    }

    pub fn get(&self, table: &str) -> Option<&'static RecordType> {
        self.records.iter().copied().find(|r| r.table == table)
    }

    /// Resolve an inverse collection name on `owner` (e.g. `"tweets"` on users).
    pub fn related(
        &self,
        owner: &RecordType,
        related_name: &str,
    ) -> Result<(&'static RecordType, &'static Relation), BuildError> {
        self.dependents(owner)
            .into_iter()
            .find(|(_, rel)| rel.related_name == Some(related_name))
            .ok_or_else(|| BuildError::unknown_field(owner.table, related_name))
    }

    /// Every (record type, relation) pair whose relation references `owner`.
    pub fn dependents(&self, owner: &RecordType) -> Vec<(&'static RecordType, &'static Relation)> {
        self.records
            .iter()
            .flat_map(|r| r.relations.iter().map(move |rel| (*r, rel)))
            .filter(|(_, rel)| rel.references == owner)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    records: Vec<&'static RecordType>,
}

impl SchemaBuilder {
    pub fn record(mut self, record: &'static RecordType) -> Self {
        self.records.push(record);
        self
    }

    pub fn build(self) -> Result<Schema, BuildError> {
        for (i, record) in self.records.iter().enumerate() {
            record.validate()?;
            if self.records[..i].iter().any(|r| r.table == record.table) {
                return Err(BuildError::InvalidArgument(format!(
                    "record type '{}' registered twice",
                    record.table
                )));
            }
        }
        for record in &self.records {
            for relation in record.relations {
                if !self.records.iter().any(|r| *r == relation.references) {
                    return Err(BuildError::UnresolvedRelation {
                        from: record.table.to_string(),
                        to: relation.references.table.to_string(),
                    });
                }
            }
        }
        let schema = Schema {
            records: self.records,
        };
        for record in &schema.records {
            let mut seen: Vec<&str> = Vec::new();
            for (_, rel) in schema.dependents(record) {
                if let Some(name) = rel.related_name {
                    if seen.contains(&name) {
                        return Err(BuildError::InvalidArgument(format!(
                            "related name '{name}' is used twice on '{}'",
                            record.table
                        )));
                    }
                    seen.push(name);
                }
            }
        }
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PERSON, PET, TWEET, USER, sample_schema};

    #[test]
    fn sample_schema_is_valid() {
        let schema = sample_schema();
        assert_eq!(schema.records().len(), 4);
        assert_eq!(schema.get("tweets"), Some(&TWEET));
    }

    #[test]
    fn exactly_one_primary_key() {
        static NO_PK: RecordType =
            RecordType::new("no_pk", &[FieldDescriptor::new("name", SqlType::Text)]);
        static TWO_PK: RecordType = RecordType::new(
            "two_pk",
            &[
                FieldDescriptor::new("a", SqlType::BigInt).primary_key(),
                FieldDescriptor::new("b", SqlType::BigInt).primary_key(),
            ],
        );
        assert!(matches!(NO_PK.validate(), Err(BuildError::InvalidArgument(_))));
        assert!(matches!(TWO_PK.validate(), Err(BuildError::InvalidArgument(_))));
        assert!(USER.validate().is_ok());
    }

    #[test]
    fn relation_field_must_be_declared() {
        static BROKEN: RecordType = RecordType::new(
            "broken",
            &[FieldDescriptor::new("id", SqlType::BigInt).primary_key()],
        )
        .with_relations(&[Relation::new("owner_id", &USER)]);
        assert_eq!(
            BROKEN.validate(),
            Err(BuildError::unknown_field("broken", "owner_id"))
        );
    }

    #[test]
    fn relation_target_must_be_registered() {
        let err = Schema::builder().record(&TWEET).build().unwrap_err();
        assert_eq!(
            err,
            BuildError::UnresolvedRelation {
                from: "tweets".into(),
                to: "users".into()
            }
        );
    }

    #[test]
    fn inverse_names_resolve() {
        let schema = sample_schema();
        let (record, relation) = schema.related(&USER, "tweets").unwrap();
        assert_eq!(record, &TWEET);
        assert_eq!(relation.field(), "user_id");
        assert!(schema.related(&USER, "followers").is_err());

        let dependents = schema.dependents(&PERSON);
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].0, &PET);
    }

    #[test]
    fn literal_checks_follow_type_and_nullability() {
        let age = USER.field("age").unwrap();
        assert!(age.check_value(&USER, &Value::Int(3)).is_ok());
        assert!(age.check_value(&USER, &Value::Null).is_ok());
        let username = USER.field("username").unwrap();
        assert!(username.check_value(&USER, &Value::Null).is_err());
        assert!(username.check_value(&USER, &Value::Int(1)).is_err());

        let exact = rust_decimal::Decimal::new(25, 1);
        assert!(SqlType::Numeric.accepts(&Value::Numeric(exact)));
        assert!(SqlType::Numeric.accepts(&Value::Int(2)));
        assert!(!SqlType::BigInt.accepts(&Value::Numeric(exact)));
    }

    #[test]
    fn debug_of_cyclic_relation_terminates() {
        let out = format!("{:?}", TWEET.relations()[0]);
        assert!(out.contains("users"));
    }
}
