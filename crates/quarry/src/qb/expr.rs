//! Expression tree for columns, literals, operators and function calls.
//!
//! Expressions are immutable; child nodes are `Arc`-shared so a predicate can be
//! reused in several queries without copying. Nothing is validated here: operand
//! arity, identifiers and column scope are all checked by the compiler.

use crate::qb::select::SelectQuery;
use crate::schema::RecordType;
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A field of a specific record type.
#[derive(Clone, PartialEq)]
pub struct ColumnRef {
    record: &'static RecordType,
    name: Cow<'static, str>,
}

impl ColumnRef {
    pub fn new(record: &'static RecordType, name: &str) -> Self {
        let name = match record.field(name) {
            Some(field) => Cow::Borrowed(field.name()),
            None => Cow::Owned(name.to_string()),
        };
        Self { record, name }
    }

    pub fn record(&self) -> &'static RecordType {
        self.record
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.record.table(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
    Like,
    ILike,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::In => "IN",
            BinaryOp::NotIn => "NOT IN",
            BinaryOp::Like => "LIKE",
            BinaryOp::ILike => "ILIKE",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    /// SQL binding strength, higher binds tighter.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::In
            | BinaryOp::NotIn
            | BinaryOp::Like
            | BinaryOp::ILike => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div => 6,
        }
    }

    pub fn is_membership(self) -> bool {
        matches!(self, BinaryOp::In | BinaryOp::NotIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    IsNull,
    IsNotNull,
    /// `DISTINCT x`, for use inside aggregates.
    Distinct,
    /// `EXISTS (subquery)`.
    Exists,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Arc<Expr>,
        right: Arc<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Arc<Expr>,
    },
    Function {
        name: Cow<'static, str>,
        args: Vec<Expr>,
    },
    Subquery(Arc<SelectQuery>),
    /// `expr AS alias` in a select list; elsewhere only `expr` is rendered.
    Aliased {
        expr: Arc<Expr>,
        alias: Cow<'static, str>,
    },
    /// A bare reference to a select-list alias, e.g. in ORDER BY.
    AliasRef(Cow<'static, str>),
    /// `*`, as in `COUNT(*)`.
    Wildcard,
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn col(record: &'static RecordType, name: &str) -> Self {
        Expr::Column(ColumnRef::new(record, name))
    }

    pub fn func(name: impl Into<Cow<'static, str>>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn subquery(query: &SelectQuery) -> Self {
        Expr::Subquery(Arc::new(query.clone()))
    }

    pub fn exists(query: &SelectQuery) -> Self {
        Expr::unary(UnaryOp::Exists, Expr::subquery(query))
    }

    pub fn alias_ref(name: impl Into<Cow<'static, str>>) -> Self {
        Expr::AliasRef(name.into())
    }

    fn binary(self, op: BinaryOp, rhs: impl Into<Expr>) -> Self {
        Expr::Binary {
            op,
            left: Arc::new(self),
            right: Arc::new(rhs.into()),
        }
    }

    fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Arc::new(operand),
        }
    }

    pub fn eq(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, rhs)
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, rhs)
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, rhs)
    }

    /// Membership test. The right-hand side must be a list literal or a subquery.
    pub fn is_in(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::In, rhs)
    }

    pub fn not_in(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::NotIn, rhs)
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Like, pattern)
    }

    pub fn ilike(self, pattern: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::ILike, pattern)
    }

    pub fn and(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, rhs)
    }

    pub fn or(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::unary(UnaryOp::Not, self)
    }

    pub fn is_null(self) -> Self {
        Expr::unary(UnaryOp::IsNull, self)
    }

    pub fn is_not_null(self) -> Self {
        Expr::unary(UnaryOp::IsNotNull, self)
    }

    pub fn alias(self, alias: impl Into<Cow<'static, str>>) -> Self {
        Expr::Aliased {
            expr: Arc::new(self),
            alias: alias.into(),
        }
    }

    pub fn asc(self) -> OrderBy {
        OrderBy {
            expr: self,
            direction: Direction::Asc,
        }
    }

    pub fn desc(self) -> OrderBy {
        OrderBy {
            expr: self,
            direction: Direction::Desc,
        }
    }

    /// AND together every predicate, `None` when the iterator is empty.
    pub fn all(predicates: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        predicates.into_iter().reduce(|acc, p| acc.and(p))
    }

    /// Strip a select-list alias.
    pub fn unaliased(&self) -> &Expr {
        match self {
            Expr::Aliased { expr, .. } => expr.unaliased(),
            other => other,
        }
    }

    /// Whether the expression contains an aggregate call.
    pub(crate) fn is_aggregate(&self) -> bool {
        match self {
            Expr::Function { name, args } => {
                func::AGGREGATES
                    .iter()
                    .any(|agg| agg.eq_ignore_ascii_case(name))
                    || args.iter().any(Expr::is_aggregate)
            }
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Unary { operand, .. } => operand.is_aggregate(),
            Expr::Aliased { expr, .. } => expr.is_aggregate(),
            _ => false,
        }
    }

    /// Column-equals-literal pairs of a conjunction, in order.
    ///
    /// `a = 1 AND (b = 2 AND c > 3)` yields `[(a, 1), (b, 2)]`; disjunctions are
    /// not descended into.
    pub fn equalities(&self) -> Vec<(&ColumnRef, &Value)> {
        let mut out = Vec::new();
        self.collect_equalities(&mut out);
        out
    }

    fn collect_equalities<'a>(&'a self, out: &mut Vec<(&'a ColumnRef, &'a Value)>) {
        if let Expr::Binary { op, left, right } = self {
            match (op, left.as_ref(), right.as_ref()) {
                (BinaryOp::And, l, r) => {
                    l.collect_equalities(out);
                    r.collect_equalities(out);
                }
                (BinaryOp::Eq, Expr::Column(c), Expr::Literal(v))
                | (BinaryOp::Eq, Expr::Literal(v), Expr::Column(c)) => out.push((c, v)),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
}

macro_rules! impl_arithmetic {
    ($($trait:ident :: $method:ident => $op:ident),+ $(,)?) => {
        $(
            impl<T: Into<Expr>> std::ops::$trait<T> for Expr {
                type Output = Expr;

                fn $method(self, rhs: T) -> Expr {
                    self.binary(BinaryOp::$op, rhs)
                }
            }
        )+
    };
}

// `USER.col("age") + 1` builds `age + $1`.
impl_arithmetic!(
    Add::add => Add,
    Sub::sub => Sub,
    Mul::mul => Mul,
    Div::div => Div,
);

impl From<Expr> for OrderBy {
    fn from(expr: Expr) -> Self {
        expr.asc()
    }
}

macro_rules! impl_expr_from_literal {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Literal(Value::from(v))
                }
            }
        )+
    };
}

impl_expr_from_literal!(
    bool,
    i16,
    i32,
    i64,
    u32,
    f32,
    f64,
    Decimal,
    &str,
    String,
    &String,
    NaiveDate,
    NaiveDateTime,
    DateTime<Utc>,
    Uuid,
    serde_json::Value,
);

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Expr {
    fn from(v: Option<T>) -> Self {
        Expr::Literal(v.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Expr {
    fn from(v: Vec<T>) -> Self {
        Expr::Literal(Value::list(v))
    }
}

impl From<SelectQuery> for Expr {
    fn from(q: SelectQuery) -> Self {
        Expr::Subquery(Arc::new(q))
    }
}

impl From<&SelectQuery> for Expr {
    fn from(q: &SelectQuery) -> Self {
        Expr::subquery(q)
    }
}

/// SQL function helpers.
pub mod func {
    use super::{Expr, UnaryOp};

    pub(crate) const AGGREGATES: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

    pub fn count(expr: Expr) -> Expr {
        Expr::func("COUNT", vec![expr])
    }

    /// `COUNT(*)`
    pub fn count_all() -> Expr {
        Expr::func("COUNT", vec![Expr::Wildcard])
    }

    pub fn sum(expr: Expr) -> Expr {
        Expr::func("SUM", vec![expr])
    }

    pub fn avg(expr: Expr) -> Expr {
        Expr::func("AVG", vec![expr])
    }

    pub fn min(expr: Expr) -> Expr {
        Expr::func("MIN", vec![expr])
    }

    pub fn max(expr: Expr) -> Expr {
        Expr::func("MAX", vec![expr])
    }

    /// `DISTINCT expr`, e.g. `count(distinct(url))`.
    pub fn distinct(expr: Expr) -> Expr {
        Expr::unary(UnaryOp::Distinct, expr)
    }

    pub fn random() -> Expr {
        Expr::func("RANDOM", Vec::new())
    }

    pub fn lower(expr: Expr) -> Expr {
        Expr::func("LOWER", vec![expr])
    }

    pub fn upper(expr: Expr) -> Expr {
        Expr::func("UPPER", vec![expr])
    }

    pub fn coalesce(args: Vec<Expr>) -> Expr {
        Expr::func("COALESCE", args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::USER;

    #[test]
    fn column_names_borrow_from_the_schema() {
        let c = ColumnRef::new(&USER, "username");
        assert!(matches!(c.name, Cow::Borrowed("username")));
        assert_eq!(format!("{c:?}"), "users.username");
    }

    #[test]
    fn equalities_walk_conjunctions_only() {
        let pred = USER
            .col("username")
            .eq("alice")
            .and(Expr::lit(30).eq(USER.col("age")).and(USER.col("id").gt(3)))
            .and(USER.col("active").eq(true).or(USER.col("active").is_null()));
        let eqs: Vec<(&str, &Value)> = pred
            .equalities()
            .into_iter()
            .map(|(c, v)| (c.name(), v))
            .collect();
        assert_eq!(
            eqs,
            vec![("username", &Value::from("alice")), ("age", &Value::Int(30))]
        );
    }

    #[test]
    fn aggregates_are_detected_through_aliases() {
        assert!(func::count(USER.pk()).alias("n").is_aggregate());
        assert!(!func::lower(USER.col("username")).is_aggregate());
    }

    #[test]
    fn arithmetic_operators_build_binary_expressions() {
        let expr = (USER.col("age") + 1) * 2 - USER.col("id") / 4;
        let Expr::Binary { op: BinaryOp::Sub, left, right } = expr else {
            panic!("expected subtraction at the root");
        };
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Mul, .. }));
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Div, .. }));
    }

    #[test]
    fn all_reduces_to_left_nested_and() {
        let a = USER.col("id").eq(1);
        let b = USER.col("id").eq(2);
        assert_eq!(Expr::all([a.clone(), b.clone()]), Some(a.and(b)));
        assert_eq!(Expr::all([]), None);
    }
}
