//! The structured description of one statement. A plan holds no SQL text;
//! rendering happens per action in [`super::render`].

use crate::expr::Expression;
use crate::value::Value;
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Inner => "INNER JOIN",
        }
    }
}

/// One selected column: a (possibly qualified) expression plus the alias it
/// carries in the result row.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    pub expr: String,
    pub alias: Option<String>,
}

/// A join clause. `on` holds equality pairs of qualified identifiers; the
/// renderer quotes both sides.
#[derive(Debug, Clone)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    pub on: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub action: Action,
    pub table: String,
    pub alias: Option<String>,
    pub columns: Vec<ColumnRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expression>,
    pub group_by: Vec<String>,
    /// `(column, ascending)` pairs.
    pub order_by: Vec<(String, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    /// Column to value, for INSERT and UPDATE.
    pub values: IndexMap<String, Value>,
}

impl QueryPlan {
    pub fn new(action: Action, table: impl Into<String>) -> Self {
        Self {
            action,
            table: table.into(),
            alias: None,
            columns: vec![],
            joins: vec![],
            where_clause: None,
            group_by: vec![],
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: false,
            values: IndexMap::new(),
        }
    }
}
