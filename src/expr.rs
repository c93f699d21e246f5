//! Composable, parameterised boolean trees for WHERE clauses.
//!
//! An [`Expression`] is a flat list of clauses, each remembering the glue
//! (`AND`/`OR`) that joins it to the clauses before it. Compilation produces
//! a SQL fragment with named placeholders plus the parameter map; values are
//! never interpolated into the fragment.

use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glue {
    And,
    Or,
}

impl Glue {
    fn as_sql(&self) -> &'static str {
        match self {
            Glue::And => "AND",
            Glue::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
}

impl CmpOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Like => "LIKE",
            CmpOp::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Debug, Clone)]
enum Cond {
    Cmp {
        column: String,
        op: CmpOp,
        value: Value,
        /// Placeholder base overriding the column-derived name.
        param: Option<String>,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        exclusive: bool,
    },
    InList {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Nullness {
        column: String,
        negated: bool,
    },
    Exists {
        subquery: String,
        negated: bool,
    },
    Nested(Expression),
    Raw {
        sql: String,
        params: Vec<(String, Value)>,
    },
}

#[derive(Debug, Clone)]
struct Clause {
    glue: Glue,
    cond: Cond,
}

/// A fluent WHERE-clause builder. `and()`/`or()` pick the glue applied by the
/// unprefixed operations; each condition still records its own glue, and the
/// `and_*`/`or_*` forms mix freely within one expression.
#[derive(Debug, Clone)]
pub struct Expression {
    default_glue: Glue,
    clauses: Vec<Clause>,
}

/// Allocates placeholder names, deduplicating repeats of the same column
/// with an incrementing suffix.
#[derive(Debug, Default)]
pub(crate) struct ParamAllocator {
    used: HashSet<String>,
}

impl ParamAllocator {
    pub(crate) fn reserve(&mut self, name: &str) {
        self.used.insert(name.to_owned());
    }

    fn claim(&mut self, base: &str) -> String {
        if self.used.insert(base.to_owned()) {
            return base.to_owned();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn param_base(column: &str) -> String {
    column.replace('.', "_")
}

impl Expression {
    /// A builder whose unprefixed conditions join with AND.
    pub fn and() -> Self {
        Expression {
            default_glue: Glue::And,
            clauses: vec![],
        }
    }

    /// A builder whose unprefixed conditions join with OR.
    pub fn or() -> Self {
        Expression {
            default_glue: Glue::Or,
            clauses: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Eq, value)
    }

    pub fn not_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::NotEq, value)
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Lt, value)
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Lte, value)
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Gt, value)
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Gte, value)
    }

    pub fn like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::Like, pattern)
    }

    pub fn not_like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        let glue = self.default_glue;
        self.cmp(glue, column, CmpOp::NotLike, pattern)
    }

    fn push(mut self, glue: Glue, cond: Cond) -> Self {
        self.clauses.push(Clause { glue, cond });
        self
    }

    fn cmp(self, glue: Glue, column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        self.push(
            glue,
            Cond::Cmp {
                column: column.into(),
                op,
                value: value.into(),
                param: None,
            },
        )
    }

    /// Equality whose placeholder name comes from `param` instead of the
    /// column text. Criteria normalisation qualifies columns with the entity
    /// alias but still binds the bare column name.
    pub(crate) fn and_eq_as(
        self,
        column: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.push(
            Glue::And,
            Cond::Cmp {
                column: column.into(),
                op: CmpOp::Eq,
                value: value.into(),
                param: Some(param.into()),
            },
        )
    }

    pub fn and_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Eq, value)
    }

    pub fn or_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Eq, value)
    }

    pub fn and_not_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::NotEq, value)
    }

    pub fn or_not_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::NotEq, value)
    }

    pub fn and_lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Lt, value)
    }

    pub fn or_lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Lt, value)
    }

    pub fn and_lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Lte, value)
    }

    pub fn or_lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Lte, value)
    }

    pub fn and_gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Gt, value)
    }

    pub fn or_gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Gt, value)
    }

    pub fn and_gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Gte, value)
    }

    pub fn or_gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Gte, value)
    }

    pub fn and_like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::Like, pattern)
    }

    pub fn or_like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::Like, pattern)
    }

    pub fn and_not_like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        self.cmp(Glue::And, column, CmpOp::NotLike, pattern)
    }

    pub fn or_not_like(self, column: impl Into<String>, pattern: impl Into<Value>) -> Self {
        self.cmp(Glue::Or, column, CmpOp::NotLike, pattern)
    }

    fn between(
        self,
        glue: Glue,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
        exclusive: bool,
    ) -> Self {
        self.push(
            glue,
            Cond::Between {
                column: column.into(),
                low: low.into(),
                high: high.into(),
                exclusive,
            },
        )
    }

    pub fn and_between(
        self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.between(Glue::And, column, low, high, false)
    }

    pub fn or_between(
        self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.between(Glue::Or, column, low, high, false)
    }

    pub fn and_between_exclusive(
        self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.between(Glue::And, column, low, high, true)
    }

    pub fn or_between_exclusive(
        self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.between(Glue::Or, column, low, high, true)
    }

    fn in_list(
        self,
        glue: Glue,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
        negated: bool,
    ) -> Self {
        self.push(
            glue,
            Cond::InList {
                column: column.into(),
                values: values.into_iter().map(Into::into).collect(),
                negated,
            },
        )
    }

    pub fn and_in(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.in_list(Glue::And, column, values, false)
    }

    pub fn or_in(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.in_list(Glue::Or, column, values, false)
    }

    pub fn and_not_in(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.in_list(Glue::And, column, values, true)
    }

    pub fn or_not_in(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        self.in_list(Glue::Or, column, values, true)
    }

    pub fn and_is_null(self, column: impl Into<String>) -> Self {
        self.push(
            Glue::And,
            Cond::Nullness {
                column: column.into(),
                negated: false,
            },
        )
    }

    pub fn or_is_null(self, column: impl Into<String>) -> Self {
        self.push(
            Glue::Or,
            Cond::Nullness {
                column: column.into(),
                negated: false,
            },
        )
    }

    pub fn and_is_not_null(self, column: impl Into<String>) -> Self {
        self.push(
            Glue::And,
            Cond::Nullness {
                column: column.into(),
                negated: true,
            },
        )
    }

    pub fn or_is_not_null(self, column: impl Into<String>) -> Self {
        self.push(
            Glue::Or,
            Cond::Nullness {
                column: column.into(),
                negated: true,
            },
        )
    }

    pub fn and_exists(self, subquery: impl Into<String>) -> Self {
        self.push(
            Glue::And,
            Cond::Exists {
                subquery: subquery.into(),
                negated: false,
            },
        )
    }

    pub fn or_exists(self, subquery: impl Into<String>) -> Self {
        self.push(
            Glue::Or,
            Cond::Exists {
                subquery: subquery.into(),
                negated: false,
            },
        )
    }

    pub fn and_not_exists(self, subquery: impl Into<String>) -> Self {
        self.push(
            Glue::And,
            Cond::Exists {
                subquery: subquery.into(),
                negated: true,
            },
        )
    }

    pub fn or_not_exists(self, subquery: impl Into<String>) -> Self {
        self.push(
            Glue::Or,
            Cond::Exists {
                subquery: subquery.into(),
                negated: true,
            },
        )
    }

    /// Embeds another expression as a single parenthesised clause.
    pub fn and_nested(self, inner: Expression) -> Self {
        self.push(Glue::And, Cond::Nested(inner))
    }

    pub fn or_nested(self, inner: Expression) -> Self {
        self.push(Glue::Or, Cond::Nested(inner))
    }

    /// Raw SQL escape hatch. The fragment is emitted verbatim.
    pub fn and_raw(self, sql: impl Into<String>) -> Self {
        self.push(
            Glue::And,
            Cond::Raw {
                sql: sql.into(),
                params: vec![],
            },
        )
    }

    pub fn or_raw(self, sql: impl Into<String>) -> Self {
        self.push(
            Glue::Or,
            Cond::Raw {
                sql: sql.into(),
                params: vec![],
            },
        )
    }

    /// Raw fragment carrying its own named parameters. Placeholder names are
    /// renamed on collision, with the fragment rewritten to match.
    pub fn and_raw_params(
        self,
        sql: impl Into<String>,
        params: impl IntoIterator<Item = (impl Into<String>, impl Into<Value>)>,
    ) -> Self {
        self.push(
            Glue::And,
            Cond::Raw {
                sql: sql.into(),
                params: params
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            },
        )
    }

    pub fn or_raw_params(
        self,
        sql: impl Into<String>,
        params: impl IntoIterator<Item = (impl Into<String>, impl Into<Value>)>,
    ) -> Self {
        self.push(
            Glue::Or,
            Cond::Raw {
                sql: sql.into(),
                params: params
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            },
        )
    }

    /// Compiles to `(fragment, params)`. Each clause is parenthesised and
    /// joined by its stored glue; compilation of the same expression is
    /// deterministic.
    pub fn compile(&self) -> (String, IndexMap<String, Value>) {
        let mut params = IndexMap::new();
        let mut alloc = ParamAllocator::default();
        let sql = self.compile_with(&mut params, &mut alloc);
        (sql, params)
    }

    pub(crate) fn compile_with(
        &self,
        params: &mut IndexMap<String, Value>,
        alloc: &mut ParamAllocator,
    ) -> String {
        let mut sql = String::new();
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                sql.push(' ');
                sql.push_str(clause.glue.as_sql());
                sql.push(' ');
            }
            sql.push('(');
            sql.push_str(&compile_cond(&clause.cond, params, alloc));
            sql.push(')');
        }
        sql
    }
}

fn compile_cond(
    cond: &Cond,
    params: &mut IndexMap<String, Value>,
    alloc: &mut ParamAllocator,
) -> String {
    match cond {
        Cond::Cmp {
            column,
            op,
            value,
            param,
        } => {
            let base = match param {
                Some(param) => param_base(param),
                None => param_base(column),
            };
            let name = alloc.claim(&base);
            params.insert(name.clone(), value.clone());
            format!("{column} {} :{name}", op.as_sql())
        }
        Cond::Between {
            column,
            low,
            high,
            exclusive,
        } => {
            let base = param_base(column);
            let min = alloc.claim(&format!("{base}_min"));
            let max = alloc.claim(&format!("{base}_max"));
            params.insert(min.clone(), low.clone());
            params.insert(max.clone(), high.clone());
            if *exclusive {
                format!("{column} > :{min} AND {column} < :{max}")
            } else {
                format!("{column} BETWEEN :{min} AND :{max}")
            }
        }
        Cond::InList {
            column,
            values,
            negated,
        } => {
            let base = param_base(column);
            let mut names = Vec::with_capacity(values.len());
            for (i, value) in values.iter().enumerate() {
                let name = alloc.claim(&format!("{base}_{i}"));
                params.insert(name.clone(), value.clone());
                names.push(format!(":{name}"));
            }
            let keyword = if *negated { "NOT IN" } else { "IN" };
            format!("{column} {keyword} ({})", names.join(", "))
        }
        Cond::Nullness { column, negated } => {
            if *negated {
                format!("{column} IS NOT NULL")
            } else {
                format!("{column} IS NULL")
            }
        }
        Cond::Exists { subquery, negated } => {
            if *negated {
                format!("NOT EXISTS ({subquery})")
            } else {
                format!("EXISTS ({subquery})")
            }
        }
        Cond::Nested(inner) => inner.compile_with(params, alloc),
        Cond::Raw { sql, params: own } => {
            let mut sql = sql.clone();
            for (name, value) in own {
                let claimed = alloc.claim(name);
                if claimed != *name {
                    sql = sql.replace(&format!(":{name}"), &format!(":{claimed}"));
                }
                params.insert(claimed, value.clone());
            }
            sql
        }
    }
}
