//! Thin execution layer over a `sqlx` Any pool.
//!
//! Statements are written with named `:param` placeholders; the statement
//! expands them to the backend's positional syntax at execution time and
//! binds the values in placeholder order. The driver returns errors and
//! never logs.

use crate::error::DriverError;
use crate::value::Value;
use futures::stream::{BoxStream, LocalBoxStream};
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use sqlx::any::{Any, AnyArguments, AnyKind, AnyPool, AnyPoolOptions, AnyRow};
use sqlx::{Column, Executor, Row as _, ValueRef};
use std::pin::Pin;
use std::task::{Context, Poll};

/// One result row: aliased column name to raw value, in SELECT order.
pub type Row = IndexMap<String, Value>;

pub type RowStream = LocalBoxStream<'static, Result<Row, DriverError>>;

/// Backend family; decides placeholder syntax and identifier quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Sqlite,
    Postgres,
    Mysql,
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Mysql
    }
}

impl Kind {
    fn quote_char(self) -> char {
        match self {
            Kind::Mysql => '`',
            Kind::Sqlite | Kind::Postgres => '"',
        }
    }
}

/// Quotes one identifier for the given backend. Idempotent; `*`, function
/// calls and already-quoted names pass through, qualified `t.c` names are
/// quoted per part.
pub fn quote_identifier(kind: Kind, name: &str) -> String {
    if name == "*" || name.contains('(') {
        return name.to_owned();
    }
    let q = kind.quote_char();
    name.split('.')
        .map(|part| {
            if part == "*" || (part.starts_with(q) && part.ends_with(q)) {
                part.to_owned()
            } else {
                format!("{q}{part}{q}")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Outcome of a non-SELECT statement.
#[derive(Debug, Clone, Copy)]
pub struct Exec {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

#[derive(Clone)]
pub struct Driver {
    pool: AnyPool,
    kind: Kind,
}

impl Driver {
    /// Connects a pool to `uri`. SQLite sessions run with WAL journaling.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, DriverError> {
        let is_sqlite = uri.starts_with("sqlite");
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_sqlite {
                        conn.execute("PRAGMA journal_mode=WAL;").await?;
                    }
                    Ok(())
                })
            })
            .connect(uri)
            .await
            .map_err(|e| DriverError::Connection(format!("{uri}: {e}")))?;
        let kind = match pool.any_kind() {
            AnyKind::Postgres => Kind::Postgres,
            AnyKind::Sqlite => Kind::Sqlite,
        };
        Ok(Self { pool, kind })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn prepare(&self, sql: impl Into<String>) -> Statement {
        Statement {
            pool: self.pool.clone(),
            kind: self.kind,
            sql: sql.into(),
            params: IndexMap::new(),
        }
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(self.kind, name)
    }

    /// Runs one statement without placeholders; setup and teardown path.
    pub async fn execute_raw(&self, sql: &str) -> Result<u64, DriverError> {
        let done = sqlx::query::<Any>(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| DriverError::Execute(e.to_string()))?;
        Ok(done.rows_affected())
    }
}

/// A parameterised statement bound to one pool.
pub struct Statement {
    pool: AnyPool,
    kind: Kind,
    sql: String,
    params: IndexMap<String, Value>,
}

impl Statement {
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn bind_all(&mut self, params: impl IntoIterator<Item = (String, Value)>) -> &mut Self {
        for (name, value) in params {
            self.params.insert(name, value);
        }
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Expands `:name` placeholders to the backend's positional form and
    /// returns the values in placeholder order.
    fn expand(&self) -> Result<(String, Vec<Value>), DriverError> {
        let src: Vec<char> = self.sql.chars().collect();
        let mut out = String::with_capacity(self.sql.len());
        let mut args = Vec::new();
        let mut i = 0;
        while i < src.len() {
            let c = src[i];
            match c {
                '\'' | '"' | '`' => {
                    // Copy quoted runs untouched.
                    out.push(c);
                    i += 1;
                    while i < src.len() {
                        out.push(src[i]);
                        if src[i] == c {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                    if i >= src.len() && !out.ends_with(c) {
                        return Err(DriverError::Prepare(format!(
                            "unterminated {c} quote in `{}`",
                            self.sql
                        )));
                    }
                }
                ':' => {
                    let prev_colon = i > 0 && src[i - 1] == ':';
                    let starts_ident = src
                        .get(i + 1)
                        .map(|n| n.is_ascii_alphabetic() || *n == '_')
                        .unwrap_or(false);
                    if prev_colon || !starts_ident {
                        out.push(c);
                        i += 1;
                        continue;
                    }
                    let mut j = i + 1;
                    while j < src.len() && (src[j].is_ascii_alphanumeric() || src[j] == '_') {
                        j += 1;
                    }
                    let name: String = src[i + 1..j].iter().collect();
                    let value = self
                        .params
                        .get(&name)
                        .ok_or_else(|| DriverError::Bind(name.clone()))?;
                    args.push(value.clone());
                    match self.kind {
                        Kind::Postgres => {
                            out.push('$');
                            out.push_str(&args.len().to_string());
                        }
                        Kind::Sqlite | Kind::Mysql => out.push('?'),
                    }
                    i = j;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        Ok((out, args))
    }

    pub async fn execute(&self) -> Result<Exec, DriverError> {
        let (sql, args) = self.expand()?;
        let mut query = sqlx::query::<Any>(&sql);
        for arg in &args {
            query = bind_value(query, arg.clone());
        }
        let done = query
            .execute(&self.pool)
            .await
            .map_err(|e| DriverError::Execute(e.to_string()))?;
        Ok(Exec {
            rows_affected: done.rows_affected(),
            last_insert_id: done.last_insert_id(),
        })
    }

    pub async fn fetch_all(&self) -> Result<Vec<Row>, DriverError> {
        let (sql, args) = self.expand()?;
        let mut query = sqlx::query::<Any>(&sql);
        for arg in &args {
            query = bind_value(query, arg.clone());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DriverError::Execute(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn fetch_one(&self) -> Result<Option<Row>, DriverError> {
        let (sql, args) = self.expand()?;
        let mut query = sqlx::query::<Any>(&sql);
        for arg in &args {
            query = bind_value(query, arg.clone());
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DriverError::Execute(e.to_string()))?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Lazily streams rows as they arrive from the backend.
    pub fn fetch(&self) -> Result<RowStream, DriverError> {
        let (sql, args) = self.expand()?;
        let rows = OwnedRows::spawn(self.pool.clone(), sql, args);
        Ok(rows
            .map(|r| {
                r.map_err(|e| DriverError::Execute(e.to_string()))
                    .and_then(|row| decode_row(&row))
            })
            .boxed_local())
    }
}

/// Keeps the query text and pool alive next to the sqlx stream that borrows
/// them. Both live behind stable heap pointers, so moving the struct does
/// not invalidate the borrows; the stream field is declared first and drops
/// first.
struct OwnedRows {
    stream: BoxStream<'static, Result<AnyRow, sqlx::Error>>,
    #[allow(dead_code)]
    sql: Box<str>,
    #[allow(dead_code)]
    pool: Box<AnyPool>,
}

impl OwnedRows {
    fn spawn(pool: AnyPool, sql: String, args: Vec<Value>) -> Self {
        let sql: Box<str> = sql.into_boxed_str();
        let pool = Box::new(pool);
        // The boxed string and pool will not move anymore.
        let sql_ref: &'static str = unsafe { &*(sql.as_ref() as *const str) };
        let pool_ref: &'static AnyPool = unsafe { &*(pool.as_ref() as *const AnyPool) };
        let mut query = sqlx::query::<Any>(sql_ref);
        for arg in args {
            query = bind_value(query, arg);
        }
        let stream = query.fetch(pool_ref);
        Self { stream, sql, pool }
    }
}

impl Stream for OwnedRows {
    type Item = Result<AnyRow, sqlx::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.poll_next_unpin(cx)
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Any, AnyArguments<'q>>,
    value: Value,
) -> sqlx::query::Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(v) => query.bind(v),
        Value::Int(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::String(v) => query.bind(v),
        Value::DateTime(v) => query.bind(v.to_rfc3339()),
        Value::Json(v) => query.bind(v.to_string()),
    }
}

fn decode_row(row: &AnyRow) -> Result<Row, DriverError> {
    let mut out = IndexMap::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_owned(), decode_value(row, i)?);
    }
    Ok(out)
}

/// Decodes one cell without type metadata from the caller: null probe
/// first, then the scalar decodings the backends agree on.
fn decode_value(row: &AnyRow, index: usize) -> Result<Value, DriverError> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| DriverError::Execute(e.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<i32, _>(index) {
        return Ok(Value::Int(v as i64));
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(Value::Float(v));
    }
    if let Ok(v) = row.try_get::<f32, _>(index) {
        return Ok(Value::Float(v as f64));
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Ok(Value::Bool(v));
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(Value::String(v));
    }
    Err(DriverError::Execute(format!(
        "cannot decode column {index} of the result row"
    )))
}
