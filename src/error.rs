pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the driver layer. Execution errors carry the message
/// reported by the underlying database library.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error["failed to connect: {0}"]]
    Connection(String),
    #[error["failed to prepare statement: {0}"]]
    Prepare(String),
    #[error["missing or invalid binding for placeholder `{0}`"]]
    Bind(String),
    #[error["failed to execute statement: {0}"]]
    Execute(String),
}

/// Errors surfaced by the mapping core. Driver failures are wrapped together
/// with the statement that triggered them.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error["invalid entity descriptor: {0}"]]
    InvalidEntity(String),
    #[error["no entity registered under `{0}`"]]
    UnknownEntity(String),
    #[error["cannot {op} `{entity}` without a primary key value"]]
    MissingIdentifier { entity: String, op: &'static str },
    #[error["database error while running `{statement}`: {source}"]]
    Db {
        statement: String,
        #[source]
        source: DriverError,
    },
    #[error["hydration failed: {0}"]]
    Hydration(String),
    #[error["cannot order mutations: {0}"]]
    CascadeCycle(String),
}

impl Error {
    pub(crate) fn db(statement: impl Into<String>, source: DriverError) -> Self {
        Error::Db {
            statement: statement.into(),
            source,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidEntity(msg.into())
    }

    pub(crate) fn hydration(msg: impl Into<String>) -> Self {
        Error::Hydration(msg.into())
    }
}
