use mongodb::bson;
use std::fmt;

/// A type alias for convenience so we can fix the error to our own `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error enumerates the list of possible error conditions when tailing and replaying an oplog.
#[derive(Debug)]
pub enum Error {
    /// A database connectivity error raised by the MongoDB driver.
    Database(mongodb::error::Error),
    /// An error when converting a BSON document to an `Operation` and it has a missing field or
    /// unexpected type.
    MissingField(bson::document::ValueAccessError),
    /// An error when converting a BSON document to an `Operation` and it has an unsupported
    /// operation type.
    UnknownOperation(String),
    /// A namespace that is not of the `db.collection` form.
    InvalidNamespace(String),
    /// A write was rejected because a document with the same `_id` already exists and the caller
    /// did not ask for duplicate key errors to be ignored.
    DuplicateKey(String),
    /// An operation that must be applied sequentially (a command or an index insert) was found in
    /// the bulk replay path.
    Unbatchable(String),
    /// The replica set has no reachable primary.
    NoPrimary,
    /// A write failed in a way the replay engine cannot recover from. The destination must be
    /// inspected before replay is restarted from the last applied timestamp.
    FatalWrite(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::MissingField(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Database(ref err) => err.fmt(f),
            Error::MissingField(ref err) => err.fmt(f),
            Error::UnknownOperation(ref op) => write!(f, "Unknown operation type found: {}", op),
            Error::InvalidNamespace(ref ns) => write!(f, "Invalid namespace: {}", ns),
            Error::DuplicateKey(ref msg) => write!(f, "Duplicate key: {}", msg),
            Error::Unbatchable(ref op) => write!(f, "Operation cannot be batched: {}", op),
            Error::NoPrimary => write!(f, "No primary in replica set"),
            Error::FatalWrite(ref msg) => write!(f, "Unrecoverable write failure: {}", msg),
        }
    }
}

impl From<bson::document::ValueAccessError> for Error {
    fn from(original: bson::document::ValueAccessError) -> Error {
        Error::MissingField(original)
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(original: mongodb::error::Error) -> Error {
        Error::Database(original)
    }
}
