//! The operation module is responsible for converting raw MongoDB oplog documents into
//! statically typed `Operation`s, one variant for each type of entry stored in the oplog, and
//! for converting those operations into the idempotent `WriteOp`s the bulk replay path sends to
//! the destination.
//!
//! Raw timestamps are kept as BSON timestamps rather than converted to UTC datetimes because
//! they are the replay resume marker and must round-trip to the server losslessly. Payload
//! documents keep their key order (BSON documents are insertion ordered) because command
//! documents are position sensitive.
//!
//! As we accept _any_ document, it may not be a valid operation so wrap any conversions in a
//! `Result`.

use std::fmt;

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{self, doc, Document, Timestamp};

/// A MongoDB oplog operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// A no-op as inserted periodically by MongoDB or used to initiate new replica sets.
    Noop {
        /// The time of the operation.
        timestamp: Timestamp,
        /// The message associated with this operation.
        message: Option<String>,
    },
    /// An insert of a document into a specific database and collection.
    Insert {
        /// The time of the operation.
        timestamp: Timestamp,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON document inserted into the namespace.
        document: Document,
    },
    /// An update of a document in a specific database and collection matching a given query.
    Update {
        /// The time of the operation.
        timestamp: Timestamp,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON selection criteria for the update.
        query: Document,
        /// The BSON update applied in this operation. Either an update operator document (its
        /// top-level keys begin with `$`) or a full replacement document.
        update: Document,
    },
    /// The deletion of a document in a specific database and collection matching a given query.
    Delete {
        /// The time of the operation.
        timestamp: Timestamp,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON selection criteria for the delete.
        query: Document,
    },
    /// A command such as the creation or deletion of a collection.
    Command {
        /// The time of the operation.
        timestamp: Timestamp,
        /// The full namespace of the operation including its database and collection.
        namespace: String,
        /// The BSON command.
        command: Document,
    },
}

/// An idempotent write against the destination, produced from a single oplog operation.
///
/// Every filter has `_id` as its sole key. This makes replaying the same operation twice a
/// no-op and lets the replayer shard operations by `_id` hash without breaking per-document
/// order.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Replace the document with a matching `_id`, inserting it if absent.
    Replace {
        /// The `_id` filter.
        filter: Document,
        /// The full replacement document.
        document: Document,
    },
    /// Apply an update operator document to the document with a matching `_id`.
    Update {
        /// The `_id` filter.
        filter: Document,
        /// The update operator document.
        update: Document,
    },
    /// Delete the document with a matching `_id`.
    Delete {
        /// The `_id` filter.
        filter: Document,
    },
}

impl WriteOp {
    /// The `_id`-only filter this write targets.
    pub fn filter(&self) -> &Document {
        match self {
            WriteOp::Replace { filter, .. } => filter,
            WriteOp::Update { filter, .. } => filter,
            WriteOp::Delete { filter } => filter,
        }
    }

    /// The `_id` this write targets.
    pub fn id(&self) -> Option<&bson::Bson> {
        self.filter().get("_id")
    }
}

impl Operation {
    /// Try to create a new Operation from a BSON document.
    ///
    /// # Example
    ///
    /// ```
    /// use mongorelay::bson::{self, doc, Bson};
    /// use mongorelay::Operation;
    ///
    /// # fn main() {
    /// let document = doc! {
    ///     "ts": Bson::Timestamp(bson::Timestamp {
    ///         time: 1479561394,
    ///         increment: 0,
    ///     }),
    ///     "v": 2,
    ///     "op": "i",
    ///     "ns": "foo.bar",
    ///     "o": {
    ///         "foo": "bar"
    ///     }
    /// };
    /// let operation = Operation::new(&document);
    /// # }
    /// ```
    pub fn new(document: &Document) -> Result<Operation> {
        let op = document.get_str("op")?;

        match op {
            "n" => Operation::from_noop(document),
            "i" => Operation::from_insert(document),
            "u" => Operation::from_update(document),
            "d" => Operation::from_delete(document),
            "c" => Operation::from_command(document),
            op => Err(Error::UnknownOperation(op.into())),
        }
    }

    /// Returns a no-op operation for a given document.
    fn from_noop(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        // We don't always get a document in "o"
        let message = document
            .get("o")
            .and_then(|d| d.as_document())
            .and_then(|d| d.get("msg"))
            .and_then(|d| d.as_str())
            .map(|s| s.to_string());

        Ok(Operation::Noop {
            timestamp: ts,
            message,
        })
    }

    /// Return an insert operation for a given document.
    fn from_insert(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        Ok(Operation::Insert {
            timestamp: ts,
            namespace: ns.into(),
            document: o.to_owned(),
        })
    }

    /// Return an update operation for a given document.
    fn from_update(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;
        let o2 = document.get_document("o2")?;

        Ok(Operation::Update {
            timestamp: ts,
            namespace: ns.into(),
            query: o2.to_owned(),
            update: o.to_owned(),
        })
    }

    /// Return a delete operation for a given document.
    fn from_delete(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        Ok(Operation::Delete {
            timestamp: ts,
            namespace: ns.into(),
            query: o.to_owned(),
        })
    }

    /// Return a command operation for a given document.
    fn from_command(document: &Document) -> Result<Operation> {
        let ts = document.get_timestamp("ts")?;
        let ns = document.get_str("ns")?;
        let o = document.get_document("o")?;

        Ok(Operation::Command {
            timestamp: ts,
            namespace: ns.into(),
            command: o.to_owned(),
        })
    }

    /// The time of the operation, as recorded in the source oplog.
    pub fn timestamp(&self) -> Timestamp {
        match *self {
            Operation::Noop { timestamp, .. } => timestamp,
            Operation::Insert { timestamp, .. } => timestamp,
            Operation::Update { timestamp, .. } => timestamp,
            Operation::Delete { timestamp, .. } => timestamp,
            Operation::Command { timestamp, .. } => timestamp,
        }
    }

    /// The namespace the operation applies to, or `None` for no-ops.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Operation::Noop { .. } => None,
            Operation::Insert { namespace, .. } => Some(namespace),
            Operation::Update { namespace, .. } => Some(namespace),
            Operation::Delete { namespace, .. } => Some(namespace),
            Operation::Command { namespace, .. } => Some(namespace),
        }
    }

    /// Whether the operation must be applied on the sequential path rather than batched.
    ///
    /// True for commands and for inserts without an `_id` (legacy index builds insert into
    /// `*.system.indexes` without one). Both serialize a flush: the caller must drain the
    /// replayer before applying them via [`Handler::apply`](crate::Handler::apply).
    pub fn is_command(&self) -> bool {
        match self {
            Operation::Command { .. } => true,
            Operation::Insert { document, .. } => !document.contains_key("_id"),
            _ => false,
        }
    }

    /// Convert the operation into the idempotent write the bulk path dispatches.
    ///
    /// Returns `None` for operations that bypass the bulk path: no-ops, commands and index
    /// inserts. Inserts become replace-with-upsert so that replaying an entry that was already
    /// applied converges instead of failing. Update entries are narrowed to an `_id`-only
    /// filter, and the `$v` protocol versioning field the source server attaches is stripped so
    /// the destination does not reject the update document.
    pub fn write_op(&self) -> Result<Option<WriteOp>> {
        match self {
            Operation::Insert { document, .. } => match document.get("_id") {
                Some(id) => Ok(Some(WriteOp::Replace {
                    filter: doc! { "_id": id.clone() },
                    document: document.clone(),
                })),
                // An index build; applied sequentially through the handler.
                None => Ok(None),
            },
            Operation::Update { query, update, .. } => {
                let id = query
                    .get("_id")
                    .ok_or(Error::MissingField(
                        bson::document::ValueAccessError::NotPresent,
                    ))?
                    .clone();
                if update.keys().any(|key| key.starts_with('$')) {
                    let mut update = update.clone();
                    update.remove("$v");
                    Ok(Some(WriteOp::Update {
                        filter: doc! { "_id": id },
                        update,
                    }))
                } else {
                    // No update operators, so this is a full replacement document.
                    Ok(Some(WriteOp::Replace {
                        filter: doc! { "_id": id },
                        document: update.clone(),
                    }))
                }
            }
            Operation::Delete { query, .. } => {
                let id = query
                    .get("_id")
                    .ok_or(Error::MissingField(
                        bson::document::ValueAccessError::NotPresent,
                    ))?
                    .clone();
                Ok(Some(WriteOp::Delete {
                    filter: doc! { "_id": id },
                }))
            }
            Operation::Noop { .. } | Operation::Command { .. } => Ok(None),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Operation::Noop {
                timestamp,
                ref message,
            } => {
                write!(
                    f,
                    "No-op at {}: {:?}",
                    timestamp_to_datetime(timestamp),
                    message
                )
            }
            Operation::Insert {
                timestamp,
                ref namespace,
                ref document,
            } => {
                write!(
                    f,
                    "Insert into {} at {}: {}",
                    namespace,
                    timestamp_to_datetime(timestamp),
                    document
                )
            }
            Operation::Update {
                timestamp,
                ref namespace,
                ref query,
                ref update,
            } => {
                write!(
                    f,
                    "Update {} with {} at {}: {}",
                    namespace,
                    query,
                    timestamp_to_datetime(timestamp),
                    update
                )
            }
            Operation::Delete {
                timestamp,
                ref namespace,
                ref query,
            } => {
                write!(
                    f,
                    "Delete from {} at {}: {}",
                    namespace,
                    timestamp_to_datetime(timestamp),
                    query
                )
            }
            Operation::Command {
                timestamp,
                ref namespace,
                ref command,
            } => {
                write!(
                    f,
                    "Command {} at {}: {}",
                    namespace,
                    timestamp_to_datetime(timestamp),
                    command
                )
            }
        }
    }
}

/// Split a `db.collection` namespace on the first dot only.
pub(crate) fn split_namespace(ns: &str) -> Result<(&str, &str)> {
    let mut parts = ns.splitn(2, '.');
    match (parts.next(), parts.next()) {
        (Some(db), Some(coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(Error::InvalidNamespace(ns.to_owned())),
    }
}

/// Convert a BSON timestamp into a UTC `DateTime` for display.
fn timestamp_to_datetime(timestamp: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(i64::from(timestamp.time), 0)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    #[test]
    fn operation_converts_noops() {
        let doc = doc! {
            "ts" : Bson::Timestamp(ts(1479419535)),
            "v" : 2,
            "op" : "n",
            "ns" : "",
            "o" : {
                "msg" : "initiating set"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Noop {
                timestamp: ts(1479419535),
                message: Some("initiating set".into()),
            }
        );
        assert_eq!(operation.namespace(), None);
    }

    #[test]
    fn operation_converts_inserts() {
        let doc = doc! {
            "ts" : Bson::Timestamp(ts(1479561394)),
            "v" : 2,
            "op" : "i",
            "ns" : "foo.bar",
            "o" : {
                "_id" : 7,
                "foo" : "bar"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Insert {
                timestamp: ts(1479561394),
                namespace: "foo.bar".into(),
                document: doc! { "_id" : 7, "foo" : "bar" },
            }
        );
    }

    #[test]
    fn operation_converts_updates() {
        let doc = doc! {
            "ts" : Bson::Timestamp(ts(1479561033)),
            "v" : 2,
            "op" : "u",
            "ns" : "foo.bar",
            "o2" : {
                "_id" : 1
            },
            "o" : {
                "$set" : {
                    "foo" : "baz"
                }
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Update {
                timestamp: ts(1479561033),
                namespace: "foo.bar".into(),
                query: doc! { "_id" : 1 },
                update: doc! { "$set" : { "foo" : "baz" } },
            }
        );
    }

    #[test]
    fn operation_converts_deletes() {
        let doc = doc! {
            "ts" : Bson::Timestamp(ts(1479421186)),
            "v" : 2,
            "op" : "d",
            "ns" : "foo.bar",
            "o" : {
                "_id" : 1
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Delete {
                timestamp: ts(1479421186),
                namespace: "foo.bar".into(),
                query: doc! { "_id" : 1 },
            }
        );
    }

    #[test]
    fn operation_converts_commands() {
        let doc = doc! {
            "ts" : Bson::Timestamp(ts(1479553955)),
            "v" : 2,
            "op" : "c",
            "ns" : "test.$cmd",
            "o" : {
                "create" : "foo"
            }
        };
        let operation = Operation::new(&doc).unwrap();

        assert_eq!(
            operation,
            Operation::Command {
                timestamp: ts(1479553955),
                namespace: "test.$cmd".into(),
                command: doc! { "create" : "foo" },
            }
        );
        assert!(operation.is_command());
    }

    #[test]
    fn operation_returns_unknown_operations() {
        let doc = doc! { "op" : "x" };
        let operation = Operation::new(&doc);

        match operation {
            Err(Error::UnknownOperation(op)) => assert_eq!(op, "x"),
            _ => panic!("Expected unknown operation."),
        }
    }

    #[test]
    fn operation_returns_missing_fields() {
        use mongodb::bson::document::ValueAccessError;

        let doc = doc! { "foo" : "bar" };
        let operation = Operation::new(&doc);

        match operation {
            Err(Error::MissingField(err)) => assert_eq!(err, ValueAccessError::NotPresent),
            _ => panic!("Expected missing field."),
        }
    }

    #[test]
    fn insert_converts_to_replace_with_upsert() {
        let operation = Operation::Insert {
            timestamp: ts(1),
            namespace: "d.c".into(),
            document: doc! { "_id": 7, "x": "hi" },
        };

        assert_eq!(
            operation.write_op().unwrap(),
            Some(WriteOp::Replace {
                filter: doc! { "_id": 7 },
                document: doc! { "_id": 7, "x": "hi" },
            })
        );
    }

    #[test]
    fn insert_without_id_is_not_batchable() {
        let operation = Operation::Insert {
            timestamp: ts(1),
            namespace: "d.system.indexes".into(),
            document: doc! { "key": { "x": 1 }, "name": "x_1", "ns": "d.c" },
        };

        assert!(operation.is_command());
        assert_eq!(operation.write_op().unwrap(), None);
    }

    #[test]
    fn partial_update_strips_version_field() {
        let operation = Operation::Update {
            timestamp: ts(1),
            namespace: "d.c".into(),
            query: doc! { "_id": 1 },
            update: doc! { "$v": 1, "$set": { "a": 2 } },
        };

        assert_eq!(
            operation.write_op().unwrap(),
            Some(WriteOp::Update {
                filter: doc! { "_id": 1 },
                update: doc! { "$set": { "a": 2 } },
            })
        );
    }

    #[test]
    fn replacement_update_converts_to_replace_with_upsert() {
        let operation = Operation::Update {
            timestamp: ts(1),
            namespace: "d.c".into(),
            query: doc! { "_id": 1, "region": "eu" },
            update: doc! { "_id": 1, "a": 2 },
        };

        // The batched path narrows the filter to the _id alone.
        assert_eq!(
            operation.write_op().unwrap(),
            Some(WriteOp::Replace {
                filter: doc! { "_id": 1 },
                document: doc! { "_id": 1, "a": 2 },
            })
        );
    }

    #[test]
    fn delete_converts_to_delete_by_id() {
        let operation = Operation::Delete {
            timestamp: ts(1),
            namespace: "d.c".into(),
            query: doc! { "_id": 1 },
        };

        assert_eq!(
            operation.write_op().unwrap(),
            Some(WriteOp::Delete {
                filter: doc! { "_id": 1 },
            })
        );
    }

    #[test]
    fn commands_and_noops_bypass_conversion() {
        let command = Operation::Command {
            timestamp: ts(1),
            namespace: "d.$cmd".into(),
            command: doc! { "drop": "c" },
        };
        let noop = Operation::Noop {
            timestamp: ts(1),
            message: None,
        };

        assert_eq!(command.write_op().unwrap(), None);
        assert_eq!(noop.write_op().unwrap(), None);
        assert!(!noop.is_command());
    }

    #[test]
    fn splits_namespaces_on_the_first_dot_only() {
        assert_eq!(
            split_namespace("db.system.indexes").unwrap(),
            ("db", "system.indexes")
        );
        assert!(split_namespace("nodot").is_err());
        assert!(split_namespace(".coll").is_err());
    }
}
