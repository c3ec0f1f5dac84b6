//! Tailing the source oplog.
//!
//! The tailer opens a tailable-await cursor on `local.oplog.rs` so the server blocks until new
//! entries arrive and streams them in oplog order. Entries produced by chunk migration
//! (`fromMigrate`) are excluded server-side; they replay through the destination shard's own
//! oplog and must not be bridged twice.

use crate::oper::Operation;
use crate::Result;
use mongodb::bson::{doc, Document, Timestamp};
use futures::ready;
use futures::Stream;
use mongodb::options::{CursorType, FindOptions};
use mongodb::{Client, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};

type NamespacePredicate = Box<dyn Fn(&str) -> bool + Send + Sync + 'static>;

/// Oplog represents a tailable cursor over a MongoDB replica set oplog.
///
/// It implements the `Stream` trait so it can be iterated over, yielding successive
/// `Operation`s as they are read from the server. This will effectively iterate forever as it
/// will await new operations.
///
/// Any errors raised while tailing the oplog (e.g. a connectivity issue) will cause the
/// iteration to end. Callers resume by building a new `Oplog` starting at the last applied
/// timestamp; entries re-read at the boundary are absorbed by the idempotent converted writes.
pub struct Oplog {
    /// The internal MongoDB cursor for the current position in the oplog.
    cursor: Cursor<Document>,
    /// Optional namespace predicate; entries it rejects are skipped before parsing.
    ns_filter: Option<NamespacePredicate>,
}

impl Oplog {
    /// Creates an instance with default options, tailing from the start of the retained oplog.
    pub async fn new(client: &Client) -> Result<Oplog> {
        OplogBuilder::new().build(client).await
    }

    /// Builder to configure the Oplog.
    pub fn builder() -> OplogBuilder {
        OplogBuilder::new()
    }
}

impl Stream for Oplog {
    type Item = Result<Operation>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match ready!(Pin::new(&mut this.cursor).poll_next(cx)) {
                Some(Ok(document)) => {
                    if let Some(filter) = &this.ns_filter {
                        match document.get_str("ns") {
                            Ok(ns) if !filter(ns) => continue,
                            _ => {}
                        }
                    }
                    return Poll::Ready(Some(Operation::new(&document)));
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                // Underlying cursor is over. This probably indicates that the oplog.rs
                // collection is empty. See https://jira.mongodb.org/browse/SERVER-13955
                None => return Poll::Ready(None),
            }
        }
    }
}

/// A builder for an `Oplog`.
///
/// This builder enables configuring a resume position and a namespace filter so that only
/// operations matching a given criteria are returned.
#[derive(Default)]
pub struct OplogBuilder {
    start: Option<Timestamp>,
    ns_filter: Option<NamespacePredicate>,
    batch_size: Option<u32>,
}

impl OplogBuilder {
    pub(crate) fn new() -> OplogBuilder {
        OplogBuilder::default()
    }

    /// Tail from the given timestamp (inclusive) instead of the start of the retained oplog.
    ///
    /// This is the resume marker: entries with `ts >= start` are yielded. The entry at the
    /// marker itself is typically already applied and replays as a no-op.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mongodb::Client;
    /// use mongorelay::bson::Timestamp;
    /// use mongorelay::Oplog;
    ///
    /// # async fn run() -> Result<(), mongorelay::Error> {
    /// let client = Client::with_uri_str("mongodb://localhost").await?;
    ///
    /// let mut oplog = Oplog::builder()
    ///     .start_at(Timestamp { time: 1479561394, increment: 0 })
    ///     .build(&client)
    ///     .await?;
    ///
    /// # Ok(())
    /// # }
    /// ```
    pub fn start_at(mut self, start: Timestamp) -> Self {
        self.start = Some(start);
        self
    }

    /// Provide an optional namespace predicate.
    ///
    /// Entries whose namespace the predicate rejects are dropped by the tailer without being
    /// parsed. All namespaces are accepted by default.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mongodb::Client;
    /// use mongorelay::Oplog;
    ///
    /// # async fn run() -> Result<(), mongorelay::Error> {
    /// let client = Client::with_uri_str("mongodb://localhost").await?;
    ///
    /// let mut oplog = Oplog::builder()
    ///     .ns_filter(|ns| !ns.starts_with("scratch."))
    ///     .build(&client)
    ///     .await?;
    ///
    /// # Ok(())
    /// # }
    /// ```
    pub fn ns_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.ns_filter = Some(Box::new(filter));
        self
    }

    /// Set `batch_size` option on the underlying mongodb cursor.
    ///
    /// Default this is not set and falls back on whatever the default is.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Executes the query and builds the `Oplog` over the client provided.
    pub async fn build(self, client: &Client) -> Result<Oplog> {
        let coll = client
            .database("local")
            .collection::<Document>("oplog.rs");

        let opts = FindOptions::builder()
            .no_cursor_timeout(true)
            .cursor_type(CursorType::TailableAwait)
            .batch_size(self.batch_size)
            .build();

        let cursor = coll.find(filter_document(self.start), opts).await?;

        Ok(Oplog {
            cursor,
            ns_filter: self.ns_filter,
        })
    }
}

fn filter_document(start: Option<Timestamp>) -> Document {
    let mut filter = doc! { "fromMigrate": { "$exists": false } };
    if let Some(start) = start {
        filter.insert("ts", doc! { "$gte": start });
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;

    #[test]
    fn filter_excludes_migration_entries() {
        let filter = filter_document(None);

        assert_eq!(filter, doc! { "fromMigrate": { "$exists": false } });
    }

    #[test]
    fn filter_resumes_from_the_given_timestamp() {
        let start = Timestamp {
            time: 1479561394,
            increment: 7,
        };
        let filter = filter_document(Some(start));

        assert_eq!(
            filter,
            doc! {
                "fromMigrate": { "$exists": false },
                "ts": { "$gte": Bson::Timestamp(start) },
            }
        );
    }
}
