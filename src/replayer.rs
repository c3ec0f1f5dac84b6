//! Concurrent oplog replay.
//!
//! The replayer buffers operations between flushes, grouped by namespace in arrival order. On
//! a flush, each namespace bucket is partitioned into lanes by hashing the `_id` of every
//! operation, so operations for the same document always share a lane and keep their source
//! order while distinct documents spread across lanes and overlap their round-trips to the
//! destination. Lanes are written by a bounded pool of concurrent bulk writes.
//!
//! Ordering follows from the partition: strict per `_id`, unordered across documents within a
//! flush, strict across flushes (a flush completes entirely before the next begins).

use crate::oper::{split_namespace, Operation, WriteOp};
use crate::{Error, Handler, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::{Bson, Timestamp};
use murmur3::murmur3_32;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Instant;
use tracing::debug;

/// Default bound on concurrent bulk writes.
pub const DEFAULT_WRITERS: usize = 10;

/// Default number of operations per bulk write batch, an empiric value.
pub const DEFAULT_BATCH_SIZE: usize = 40;

/// A namespace-bucketing, `_id`-sharding, batching dispatcher for oplog operations.
///
/// Only operations with a batchable conversion may be pushed; commands and index inserts
/// serialize a flush and go through [`Handler::apply`] instead (see
/// [`Operation::is_command`]).
pub struct Replayer {
    n_writers: usize,
    batch_size: usize,
    buckets: HashMap<String, Vec<Operation>>,
    count: usize,
    last_optime: Option<Timestamp>,
    last_apply_time: Instant,
}

impl Replayer {
    /// A replayer with the default worker and batch size limits.
    pub fn new() -> Replayer {
        Replayer::with_limits(DEFAULT_WRITERS, DEFAULT_BATCH_SIZE)
    }

    /// A replayer writing with at most `n_writers` concurrent bulk writes of at most
    /// `batch_size` operations each.
    pub fn with_limits(n_writers: usize, batch_size: usize) -> Replayer {
        assert!(n_writers > 0);
        assert!(batch_size > 0);

        Replayer {
            n_writers,
            batch_size,
            buckets: HashMap::new(),
            count: 0,
            last_optime: None,
            last_apply_time: Instant::now(),
        }
    }

    /// Buffer an operation in its namespace bucket, in arrival order.
    pub fn push(&mut self, operation: Operation) {
        self.last_optime = Some(operation.timestamp());
        let ns = operation.namespace().map(str::to_owned);
        if let Some(ns) = ns {
            self.buckets.entry(ns).or_insert_with(Vec::new).push(operation);
            self.count += 1;
        }
    }

    /// Count of buffered operations.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The namespaces with buffered operations.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    /// Drop all buffered operations.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.count = 0;
    }

    /// The timestamp of the last pushed operation.
    ///
    /// This is the in-memory high-water mark. It is safe to persist as the durable resume
    /// marker only once [`apply`](Replayer::apply) has returned success for everything pushed
    /// before it.
    pub fn last_optime(&self) -> Option<Timestamp> {
        self.last_optime
    }

    /// When the last flush completed.
    pub fn last_apply_time(&self) -> Instant {
        self.last_apply_time
    }

    /// Flush all buffered operations to the destination.
    ///
    /// Buckets are converted and partitioned into lanes, and every non-empty lane becomes one
    /// bulk write. At most `n_writers` writes are in flight at once; the flush completes only
    /// when all of them have. The first unrecoverable write error aborts the flush.
    pub async fn apply(&mut self, handler: &Handler, ignore_dup_key: bool) -> Result<()> {
        let mut tasks: Vec<(String, String, Vec<WriteOp>)> = Vec::new();
        for (ns, ops) in &self.buckets {
            let (db, coll) = split_namespace(ns)?;
            for lane in lanes(ops, self.batch_size)? {
                if !lane.is_empty() {
                    tasks.push((db.to_owned(), coll.to_owned(), lane));
                }
            }
        }

        debug!(operations = self.count, lanes = tasks.len(), "flushing");

        stream::iter(tasks)
            .map(Ok)
            .try_for_each_concurrent(self.n_writers, |(db, coll, ops)| async move {
                handler.bulk_write(&db, &coll, &ops, true, ignore_dup_key).await
            })
            .await?;

        self.last_apply_time = Instant::now();
        Ok(())
    }
}

impl Default for Replayer {
    fn default() -> Replayer {
        Replayer::new()
    }
}

/// Partition a namespace bucket into `len / batch_size + 1` lanes of converted writes.
///
/// With a single lane the bucket keeps its order as-is. With more, each write goes to the
/// lane selected by its `_id` hash, so writes to the same document stay ordered relative to
/// each other no matter how the lanes are scheduled.
fn lanes(ops: &[Operation], batch_size: usize) -> Result<Vec<Vec<WriteOp>>> {
    let n = ops.len() / batch_size + 1;
    let mut lanes = vec![Vec::new(); n];

    for op in ops {
        let write = op
            .write_op()?
            .ok_or_else(|| Error::Unbatchable(op.to_string()))?;
        let lane = if n == 1 { 0 } else { lane_of(write.id(), n) };
        lanes[lane].push(write);
    }

    Ok(lanes)
}

/// The lane for a given `_id`, a pure function of the id and the lane count.
fn lane_of(id: Option<&Bson>, n: usize) -> usize {
    let id = match id {
        Some(id) => id.to_string(),
        None => return 0,
    };
    // Hashing cannot realistically fail over an in-memory buffer; lane 0 keeps the partition
    // deterministic if it ever does.
    let hash = murmur3_32(&mut Cursor::new(id.as_bytes()), 0).unwrap_or(0);
    hash as usize % n
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    fn update(id: i32, time: u32) -> Operation {
        Operation::Update {
            timestamp: ts(time),
            namespace: "d.c".into(),
            query: doc! { "_id": id },
            update: doc! { "$set": { "n": time as i64 } },
        }
    }

    #[test]
    fn small_bucket_keeps_one_lane_in_source_order() {
        let ops: Vec<_> = (0..40).map(|i| update(i, i as u32)).collect();

        let lanes = lanes(&ops, DEFAULT_BATCH_SIZE).unwrap();

        assert_eq!(lanes.len(), 1);
        let ids: Vec<_> = lanes[0]
            .iter()
            .map(|op| op.id().unwrap().as_i32().unwrap())
            .collect();
        assert_eq!(ids, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn bucket_one_over_the_batch_size_splits_into_two_lanes() {
        let ops: Vec<_> = (0..41).map(|i| update(i, i as u32)).collect();

        let lanes = lanes(&ops, DEFAULT_BATCH_SIZE).unwrap();

        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes.iter().map(Vec::len).sum::<usize>(), 41);
    }

    #[test]
    fn same_id_always_lands_in_the_same_lane() {
        // 160 operations over 80 distinct ids, so each id appears twice across 5 lanes.
        let mut ops = Vec::new();
        for round in 0..2u32 {
            for id in 0..80 {
                ops.push(update(id, round * 80 + id as u32));
            }
        }

        let lanes = lanes(&ops, DEFAULT_BATCH_SIZE).unwrap();

        assert_eq!(lanes.len(), 5);
        let mut seen = HashMap::new();
        for (lane, writes) in lanes.iter().enumerate() {
            for write in writes {
                let id = write.id().unwrap().as_i32().unwrap();
                assert_eq!(*seen.entry(id).or_insert(lane), lane);
            }
        }
        assert_eq!(seen.len(), 80);
    }

    #[test]
    fn partition_is_stable_across_runs() {
        let ops: Vec<_> = (0..100).map(|i| update(i, i as u32)).collect();

        assert_eq!(lanes(&ops, 10).unwrap(), lanes(&ops, 10).unwrap());
    }

    #[test]
    fn commands_are_rejected_from_the_bulk_path() {
        let ops = vec![Operation::Command {
            timestamp: ts(1),
            namespace: "d.$cmd".into(),
            command: doc! { "drop": "c" },
        }];

        match lanes(&ops, DEFAULT_BATCH_SIZE) {
            Err(Error::Unbatchable(_)) => {}
            other => panic!("expected Unbatchable, got {:?}", other.map(|l| l.len())),
        }
    }

    #[test]
    fn push_buckets_by_namespace_in_arrival_order() {
        let mut replayer = Replayer::new();
        replayer.push(Operation::Insert {
            timestamp: ts(1),
            namespace: "a.x".into(),
            document: doc! { "_id": 1 },
        });
        replayer.push(Operation::Insert {
            timestamp: ts(2),
            namespace: "a.x".into(),
            document: doc! { "_id": 2 },
        });
        replayer.push(Operation::Insert {
            timestamp: ts(3),
            namespace: "b.y".into(),
            document: doc! { "_id": 1 },
        });

        assert_eq!(replayer.count(), 3);
        let mut namespaces: Vec<_> = replayer.namespaces().collect();
        namespaces.sort_unstable();
        assert_eq!(namespaces, vec!["a.x", "b.y"]);

        replayer.clear();
        assert!(replayer.is_empty());
        assert_eq!(replayer.namespaces().count(), 0);
    }

    #[test]
    fn last_optime_tracks_the_latest_push() {
        let mut replayer = Replayer::new();
        assert_eq!(replayer.last_optime(), None);

        for time in 1..=3 {
            replayer.push(update(1, time));
            assert_eq!(replayer.last_optime(), Some(ts(time)));
        }
    }
}
