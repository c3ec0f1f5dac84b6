#![warn(missing_docs)]

//! A library for replaying a MongoDB replica set oplog into another deployment.
//!
//! Given a source replica set and a destination replica set or sharded cluster, this crate
//! tails the source's oplog and applies its operations to the destination in near real time:
//!
//! - [`Oplog`] is a tailable-await cursor over the source oplog, resumable from a timestamp
//!   and iterated as a stream of statically typed [`Operation`]s.
//! - [`Replayer`] buffers operations by namespace, shards them into lanes by hashed `_id` and
//!   flushes them as concurrent bulk writes, preserving per-document order.
//! - [`Handler`] owns the connection to one endpoint and retries transiently failing writes
//!   until they stick.
//!
//! The replay loop itself belongs to the caller, which decides when to flush and persists the
//! resume marker (the last applied timestamp) after each successful flush. Operations for
//! which [`Operation::is_command`] is true cannot be batched; the caller flushes the replayer
//! and applies them through [`Handler::apply`] before buffering further entries.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use mongorelay::{cluster, EndpointConfig, Handler, Oplog, Replayer};
//!
//! # async fn run() -> Result<(), mongorelay::Error> {
//! let source = Handler::connect(EndpointConfig::new("source.example.com", 27017)).await?;
//! let destination = Handler::connect(EndpointConfig::new("dest.example.com", 27017)).await?;
//!
//! let start = cluster::primary_optime(&source.client().await).await?;
//! let mut oplog = Oplog::builder()
//!     .start_at(start)
//!     .build(&source.client().await)
//!     .await?;
//!
//! let mut replayer = Replayer::new();
//!
//! while let Some(res) = oplog.next().await {
//!     let oper = res?;
//!     if oper.is_command() {
//!         replayer.apply(&destination, true).await?;
//!         replayer.clear();
//!         destination.apply(&oper, true).await?;
//!         continue;
//!     }
//!     if oper.write_op()?.is_some() {
//!         replayer.push(oper);
//!     }
//!     if replayer.count() >= 1000 {
//!         replayer.apply(&destination, true).await?;
//!         replayer.clear();
//!         // replayer.last_optime() is now safe to persist as the resume marker.
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use mongodb;
pub use mongodb::bson;

pub mod cluster;
mod error;
mod handler;
mod oper;
mod replayer;
mod tailer;

pub use error::{Error, Result};
pub use handler::{EndpointConfig, Handler};
pub use oper::{Operation, WriteOp};
pub use replayer::{Replayer, DEFAULT_BATCH_SIZE, DEFAULT_WRITERS};
pub use tailer::{Oplog, OplogBuilder};
