//! Connection handling and the resilient write path.
//!
//! A [`Handler`] owns a live client to one MongoDB endpoint. Transient disconnects never
//! surface to callers: every operation wraps the driver call in a reconnect-and-retry loop.
//! Anything that is not a transient disconnect follows the per-operation policy described on
//! [`Handler::bulk_write`] and [`Handler::apply`].

use crate::oper::{split_namespace, Operation, WriteOp};
use crate::{cluster, Error, Result};
use mongodb::bson::{bson, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR};
use mongodb::options::{
    Acknowledgment, ClientOptions, Credential, IndexOptions, ReadPreference, ReplaceOptions,
    SelectionCriteria, ServerAddress, Tls, TlsOptions, WriteConcern,
};
use mongodb::{Client, IndexModel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Where and how to reach one MongoDB endpoint.
///
/// Replica set membership is not configured here; it is discovered from the endpoint itself
/// when the handler connects.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    authdb: String,
}

impl EndpointConfig {
    /// An endpoint without TLS or credentials. The authentication database defaults to `admin`.
    pub fn new(host: impl Into<String>, port: u16) -> EndpointConfig {
        EndpointConfig {
            host: host.into(),
            port,
            tls: false,
            username: None,
            password: None,
            authdb: "admin".into(),
        }
    }

    /// Enable or disable TLS.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Authenticate with the given username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Authenticate against the given database instead of `admin`.
    pub fn authdb(mut self, authdb: impl Into<String>) -> Self {
        self.authdb = authdb.into();
        self
    }
}

/// A live, validated connection to one MongoDB endpoint.
///
/// A handler is only ever observed in a connected state: [`Handler::connect`] validates the
/// client with `ismaster` before returning it, and [`Handler::reconnect`] loops until a fresh
/// client passes the same check before swapping it in. The underlying client is cheap to clone
/// and safe for concurrent use, so one handler is shared by all replay workers.
pub struct Handler {
    config: EndpointConfig,
    client: RwLock<Client>,
    mongos: AtomicBool,
}

impl Handler {
    /// Connect to the endpoint, in a single attempt.
    ///
    /// Probes the endpoint for a replica set name first so the final client routes to the
    /// PRIMARY, then validates it with `ismaster`. Server selection times out after three
    /// seconds; writes are acknowledged with `w=1`; reads go to the primary.
    pub async fn connect(config: EndpointConfig) -> Result<Handler> {
        let (client, mongos) = Self::establish(&config).await?;

        info!(host = %config.host, port = config.port, mongos, "connected");

        Ok(Handler {
            config,
            client: RwLock::new(client),
            mongos: AtomicBool::new(mongos),
        })
    }

    /// Tear down the current client and connect again, retrying every second until the new
    /// client answers `ismaster`. Never fails, only succeeds or keeps trying.
    pub async fn reconnect(&self) {
        loop {
            match Self::establish(&self.config).await {
                Ok((client, mongos)) => {
                    *self.client.write().await = client;
                    self.mongos.store(mongos, Ordering::Relaxed);
                    info!(host = %self.config.host, port = self.config.port, "reconnected");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "reconnect failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// A clone of the current client.
    pub async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    /// Whether the endpoint is a mongos router. Affects how shard key updates are replayed.
    pub fn is_mongos(&self) -> bool {
        self.mongos.load(Ordering::Relaxed)
    }

    async fn establish(config: &EndpointConfig) -> Result<(Client, bool)> {
        let probe = Self::open(config, None)?;
        let replica_set = cluster::replica_set_name(&probe).await?;
        let client = match replica_set {
            Some(name) => Self::open(config, Some(&name))?,
            None => probe,
        };

        let hello = client
            .database("admin")
            .run_command(doc! { "ismaster": 1 }, None)
            .await?;
        let mongos = hello.get_str("msg") == Ok("isdbgrid");

        Ok((client, mongos))
    }

    fn open(config: &EndpointConfig, replica_set: Option<&str>) -> Result<Client> {
        let mut options = ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: config.host.clone(),
                port: Some(config.port),
            }])
            .server_selection_timeout(Duration::from_secs(3))
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(1)).build())
            .build();
        options.repl_set_name = replica_set.map(str::to_owned);
        if config.tls {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .source(config.authdb.clone())
                    .build(),
            );
        }

        Ok(Client::with_options(options)?)
    }

    /// Create an index, reconnecting and retrying on transient disconnects until it succeeds.
    pub async fn create_index(
        &self,
        db: &str,
        coll: &str,
        keys: Document,
        options: impl Into<Option<IndexOptions>>,
    ) -> Result<()> {
        let options = options.into();
        loop {
            let collection = self.client().await.database(db).collection::<Document>(coll);
            let index = IndexModel::builder()
                .keys(keys.clone())
                .options(options.clone())
                .build();
            match collection.create_index(index, None).await {
                Ok(_) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    error!(error = %e, "create index hit a transient error, reconnecting");
                    self.reconnect().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply a batch of converted writes to one collection.
    ///
    /// The batch executes as native `update`/`delete` write commands, one command per run of
    /// same-kind operations so the batch order is preserved on the wire. On a transient
    /// disconnect the whole batch retries from scratch, which is safe because every operation
    /// is idempotent under its `_id` filter. Any other failure degrades to applying the batch
    /// one operation at a time in its original order, where a duplicate key is skipped when
    /// `ignore_dup_key` is set and everything else is unrecoverable.
    pub async fn bulk_write(
        &self,
        db: &str,
        coll: &str,
        ops: &[WriteOp],
        ordered: bool,
        ignore_dup_key: bool,
    ) -> Result<()> {
        loop {
            match self.try_bulk(db, coll, ops, ordered).await {
                Ok(()) => {
                    debug!(count = ops.len(), db = %db, coll = %coll, "applied batch");
                    return Ok(());
                }
                Err(Error::Database(e)) if is_transient(&e) => {
                    error!(error = %e, "bulk write hit a transient error, reconnecting");
                    self.reconnect().await;
                }
                Err(e) => {
                    warn!(error = %e, "bulk write failed, retrying operations one by one");
                    return self.write_serially(db, coll, ops, ignore_dup_key).await;
                }
            }
        }
    }

    async fn try_bulk(&self, db: &str, coll: &str, ops: &[WriteOp], ordered: bool) -> Result<()> {
        let database = self.client().await.database(db);
        for command in command_batches(coll, ops, ordered) {
            let reply = database.run_command(command, None).await?;
            // Write commands report per-statement failures in the reply rather than erroring.
            if let Ok(write_errors) = reply.get_array("writeErrors") {
                if !write_errors.is_empty() {
                    return Err(Error::FatalWrite(format!(
                        "bulk write reported write errors: {:?}",
                        write_errors
                    )));
                }
            }
        }
        Ok(())
    }

    async fn write_serially(
        &self,
        db: &str,
        coll: &str,
        ops: &[WriteOp],
        ignore_dup_key: bool,
    ) -> Result<()> {
        for op in ops {
            loop {
                let collection = self.client().await.database(db).collection::<Document>(coll);
                let result = match op {
                    WriteOp::Replace { filter, document } => collection
                        .replace_one(
                            filter.clone(),
                            document.clone(),
                            ReplaceOptions::builder().upsert(true).build(),
                        )
                        .await
                        .map(drop),
                    WriteOp::Update { filter, update } => collection
                        .update_one(filter.clone(), update.clone(), None)
                        .await
                        .map(drop),
                    WriteOp::Delete { filter } => {
                        collection.delete_one(filter.clone(), None).await.map(drop)
                    }
                };
                match result {
                    Ok(()) => break,
                    Err(e) if is_transient(&e) => {
                        error!(error = %e, "write hit a transient error, reconnecting");
                        self.reconnect().await;
                    }
                    Err(e) if is_duplicate_key(&e) => {
                        if ignore_dup_key {
                            info!(error = %e, op = ?op, "ignoring duplicate key error");
                            break;
                        }
                        return Err(Error::DuplicateKey(format!("{} on {}.{}", e, db, coll)));
                    }
                    Err(e) => {
                        return Err(Error::FatalWrite(format!(
                            "{} while applying {:?} on {}.{}",
                            e, op, db, coll
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a single oplog operation directly, outside the bulk path.
    ///
    /// This is the sequential path used for commands, index inserts and one-by-one catch-up
    /// replay. Unlike the bulk path, updates keep the raw match filter from the oplog entry
    /// rather than narrowing it to `_id`. Transient disconnects retry forever; command
    /// failures are logged and swallowed because commands aimed at namespaces excluded from
    /// replay legitimately fail; a duplicate key honors `ignore_dup_key`; on a mongos
    /// destination an update rejected for altering the shard key falls back to a delete and
    /// reinsert of the document.
    pub async fn apply(&self, operation: &Operation, ignore_dup_key: bool) -> Result<()> {
        let ns = match operation.namespace() {
            Some(ns) => ns.to_owned(),
            None => return Ok(()),
        };
        let (db, coll) = split_namespace(&ns)?;

        loop {
            match self.try_apply(db, coll, operation).await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    error!(error = %e, "transient error applying operation, reconnecting");
                    self.reconnect().await;
                }
                Err(e) if is_duplicate_key(&e) => {
                    if ignore_dup_key {
                        info!(error = %e, operation = %operation, "ignoring duplicate key error");
                        return Ok(());
                    }
                    return Err(Error::DuplicateKey(format!("{}: {}", e, operation)));
                }
                Err(e) => {
                    // Once a collection is sharded its shard key values are immutable; an
                    // update that changes them is rejected by mongos and must be replayed as
                    // a delete and reinsert.
                    if self.is_mongos() && immutable_field_violation(&e) {
                        if let Operation::Update { query, update, .. } = operation {
                            warn!(error = %e, "update altered the shard key, reinserting document");
                            return self.reinsert_for_new_shard_key(db, coll, query, update).await;
                        }
                    }
                    return Err(Error::FatalWrite(format!("{} while applying {}", e, operation)));
                }
            }
        }
    }

    async fn try_apply(
        &self,
        db: &str,
        coll: &str,
        operation: &Operation,
    ) -> mongodb::error::Result<()> {
        let database = self.client().await.database(db);
        let collection = database.collection::<Document>(coll);

        match operation {
            Operation::Insert { document, .. } => match document.get("_id") {
                Some(id) => {
                    collection
                        .replace_one(
                            doc! { "_id": id.clone() },
                            document.clone(),
                            ReplaceOptions::builder().upsert(true).build(),
                        )
                        .await?;
                }
                None => {
                    // A legacy index build routed through *.system.indexes.
                    collection.insert_one(document.clone(), None).await?;
                }
            },
            Operation::Update { query, update, .. } => {
                if update.keys().any(|key| key.starts_with('$')) {
                    collection.update_one(query.clone(), update.clone(), None).await?;
                } else {
                    collection.replace_one(query.clone(), update.clone(), None).await?;
                }
            }
            Operation::Delete { query, .. } => {
                collection.delete_one(query.clone(), None).await?;
            }
            Operation::Command { command, .. } => {
                if let Err(e) = database.run_command(command.clone(), None).await {
                    if matches!(*e.kind, ErrorKind::Command(_)) {
                        info!(error = %e, "skipping failed command replay");
                    } else {
                        return Err(e);
                    }
                }
            }
            Operation::Noop { .. } => {}
        }

        Ok(())
    }

    async fn reinsert_for_new_shard_key(
        &self,
        db: &str,
        coll: &str,
        query: &Document,
        update: &Document,
    ) -> Result<()> {
        let collection = self.client().await.database(db).collection::<Document>(coll);

        let old = collection.find_one(query.clone(), None).await?.ok_or_else(|| {
            Error::FatalWrite(format!("shard key fallback found no document matching {}", query))
        })?;
        let new = new_shard_key_document(&old, update);

        // Not transactional: the document is briefly absent from the destination.
        let deleted = collection.delete_one(query.clone(), None).await?;
        if deleted.deleted_count != 1 {
            return Err(Error::FatalWrite(format!(
                "shard key fallback deleted {} documents matching {}",
                deleted.deleted_count, query
            )));
        }
        collection.insert_one(new, None).await?;

        Ok(())
    }
}

/// The document to reinsert when an update is replayed as delete-then-insert.
///
/// `$set` fields are merged over the existing document; a replacement-form update is taken
/// wholesale. Only top-level `$set` keys are merged.
fn new_shard_key_document(old: &Document, update: &Document) -> Document {
    match update.get_document("$set") {
        Ok(set) => {
            let mut new = old.clone();
            for (key, value) in set {
                new.insert(key.clone(), value.clone());
            }
            new
        }
        Err(_) => update.clone(),
    }
}

/// One `update`/`delete` write command per run of same-kind operations, preserving batch order.
fn command_batches(coll: &str, ops: &[WriteOp], ordered: bool) -> Vec<Document> {
    let mut batches = Vec::new();
    let mut updates: Vec<Bson> = Vec::new();
    let mut deletes: Vec<Bson> = Vec::new();

    for op in ops {
        match op {
            WriteOp::Replace { filter, document } => {
                if !deletes.is_empty() {
                    batches.push(delete_command(coll, std::mem::take(&mut deletes), ordered));
                }
                updates.push(bson!({
                    "q": filter.clone(),
                    "u": document.clone(),
                    "upsert": true,
                    "multi": false
                }));
            }
            WriteOp::Update { filter, update } => {
                if !deletes.is_empty() {
                    batches.push(delete_command(coll, std::mem::take(&mut deletes), ordered));
                }
                updates.push(bson!({
                    "q": filter.clone(),
                    "u": update.clone(),
                    "upsert": false,
                    "multi": false
                }));
            }
            WriteOp::Delete { filter } => {
                if !updates.is_empty() {
                    batches.push(update_command(coll, std::mem::take(&mut updates), ordered));
                }
                deletes.push(bson!({ "q": filter.clone(), "limit": 1 }));
            }
        }
    }
    if !updates.is_empty() {
        batches.push(update_command(coll, updates, ordered));
    }
    if !deletes.is_empty() {
        batches.push(delete_command(coll, deletes, ordered));
    }

    batches
}

fn update_command(coll: &str, updates: Vec<Bson>, ordered: bool) -> Document {
    doc! { "update": coll, "ordered": ordered, "updates": updates }
}

fn delete_command(coll: &str, deletes: Vec<Bson>, ordered: bool) -> Document {
    doc! { "delete": coll, "ordered": ordered, "deletes": deletes }
}

fn is_transient(error: &mongodb::error::Error) -> bool {
    if error.contains_label(RETRYABLE_WRITE_ERROR) {
        return true;
    }
    matches!(
        *error.kind,
        ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match *error.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref e)) => e.code == 11000 || e.code == 11001,
        _ => false,
    }
}

fn immutable_field_violation(error: &mongodb::error::Error) -> bool {
    matches!(*error.kind, ErrorKind::Write(_))
        && error.to_string().contains("the (immutable) field")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_of_updates_becomes_one_update_command() {
        let ops = vec![
            WriteOp::Replace {
                filter: doc! { "_id": 1 },
                document: doc! { "_id": 1, "a": 1 },
            },
            WriteOp::Update {
                filter: doc! { "_id": 2 },
                update: doc! { "$set": { "a": 2 } },
            },
        ];

        let batches = command_batches("c", &ops, true);

        assert_eq!(
            batches,
            vec![doc! {
                "update": "c",
                "ordered": true,
                "updates": [
                    { "q": { "_id": 1 }, "u": { "_id": 1, "a": 1 }, "upsert": true, "multi": false },
                    { "q": { "_id": 2 }, "u": { "$set": { "a": 2 } }, "upsert": false, "multi": false },
                ],
            }]
        );
    }

    #[test]
    fn kind_boundaries_split_commands_in_order() {
        let ops = vec![
            WriteOp::Replace {
                filter: doc! { "_id": 1 },
                document: doc! { "_id": 1 },
            },
            WriteOp::Delete {
                filter: doc! { "_id": 1 },
            },
            WriteOp::Replace {
                filter: doc! { "_id": 1 },
                document: doc! { "_id": 1, "a": 2 },
            },
        ];

        let batches = command_batches("c", &ops, true);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].get_str("update"), Ok("c"));
        assert_eq!(batches[1].get_str("delete"), Ok("c"));
        assert_eq!(batches[2].get_str("update"), Ok("c"));
        assert_eq!(
            batches[1].get_array("deletes"),
            Ok(&vec![bson!({ "q": { "_id": 1 }, "limit": 1 })])
        );
    }

    #[test]
    fn empty_batch_builds_no_commands() {
        assert!(command_batches("c", &[], true).is_empty());
    }

    #[test]
    fn shard_key_document_merges_set_fields() {
        let old = doc! { "_id": 1, "region": "eu", "n": 5 };
        let update = doc! { "$set": { "region": "us" } };

        assert_eq!(
            new_shard_key_document(&old, &update),
            doc! { "_id": 1, "region": "us", "n": 5 }
        );
    }

    #[test]
    fn shard_key_document_takes_replacement_wholesale() {
        let old = doc! { "_id": 1, "region": "eu" };
        let update = doc! { "_id": 1, "region": "us", "n": 6 };

        assert_eq!(
            new_shard_key_document(&old, &update),
            doc! { "_id": 1, "region": "us", "n": 6 }
        );
    }
}
