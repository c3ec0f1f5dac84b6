//! Replica set introspection.
//!
//! Small helpers around `replSetGetStatus` used when wiring up a bridge: discovering the
//! replica set name so the driver routes to the primary, and reading the primary's current
//! optime as the default resume marker.

use crate::{Error, Result};
use mongodb::bson::{doc, Bson, Timestamp};
use mongodb::error::ErrorKind;
use mongodb::Client;

/// The replica set name reported by `replSetGetStatus`, or `None` when the server is not
/// running as part of a replica set (e.g. a standalone server or a mongos router).
pub async fn replica_set_name(client: &Client) -> Result<Option<String>> {
    let status = client
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 }, None)
        .await;

    match status {
        Ok(status) => Ok(status.get_str("set").ok().map(str::to_owned)),
        // The command fails on deployments without an oplog; that is an answer, not an error.
        Err(e) if matches!(*e.kind, ErrorKind::Command(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The optime of the primary member of the replica set.
///
/// Under replication protocol version 1 the member's `optime` is a document with the timestamp
/// nested under `ts`; under protocol version 0 it is a bare timestamp. Both are handled.
pub async fn primary_optime(client: &Client) -> Result<Timestamp> {
    let status = client
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 }, None)
        .await?;

    for member in status.get_array("members")? {
        let member = match member.as_document() {
            Some(member) => member,
            None => continue,
        };
        if member.get_str("stateStr") != Ok("PRIMARY") {
            continue;
        }
        match member.get("optime") {
            Some(Bson::Document(optime)) => return Ok(optime.get_timestamp("ts")?),
            Some(Bson::Timestamp(optime)) => return Ok(*optime),
            _ => break,
        }
    }

    Err(Error::NoPrimary)
}

/// The server version string from `buildInfo`.
pub async fn server_version(client: &Client) -> Result<String> {
    let info = client
        .database("admin")
        .run_command(doc! { "buildInfo": 1 }, None)
        .await?;

    Ok(info.get_str("version")?.to_owned())
}
