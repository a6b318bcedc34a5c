//! Source snapshot management.
//!
//! The parent exports one snapshot and keeps the exporting transaction
//! open for the whole run; every worker imports the same snapshot into
//! its own repeatable-read transaction. That shared snapshot is the
//! consistency fence between all the COPY processes.

use anyhow::{bail, Context, Error};
use log::{debug, info};
use postgres::Client;

use crate::config::CopySpecs;
use crate::pgsql::{self, ConnKind, Isolation};
use crate::tools;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SnapshotState {
    NotPrepared,
    Skipped,
    Exported,
    SetFromExisting,
    Closed,
}

/// The parent-side snapshot holder. Dropping it without `close` leaves
/// the transaction to die with the connection, which aborts cleanly.
pub struct SourceSnapshot {
    client: Option<Client>,
    pub snapshot: Option<String>,
    state: SnapshotState,
}

impl SourceSnapshot {
    /// Connect to the source and either export a fresh snapshot or re-use
    /// the one given via --snapshot (or the environment). The snapshot
    /// identifier is persisted so that --resume can find it again.
    pub fn prepare(specs: &CopySpecs) -> Result<Self, Error> {
        if !specs.consistent {
            debug!("snapshot: --not-consistent, skipping");
            return Ok(SourceSnapshot {
                client: None,
                snapshot: None,
                state: SnapshotState::Skipped,
            });
        }

        let mut client = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;

        let (snapshot, state) = match &specs.snapshot {
            None => {
                // SET TRANSACTION SNAPSHOT requires at least repeatable
                // read on the importing side; the exporting side runs
                // serializable so importers can pick either level
                pgsql::begin(&mut client, Isolation::Serializable)?;
                let name = pgsql::export_snapshot(&mut client)?;

                info!("exported snapshot {:?} from the source database", name);
                (name, SnapshotState::Exported)
            }
            Some(name) => {
                pgsql::begin(&mut client, Isolation::RepeatableRead)?;
                pgsql::set_snapshot(&mut client, name)?;

                info!("using snapshot {:?} on the source database", name);
                (name.clone(), SnapshotState::SetFromExisting)
            }
        };

        tools::file_set_contents(&specs.paths.snapshot_file, snapshot.as_bytes())
            .context("unable to persist the snapshot identifier")?;

        Ok(SourceSnapshot {
            client: Some(client),
            snapshot: Some(snapshot),
            state,
        })
    }

    /// The holding connection, for catalog queries and sequence reads
    /// that must observe the exported snapshot.
    pub fn client(&mut self) -> Result<&mut Client, Error> {
        match self.client.as_mut() {
            Some(client) => Ok(client),
            None => bail!("snapshot connection is not open"),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.state == SnapshotState::Exported || self.state == SnapshotState::SetFromExisting
    }

    /// Commit the holding transaction and close the connection. Only
    /// legal once every worker has imported the snapshot.
    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(mut client) = self.client.take() {
            pgsql::commit(&mut client)
                .context("unable to close the snapshot transaction")?;
        }

        self.state = SnapshotState::Closed;

        Ok(())
    }
}

/// Worker-side: open a source connection and import the shared snapshot.
/// In non-consistent mode the worker settles for its own transaction view.
pub fn worker_source_connection(specs: &CopySpecs) -> Result<Client, Error> {
    let mut client = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;

    pgsql::begin(&mut client, Isolation::RepeatableRead)?;

    if specs.consistent {
        let snapshot = specs
            .snapshot
            .clone()
            .map(Ok)
            .unwrap_or_else(|| -> Result<String, Error> {
                match crate::workdir::read_snapshot_file(&specs.paths)? {
                    Some(name) => Ok(name),
                    None => bail!(
                        "no snapshot identifier available; \
                         use --not-consistent to copy without a shared snapshot"
                    ),
                }
            })?;

        pgsql::set_snapshot(&mut client, &snapshot)?;
        debug!("worker {} imported snapshot {:?}", crate::process::my_pid(), snapshot);
    }

    Ok(client)
}
