//! Large objects are copied by one dedicated process: they live outside
//! any table and their oids must be preserved on the target.

use std::time::Instant;

use anyhow::{bail, Context, Error};
use log::{debug, info};

use crate::config::CopySpecs;
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::snapshot;
use crate::summary::BlobsSummary;

/// Copy every large object, then write the 3-line summary into the blobs
/// done marker.
pub fn copy_blobs(specs: &CopySpecs) -> Result<(), Error> {
    let started = Instant::now();

    let mut src = snapshot::worker_source_connection(specs)?;
    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    let oids: Vec<u32> = src
        .query(
            "SELECT oid FROM pg_catalog.pg_largeobject_metadata ORDER BY oid",
            &[],
        )
        .context("unable to list large objects")?
        .into_iter()
        .map(|row| row.get(0))
        .collect();

    info!("copying {} large objects", oids.len());

    let mut count: u64 = 0;

    for oid in oids {
        if process::asked_to_quit() {
            pgsql::rollback(&mut src);
            bail!("interrupted while copying large objects");
        }

        let row = src
            .query_one("SELECT lo_get($1)", &[&oid])
            .with_context(|| format!("unable to read large object {}", oid))?;

        let data: Vec<u8> = row.get(0);

        // a previous run may have left the object behind
        dst.execute(
            "SELECT lo_unlink($1) \
               FROM pg_catalog.pg_largeobject_metadata WHERE oid = $1",
            &[&oid],
        )
        .ok();

        dst.execute("SELECT lo_from_bytea($1, $2)", &[&oid, &data])
            .with_context(|| format!("unable to write large object {}", oid))?;

        debug!("copied large object {} ({} bytes)", oid, data.len());
        count += 1;
    }

    pgsql::commit(&mut src)?;

    let summary = BlobsSummary {
        pid: process::my_pid(),
        count,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    summary.write(&specs.paths.done.blobs)?;

    info!("copied {} large objects to the target", count);

    Ok(())
}
