//! Vacuum analyze pool, fed by the copy workers.

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info};

use crate::catalog::Catalog;
use crate::config::CopySpecs;
use crate::ipc::{Queue, QueueMessage};
use crate::pgsql::{self, ConnKind};
use crate::process;

/// Drain the vacuum queue until the stop sentinel: one VACUUM ANALYZE per
/// freshly copied table, so the planner has statistics before the
/// application connects.
pub fn vacuum_worker(specs: &CopySpecs, catalog: &Catalog, queue: Queue) -> Result<(), Error> {
    let mut client = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    loop {
        if process::asked_to_quit() {
            bail!("interrupted");
        }

        match queue.recv()? {
            QueueMessage::Stop => {
                debug!("vacuum worker drained its queue");
                return Ok(());
            }
            QueueMessage::Vacuum(oid) => {
                let table = catalog
                    .table_by_oid(oid)
                    .ok_or_else(|| format_err!("unknown table oid {} on the queue", oid))?;

                let sql = format!("VACUUM ANALYZE {}", table.qname());
                info!("{}", sql);

                // VACUUM refuses to run inside a transaction block, the
                // plain autocommit path is the only valid one
                client
                    .batch_execute(&sql)
                    .with_context(|| format!("unable to vacuum {}", table.qname()))?;
            }
            other => bail!("unexpected message {:?} on the vacuum queue", other),
        }
    }
}
