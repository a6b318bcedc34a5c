//! Sequence values travel at the end of the data phase: read on the
//! snapshot connection, applied with setval on the target.

use anyhow::{Context, Error};
use log::info;
use postgres::Client;

use crate::catalog::Catalog;
use crate::config::CopySpecs;
use crate::pgsql::{self, ConnKind};
use crate::tools;

/// Copy every sequence's (last_value, is_called) pair. Runs in the parent
/// on the snapshot connection; sequence reads are cheap and sequential.
pub fn copy_sequences(
    specs: &CopySpecs,
    catalog: &Catalog,
    src: &mut Client,
) -> Result<usize, Error> {
    if tools::file_exists(&specs.paths.done.sequences) {
        info!("sequences already copied, skipping");
        return Ok(0);
    }

    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;
    let mut count = 0;

    for sequence in &catalog.sequences {
        let row = src
            .query_one(
                format!("SELECT last_value, is_called FROM {}", sequence.qname()).as_str(),
                &[],
            )
            .with_context(|| format!("unable to read sequence {}", sequence.qname()))?;

        let last_value: i64 = row.get(0);
        let is_called: bool = row.get(1);

        dst.execute(
            "SELECT pg_catalog.setval($1::regclass, $2, $3)",
            &[&sequence.qname(), &last_value, &is_called],
        )
        .with_context(|| format!("unable to set sequence {}", sequence.qname()))?;

        count += 1;
    }

    info!("copied {} sequences to the target", count);

    tools::touch(&specs.paths.done.sequences)?;

    Ok(count)
}
