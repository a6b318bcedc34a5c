//! Index and constraint builds on the target, driven by the index queue.
//!
//! Builds run concurrently across the pool; only the constraint attach is
//! serialized through the index semaphore, because two ALTER TABLE on the
//! same relation would deadlock each other at the worst possible time.

use std::path::Path;

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info, warn};
use postgres::Client;

use crate::catalog::{Catalog, SourceIndex};
use crate::config::CopySpecs;
use crate::copy;
use crate::ipc::{Queue, QueueMessage};
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::summary::ItemSummary;
use crate::tools;
use crate::workdir::IndexFilePaths;

/// Write the per-table index list handoff file: two lines per index, the
/// index oid then the backing constraint oid (zero when there is none).
pub fn write_index_list_file(indexes: &[&SourceIndex], path: &Path) -> Result<(), Error> {
    let mut contents = String::new();

    for index in indexes {
        contents.push_str(&format!("{}\n{}\n", index.oid, index.constraint_oid));
    }

    tools::file_set_contents(path, contents.as_bytes())
        .with_context(|| format!("unable to write index list file {:?}", path))
}

/// Read an index list file back as (indexOid, constraintOid) pairs. A
/// missing file just means the table carries no indexes.
pub fn read_index_list_file(path: &Path) -> Result<Vec<(u32, u32)>, Error> {
    if !tools::file_exists(path) {
        return Ok(Vec::new());
    }

    let contents = tools::file_get_contents(path)?;
    let lines: Vec<&str> = contents.lines().collect();

    if lines.len() % 2 != 0 {
        bail!(
            "index list file {:?} has {} lines, expected pairs",
            path,
            lines.len()
        );
    }

    let mut pairs = Vec::with_capacity(lines.len() / 2);

    for chunk in lines.chunks(2) {
        let index_oid: u32 = chunk[0]
            .parse()
            .map_err(|_| format_err!("invalid index oid {:?} in {:?}", chunk[0], path))?;
        let constraint_oid: u32 = chunk[1]
            .parse()
            .map_err(|_| format_err!("invalid constraint oid {:?} in {:?}", chunk[1], path))?;

        pairs.push((index_oid, constraint_oid));
    }

    Ok(pairs)
}

/// Make a stored CREATE INDEX definition resumable.
fn index_def_if_not_exists(index_def: &str) -> String {
    if index_def.contains("IF NOT EXISTS") {
        return index_def.to_string();
    }

    if let Some(position) = index_def.find(" INDEX ") {
        let (head, tail) = index_def.split_at(position + " INDEX ".len());
        format!("{}IF NOT EXISTS {}", head, tail)
    } else {
        index_def.to_string()
    }
}

/// One worker of the pool: drain the index queue until the stop sentinel.
pub fn index_worker(specs: &CopySpecs, catalog: &Catalog, queue: Queue) -> Result<(), Error> {
    let mut client = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;
    let semaphore = copy::index_semaphore(specs);

    loop {
        if process::asked_to_quit() {
            bail!("interrupted");
        }

        match queue.recv()? {
            QueueMessage::Stop => {
                debug!("index worker drained its queue");
                return Ok(());
            }
            QueueMessage::Index(oid) => {
                let index = catalog
                    .index_by_oid(oid)
                    .ok_or_else(|| format_err!("unknown index oid {} on the queue", oid))?;

                let table = catalog
                    .table_by_oid(index.table_oid)
                    .ok_or_else(|| format_err!("index {} has no table in the catalog", oid))?;

                build_index(specs, &mut client, index, &table.qname(), &semaphore)?;
            }
            other => bail!("unexpected message {:?} on the index queue", other),
        }
    }
}

fn build_index(
    specs: &CopySpecs,
    client: &mut Client,
    index: &SourceIndex,
    table_qname: &str,
    semaphore: &crate::ipc::Semaphore,
) -> Result<(), Error> {
    let paths = IndexFilePaths::new(&specs.paths, index.oid, index.constraint_oid);

    if !tools::file_exists(&paths.done_file) {
        if tools::create_exclusive(&paths.lock_file)?.is_none() {
            // a sibling from a previous interrupted run left its lock; the
            // queue delivers each oid once per run, so take it over
            warn!("re-claiming index lock {:?}", paths.lock_file);
        }

        let sql = index_def_if_not_exists(&index.index_def);

        info!("{}", sql);

        let (mut summary, started) = ItemSummary::open(
            process::my_pid(),
            index.oid,
            &index.nspname,
            &index.relname,
            sql.clone(),
            &paths.lock_file,
        )?;

        client
            .batch_execute(&sql)
            .with_context(|| format!("unable to create index {}", index.qname()))?;

        summary.finish(started, &paths.done_file)?;
    }

    // a second step only when this index backs a constraint
    if index.constraint_oid != 0 {
        let constraint_done = paths
            .constraint_done_file
            .as_ref()
            .expect("constraint done path");

        if tools::file_exists(constraint_done) {
            return Ok(());
        }

        let constraint_name = index
            .constraint_name
            .as_ref()
            .ok_or_else(|| format_err!("constraint {} has no name", index.constraint_oid))?;
        let constraint_def = index
            .constraint_def
            .as_ref()
            .ok_or_else(|| format_err!("constraint {} has no definition", index.constraint_oid))?;

        let sql =
            constraint_using_index_sql(table_qname, constraint_name, constraint_def, &index.relname)?;

        info!("{}", sql);

        let lock_file = paths
            .constraint_lock_file
            .as_ref()
            .expect("constraint lock path");

        let (mut summary, started) = ItemSummary::open(
            process::my_pid(),
            index.constraint_oid,
            &index.nspname,
            constraint_name,
            sql.clone(),
            lock_file,
        )?;

        // the attach rewrites catalog rows of the parent table; one at a
        // time across the whole pool
        {
            let _guard = semaphore.acquire()?;

            client
                .batch_execute(&sql)
                .with_context(|| format!("unable to add constraint {}", constraint_name))?;
        }

        summary.finish(started, constraint_done)?;
    }

    Ok(())
}

/// `ALTER TABLE … ADD CONSTRAINT … PRIMARY KEY|UNIQUE USING INDEX …`
fn constraint_using_index_sql(
    table_qname: &str,
    constraint_name: &str,
    constraint_def: &str,
    index_name: &str,
) -> Result<String, Error> {
    let kind = if constraint_def.starts_with("PRIMARY KEY") {
        "PRIMARY KEY"
    } else if constraint_def.starts_with("UNIQUE") {
        "UNIQUE"
    } else {
        bail!(
            "constraint {:?} is not backed by an index: {}",
            constraint_name,
            constraint_def
        );
    };

    Ok(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {} USING INDEX {}",
        table_qname,
        pgsql::quote_ident(constraint_name),
        kind,
        pgsql::quote_ident(index_name)
    ))
}

/// Whether every index (and backing constraint) has its done file.
pub fn all_indexes_done(specs: &CopySpecs, catalog: &Catalog) -> bool {
    catalog.indexes.iter().all(|index| {
        let paths = IndexFilePaths::new(&specs.paths, index.oid, index.constraint_oid);

        tools::file_exists(&paths.done_file)
            && paths
                .constraint_done_file
                .as_ref()
                .map(|path| tools::file_exists(path))
                .unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(oid: u32, constraint_oid: u32) -> SourceIndex {
        SourceIndex {
            oid,
            nspname: "public".into(),
            relname: format!("idx_{}", oid),
            table_oid: 16384,
            index_def: format!(
                "CREATE UNIQUE INDEX idx_{} ON public.orders USING btree (id)",
                oid
            ),
            constraint_oid,
            constraint_name: if constraint_oid != 0 {
                Some(format!("con_{}", constraint_oid))
            } else {
                None
            },
            constraint_def: if constraint_oid != 0 {
                Some("PRIMARY KEY (id)".into())
            } else {
                None
            },
        }
    }

    #[test]
    fn index_list_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("16384.idx");

        let indexes = vec![sample_index(20001, 20002), sample_index(20003, 0)];
        let refs: Vec<&SourceIndex> = indexes.iter().collect();

        write_index_list_file(&refs, &path).unwrap();

        // two lines per index, in order
        let raw = tools::file_get_contents(&path).unwrap();
        assert_eq!(raw, "20001\n20002\n20003\n0\n");

        let pairs = read_index_list_file(&path).unwrap();
        assert_eq!(pairs, vec![(20001, 20002), (20003, 0)]);
    }

    #[test]
    fn missing_index_list_file_means_no_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = read_index_list_file(&dir.path().join("nope.idx")).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn odd_line_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.idx");
        tools::file_set_contents(&path, b"20001\n20002\n20003\n").unwrap();

        assert!(read_index_list_file(&path).is_err());
    }

    #[test]
    fn if_not_exists_injection() {
        assert_eq!(
            index_def_if_not_exists("CREATE INDEX foo ON t USING btree (a)"),
            "CREATE INDEX IF NOT EXISTS foo ON t USING btree (a)"
        );
        assert_eq!(
            index_def_if_not_exists("CREATE UNIQUE INDEX foo ON t USING btree (a)"),
            "CREATE UNIQUE INDEX IF NOT EXISTS foo ON t USING btree (a)"
        );
        // already resumable definitions pass through
        let resumable = "CREATE INDEX IF NOT EXISTS foo ON t (a)";
        assert_eq!(index_def_if_not_exists(resumable), resumable);
    }

    #[test]
    fn constraint_sql_shapes() {
        let sql = constraint_using_index_sql(
            "\"public\".\"orders\"",
            "orders_pkey",
            "PRIMARY KEY (id)",
            "orders_pkey",
        )
        .unwrap();
        assert_eq!(
            sql,
            "ALTER TABLE \"public\".\"orders\" ADD CONSTRAINT \"orders_pkey\" \
             PRIMARY KEY USING INDEX \"orders_pkey\""
        );

        let sql = constraint_using_index_sql(
            "\"public\".\"orders\"",
            "orders_email_key",
            "UNIQUE (email)",
            "orders_email_idx",
        )
        .unwrap();
        assert!(sql.contains("UNIQUE USING INDEX \"orders_email_idx\""));

        assert!(constraint_using_index_sql(
            "\"public\".\"orders\"",
            "fk",
            "FOREIGN KEY (x) REFERENCES y(x)",
            "idx"
        )
        .is_err());
    }
}
