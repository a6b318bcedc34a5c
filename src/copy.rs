//! The parallel table data copy: scheduling, the per-partition COPY
//! protocol, and the post-copy fan-out to the index and vacuum queues.
//!
//! The parent forks a pool of copy workers. Workers claim work items by
//! creating the item's lock file exclusively, so the in-memory work list
//! needs no cross-process bookkeeping: the filesystem is the arbiter.

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};
use nix::unistd::Pid;
use postgres::Client;

use crate::blobs;
use crate::catalog::{Catalog, SourceTable};
use crate::config::{CopySpecs, Section};
use crate::indexes;
use crate::ipc::{Queue, QueueMessage, Semaphore};
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::snapshot;
use crate::summary::ItemSummary;
use crate::tools;
use crate::vacuum;
use crate::workdir::TableFilePaths;

/// Partition context for a partial COPY work item.
#[derive(Debug, Clone)]
pub struct PartSpec {
    pub number: usize,
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub key: String,
}

/// One schedulable unit: a table, or one partition of it.
#[derive(Debug, Clone)]
pub struct CopyTableDataSpec {
    pub table: SourceTable,
    pub part: Option<PartSpec>,
    pub qname: String,
    pub source_expr: String,
    pub paths: TableFilePaths,
}

impl CopyTableDataSpec {
    pub fn part_number(&self) -> usize {
        self.part.as_ref().map(|part| part.number).unwrap_or(0)
    }

    pub fn copy_command(&self) -> String {
        format!("COPY {}", self.source_expr)
    }
}

/// Expand the catalog into the ordered work list. The catalog keeps its
/// largest-first ordering, so big tables start copying early.
pub fn table_specs(specs: &CopySpecs, catalog: &Catalog) -> Vec<CopyTableDataSpec> {
    let mut items = Vec::new();

    for table in &catalog.tables {
        let qname = table.qname();

        if table.parts.is_empty() {
            items.push(CopyTableDataSpec {
                table: table.clone(),
                part: None,
                source_expr: qname.clone(),
                paths: TableFilePaths::for_table(&specs.paths, table.oid),
                qname,
            });
        } else {
            let key = table.part_key.clone().expect("partitioned without key");

            for part in &table.parts {
                // the loader hands out non overlapping bounds, so the
                // inclusive BETWEEN below selects each row exactly once
                let source_expr = format!(
                    "(SELECT * FROM {} WHERE {} BETWEEN {} AND {})",
                    qname,
                    pgsql::quote_ident(&key),
                    part.min,
                    part.max
                );

                items.push(CopyTableDataSpec {
                    table: table.clone(),
                    part: Some(PartSpec {
                        number: part.number,
                        count: table.parts.len(),
                        min: part.min,
                        max: part.max,
                        key: key.clone(),
                    }),
                    source_expr,
                    paths: TableFilePaths::for_part(&specs.paths, table.oid, part.number),
                    qname: qname.clone(),
                });
            }
        }
    }

    items
}

pub fn table_semaphore(specs: &CopySpecs) -> Semaphore {
    Semaphore::new(specs.paths.rundir.join("table-semaphore"))
}

pub fn index_semaphore(specs: &CopySpecs) -> Semaphore {
    Semaphore::new(specs.paths.rundir.join("index-semaphore"))
}

/// Run the whole data section: copy workers, index builders, vacuum pool
/// and the large objects process, then settle the phase markers.
pub fn process_table_data(specs: &CopySpecs, catalog: &Catalog) -> Result<(), Error> {
    let work = table_specs(specs, catalog);

    let table_sem = table_semaphore(specs);
    let index_queue = Queue::new()?;
    let vacuum_queue = Queue::new()?;

    let mut index_pids = Vec::new();
    for _ in 0..specs.index_jobs {
        let worker_specs = specs.clone();
        let worker_catalog = catalog.clone();
        index_pids.push(process::fork_worker("create-index", move || {
            indexes::index_worker(&worker_specs, &worker_catalog, index_queue)
        })?);
    }

    let mut vacuum_pids = Vec::new();
    for _ in 0..specs.vacuum_jobs {
        let worker_specs = specs.clone();
        let worker_catalog = catalog.clone();
        vacuum_pids.push(process::fork_worker("vacuum", move || {
            vacuum::vacuum_worker(&worker_specs, &worker_catalog, vacuum_queue)
        })?);
    }

    // tables finished by an interrupted run still owe their post-copy
    // work; the pools above are already draining, so these sends cannot
    // fill the queue
    enqueue_completed_tables(specs, catalog, &work, &index_queue, &vacuum_queue)?;

    let mut copy_pids: Vec<Pid> = Vec::new();
    for _ in 0..specs.table_jobs {
        let worker_specs = specs.clone();
        let worker_catalog = catalog.clone();
        let worker_work = work.clone();
        let worker_sem = table_sem.clone();
        copy_pids.push(process::fork_worker("table-data", move || {
            copy_worker(
                &worker_specs,
                &worker_catalog,
                &worker_work,
                &worker_sem,
                index_queue,
                vacuum_queue,
            )
        })?);
    }

    let mut blobs_pid = None;
    if specs.section == Section::All
        && !specs.skip_large_objects
        && !tools::file_exists(&specs.paths.done.blobs)
    {
        let worker_specs = specs.clone();
        blobs_pid = Some(process::fork_worker("large-objects", move || {
            blobs::copy_blobs(&worker_specs)
        })?);
    }

    let copy_ok = process::wait_for_pids(&copy_pids)?;

    if process::asked_to_quit() {
        index_queue.send_stop(specs.index_jobs).ok();
        vacuum_queue.send_stop(specs.vacuum_jobs).ok();
        process::wait_for_subprocesses();
        bail!("interrupted during table data copy");
    }

    if !copy_ok {
        index_queue.send_stop(specs.index_jobs).ok();
        vacuum_queue.send_stop(specs.vacuum_jobs).ok();
        process::wait_for_subprocesses();
        bail!("some table copy workers failed");
    }

    if work.iter().all(|item| tools::file_exists(&item.paths.done_file)) {
        tools::touch(&specs.paths.done.tables)?;
        info!("all table data has been copied to the target");
    } else {
        bail!("copy workers exited but some tables are not done");
    }

    // copy workers were the producers; the queues can drain out now
    index_queue.send_stop(specs.index_jobs)?;
    vacuum_queue.send_stop(specs.vacuum_jobs)?;

    let index_ok = process::wait_for_pids(&index_pids)?;
    let vacuum_ok = process::wait_for_pids(&vacuum_pids)?;

    let blobs_ok = match blobs_pid {
        Some(pid) => process::wait_for_pids(&[pid])?,
        None => true,
    };

    if !(index_ok && vacuum_ok && blobs_ok) {
        bail!("some post-copy workers failed");
    }

    if indexes::all_indexes_done(specs, catalog) {
        tools::touch(&specs.paths.done.indexes)?;
        info!("all indexes have been built on the target");
    } else {
        bail!("index workers exited but some indexes are not done");
    }

    index_queue.close();
    vacuum_queue.close();

    Ok(())
}

/// Emit index and vacuum jobs for tables whose data copy completed in a
/// previous run. Without this, a resumed run would never rebuild the
/// indexes of a table it does not copy again.
fn enqueue_completed_tables(
    specs: &CopySpecs,
    catalog: &Catalog,
    work: &[CopyTableDataSpec],
    index_queue: &Queue,
    vacuum_queue: &Queue,
) -> Result<(), Error> {
    if tools::file_exists(&specs.paths.done.indexes) {
        return Ok(());
    }

    for table in &catalog.tables {
        let items: Vec<&CopyTableDataSpec> = work
            .iter()
            .filter(|item| item.table.oid == table.oid)
            .collect();

        let all_done = !items.is_empty()
            && items
                .iter()
                .all(|item| tools::file_exists(&item.paths.done_file));

        if !all_done {
            continue;
        }

        let idx_list_file = &items[0].paths.idx_list_file;
        let table_indexes = catalog.indexes_for_table(table.oid);

        if !tools::file_exists(idx_list_file) {
            indexes::write_index_list_file(&table_indexes, idx_list_file)?;
        }

        let mut missing = 0;
        for index in &table_indexes {
            let paths = crate::workdir::IndexFilePaths::new(
                &specs.paths,
                index.oid,
                index.constraint_oid,
            );
            if !tools::file_exists(&paths.done_file) {
                index_queue.send(&QueueMessage::Index(index.oid))?;
                missing += 1;
            }
        }

        if missing > 0 {
            debug!(
                "table {} was copied by a previous run, re-enqueued {} indexes",
                table.qname(),
                missing
            );
            vacuum_queue.send(&QueueMessage::Vacuum(table.oid))?;
        }
    }

    Ok(())
}

/// One copy worker: iterate the shared work list and claim what nobody
/// else has started yet.
fn copy_worker(
    specs: &CopySpecs,
    catalog: &Catalog,
    work: &[CopyTableDataSpec],
    table_sem: &Semaphore,
    index_queue: Queue,
    vacuum_queue: Queue,
) -> Result<(), Error> {
    let mut src = snapshot::worker_source_connection(specs)?;
    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    for item in work {
        if process::asked_to_quit() {
            pgsql::rollback(&mut src);
            bail!("interrupted");
        }

        if tools::file_exists(&item.paths.done_file) {
            continue;
        }

        if !claim_work_item(item)? {
            continue;
        }

        if let Err(err) = copy_one_table(specs, &mut src, &mut dst, item, table_sem) {
            // release the claim so a resumed run retries this item
            let _ = std::fs::remove_file(&item.paths.lock_file);
            pgsql::rollback(&mut src);
            return Err(err);
        }

        emit_post_copy_work(specs, catalog, item, table_sem, &index_queue, &vacuum_queue)?;
    }

    // release the snapshot import
    pgsql::commit(&mut src)?;

    Ok(())
}

/// Try to own a work item by creating its lock file exclusively. A lock
/// left behind by a dead process is reclaimed on the spot.
fn claim_work_item(item: &CopyTableDataSpec) -> Result<bool, Error> {
    if tools::create_exclusive(&item.paths.lock_file)?.is_some() {
        return Ok(true);
    }

    match ItemSummary::read(&item.paths.lock_file) {
        Ok(summary) if process::pid_is_alive(summary.pid) => Ok(false),
        Ok(summary) => {
            warn!(
                "removing stale lock {:?} of dead process {}",
                item.paths.lock_file, summary.pid
            );
            let _ = std::fs::remove_file(&item.paths.lock_file);
            Ok(tools::create_exclusive(&item.paths.lock_file)?.is_some())
        }
        // just claimed by a sibling that did not write its summary yet
        Err(_) => Ok(false),
    }
}

fn copy_one_table(
    specs: &CopySpecs,
    src: &mut Client,
    dst: &mut Client,
    item: &CopyTableDataSpec,
    table_sem: &Semaphore,
) -> Result<(), Error> {
    info!(
        "{} {}",
        item.copy_command(),
        item.part
            .as_ref()
            .map(|part| format!("(part {}/{})", part.number + 1, part.count))
            .unwrap_or_default()
    );

    let (mut summary, started) = ItemSummary::open(
        process::my_pid(),
        item.table.oid,
        &item.table.nspname,
        &item.table.relname,
        item.copy_command(),
        &item.paths.lock_file,
    )?;

    // Only a full copy truncates; a --section table-data run targets a
    // schema that may carry data on purpose.
    let mut truncate_in_copy_tx = false;

    if specs.section == Section::All {
        if item.part.is_some() {
            truncate_same_table_once(dst, item, table_sem)?;
        } else {
            truncate_in_copy_tx = true;
        }
    }

    let bytes = pgsql::copy_data(
        src,
        dst,
        &item.source_expr,
        &item.qname,
        truncate_in_copy_tx,
    )
    .with_context(|| format!("unable to copy {}", item.qname))?;

    debug!("copied {} bytes into {}", bytes, item.qname);

    summary.finish(started, &item.paths.done_file)?;

    Ok(())
}

/// Partitions of the same table race to the target: exactly one of them
/// may TRUNCATE, and only before any partition starts writing. The
/// `<oid>.truncate` marker under the table semaphore is that critical
/// section.
fn truncate_same_table_once(
    dst: &mut Client,
    item: &CopyTableDataSpec,
    table_sem: &Semaphore,
) -> Result<(), Error> {
    let _guard = table_sem.acquire()?;

    if tools::file_exists(&item.paths.truncate_done_file) {
        return Ok(());
    }

    debug!("TRUNCATE {} (first partition in)", item.qname);

    dst.batch_execute(&format!("TRUNCATE {}", item.qname))
        .with_context(|| format!("unable to TRUNCATE {}", item.qname))?;

    tools::touch(&item.paths.truncate_done_file)?;

    Ok(())
}

/// The last partition in writes the index list file and feeds the index
/// and vacuum queues. The table semaphore plus the index list file
/// guarantee a single winner.
fn emit_post_copy_work(
    specs: &CopySpecs,
    catalog: &Catalog,
    item: &CopyTableDataSpec,
    table_sem: &Semaphore,
    index_queue: &Queue,
    vacuum_queue: &Queue,
) -> Result<(), Error> {
    let _guard = table_sem.acquire()?;

    let part_count = item.part.as_ref().map(|part| part.count).unwrap_or(1);

    let all_done = (0..part_count).all(|number| {
        let paths = if item.part.is_some() {
            TableFilePaths::for_part(&specs.paths, item.table.oid, number)
        } else {
            TableFilePaths::for_table(&specs.paths, item.table.oid)
        };
        tools::file_exists(&paths.done_file)
    });

    if !all_done || tools::file_exists(&item.paths.idx_list_file) {
        return Ok(());
    }

    let table_indexes = catalog.indexes_for_table(item.table.oid);

    indexes::write_index_list_file(&table_indexes, &item.paths.idx_list_file)?;

    for index in &table_indexes {
        index_queue.send(&QueueMessage::Index(index.oid))?;
    }

    vacuum_queue.send(&QueueMessage::Vacuum(item.table.oid))?;

    debug!(
        "table {} is fully copied, scheduled {} indexes and a vacuum",
        item.qname,
        table_indexes.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{distribute_range, TablePart};

    fn sample_table(oid: u32, parts: Vec<TablePart>) -> SourceTable {
        SourceTable {
            oid,
            nspname: "public".into(),
            relname: "events".into(),
            bytes: 1 << 30,
            bytes_pretty: "1024 MB".into(),
            part_key: if parts.is_empty() {
                None
            } else {
                Some("id".into())
            },
            parts,
        }
    }

    fn sample_specs(dir: &std::path::Path) -> CopySpecs {
        CopySpecs::new(
            "postgres://localhost/src".into(),
            "postgres://localhost/dst".into(),
            Some(dir.to_path_buf()),
            2,
            2,
            0,
            Section::All,
            None,
            false,
            false,
            false,
            false,
            false,
            true,
        )
        .unwrap()
    }

    #[test]
    fn work_items_for_unsplit_table() {
        let dir = tempfile::tempdir().unwrap();
        let specs = sample_specs(dir.path());

        let catalog = Catalog {
            tables: vec![sample_table(16384, vec![])],
            ..Default::default()
        };

        let items = table_specs(&specs, &catalog);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_expr, "\"public\".\"events\"");
        assert_eq!(items[0].part_number(), 0);
        assert_eq!(
            items[0].copy_command(),
            "COPY \"public\".\"events\""
        );
    }

    #[test]
    fn work_items_for_partitioned_table() {
        let dir = tempfile::tempdir().unwrap();
        let specs = sample_specs(dir.path());

        let catalog = Catalog {
            tables: vec![sample_table(16384, distribute_range(1, 10_000_000, 4))],
            ..Default::default()
        };

        let items = table_specs(&specs, &catalog);

        assert_eq!(items.len(), 4);
        assert_eq!(
            items[0].source_expr,
            "(SELECT * FROM \"public\".\"events\" WHERE \"id\" BETWEEN 1 AND 2500000)"
        );
        assert_eq!(
            items[3].source_expr,
            "(SELECT * FROM \"public\".\"events\" WHERE \"id\" BETWEEN 7500001 AND 10000000)"
        );

        // partitions share the per-table handoff files
        assert_eq!(items[0].paths.idx_list_file, items[3].paths.idx_list_file);
        assert_eq!(
            items[0].paths.truncate_done_file,
            items[3].paths.truncate_done_file
        );
        // but own their lock and done files
        assert_ne!(items[0].paths.lock_file, items[1].paths.lock_file);
    }

    #[test]
    fn claiming_a_work_item_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let specs = sample_specs(dir.path());
        crate::workdir::init_workdir(&specs.paths, false, false, false).unwrap();

        let catalog = Catalog {
            tables: vec![sample_table(16384, vec![])],
            ..Default::default()
        };
        let items = table_specs(&specs, &catalog);

        assert!(claim_work_item(&items[0]).unwrap());

        // an empty lock file means the owner is mid-claim, leave it alone
        assert!(!claim_work_item(&items[0]).unwrap());
    }

    #[test]
    fn stale_lock_of_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let specs = sample_specs(dir.path());
        crate::workdir::init_workdir(&specs.paths, false, false, false).unwrap();

        let catalog = Catalog {
            tables: vec![sample_table(16384, vec![])],
            ..Default::default()
        };
        let items = table_specs(&specs, &catalog);

        // a complete summary with a pid that cannot be alive
        let summary = ItemSummary {
            pid: i32::MAX - 1,
            oid: 16384,
            nspname: "public".into(),
            relname: "events".into(),
            start_time: 1,
            done_time: 0,
            duration_ms: 0,
            command: "COPY \"public\".\"events\"".into(),
        };
        summary.write(&items[0].paths.lock_file).unwrap();

        assert!(claim_work_item(&items[0]).unwrap());
    }
}
