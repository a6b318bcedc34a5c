//! The main sequence of a clone run: snapshot, schema dump, pre-data
//! restore, parallel data and index copy, sequences, post-data restore,
//! then the report.

use std::time::Instant;

use anyhow::{bail, Context, Error};
use log::info;
use postgres::Client;

use crate::catalog::{self, Catalog};
use crate::cdc::{self, StreamSpecs};
use crate::config::{CopySpecs, Section};
use crate::copy;
use crate::dump::{self, DumpPaths};
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::sequences;
use crate::snapshot::SourceSnapshot;
use crate::summary::{self, TopLevelTimings};
use crate::tools;
use crate::workdir::{self, DirectoryState};

/// Run a whole clone. With `follow`, the streaming side is set up before
/// the base copy and the receive/apply pipeline starts right after it.
pub fn run_clone(mut specs: CopySpecs, follow: Option<StreamSpecs>) -> Result<(), Error> {
    process::install_signal_handlers()?;

    let state = workdir::init_workdir(&specs.paths, specs.restart, specs.resume, false)?;

    pgsql::log_connection(&specs.source_pguri, ConnKind::Source);
    pgsql::log_connection(&specs.target_pguri, ConnKind::Target);

    let result = clone_sequence(&mut specs, state, follow.as_ref());

    if result.is_err() {
        // take every worker down with us before surfacing the cause
        process::fatal_exit();
    }

    workdir::release_workdir(&specs.paths, false);

    result?;

    if let Some(stream_specs) = follow {
        cdc::run_follow(&stream_specs)?;
    }

    Ok(())
}

fn clone_sequence(
    specs: &mut CopySpecs,
    state: DirectoryState,
    follow: Option<&StreamSpecs>,
) -> Result<(), Error> {
    let total_started = Instant::now();
    let mut timings = TopLevelTimings::default();
    let dump_paths = DumpPaths::new(&specs.paths);

    // A consistent resume needs a snapshot that still lives somewhere: the
    // identifier on disk belongs to a transaction that died with the
    // previous run.
    if specs.resume && specs.consistent && specs.snapshot.is_none() && state.schema_dump_is_done {
        bail!(
            "a consistent --resume needs --snapshot (a snapshot kept open \
             by `pgclone snapshot`), or --not-consistent"
        );
    }

    if specs.roles && matches!(specs.section, Section::All | Section::PreData) {
        dump::copy_roles(&specs.source_pguri, &specs.target_pguri, &dump_paths)?;
    }

    // the slot must exist before any data moves, or the follow-up stream
    // would miss the changes that happen during the copy
    if let Some(stream_specs) = follow {
        cdc::setup_databases(stream_specs)?;
    }

    let mut source_snapshot = SourceSnapshot::prepare(specs)?;
    if let Some(name) = &source_snapshot.snapshot {
        // workers read the identifier from their forked copy of the specs
        specs.snapshot = Some(name.clone());
    }

    let step_started = Instant::now();
    if specs.section != Section::TableData {
        dump::dump_schema(&specs.source_pguri, &specs.paths, &dump_paths)?;
    }
    timings.dump_schema_ms = step_started.elapsed().as_millis() as u64;

    let step_started = Instant::now();
    let catalog = prepare_catalog(specs, &mut source_snapshot)?;
    timings.fetch_schema_ms = step_started.elapsed().as_millis() as u64;

    let step_started = Instant::now();
    if matches!(specs.section, Section::All | Section::PreData) {
        dump::restore_pre_data(&specs.target_pguri, &specs.paths, &dump_paths)?;
        copy_extensions(specs, &catalog, &mut source_snapshot)?;
    }
    timings.prepare_schema_ms = step_started.elapsed().as_millis() as u64;

    if specs.section == Section::PreData {
        source_snapshot.close()?;
        info!("pre-data section is done");
        return Ok(());
    }

    if matches!(specs.section, Section::All | Section::TableData) {
        let step_started = Instant::now();

        copy::process_table_data(specs, &catalog)?;

        // sequences observe the same snapshot as the table data
        with_source_client(specs, &mut source_snapshot, |client| {
            sequences::copy_sequences(specs, &catalog, client).map(|_| ())
        })?;

        timings.data_and_indexes_ms = step_started.elapsed().as_millis() as u64;
    }

    // every worker has imported the snapshot by now
    source_snapshot.close()?;

    let step_started = Instant::now();
    if matches!(specs.section, Section::All | Section::PostData) {
        dump::restore_post_data(&specs.target_pguri, &specs.paths, &dump_paths, &catalog)?;
    }
    timings.finalize_schema_ms = step_started.elapsed().as_millis() as u64;

    timings.total_ms = total_started.elapsed().as_millis() as u64;

    if matches!(specs.section, Section::All | Section::TableData) {
        let table_specs = copy::table_specs(specs, &catalog);
        summary::print_summary(specs, &table_specs, &mut timings)?;
    }

    info!("clone is done");

    Ok(())
}

/// Load the catalog a resumed run persisted, or fetch it fresh on the
/// snapshot connection and persist it.
fn prepare_catalog(
    specs: &CopySpecs,
    source_snapshot: &mut SourceSnapshot,
) -> Result<Catalog, Error> {
    if specs.resume && tools::file_exists(&specs.paths.schema_file) {
        info!("re-using catalog file {:?}", specs.paths.schema_file);
        return Catalog::read_file(&specs.paths.schema_file);
    }

    let mut catalog = Catalog::default();

    with_source_client(specs, source_snapshot, |client| {
        catalog = catalog::fetch_catalog(client, specs.split_tables_larger_than)?;
        Ok(())
    })?;

    catalog.write_file(&specs.paths.schema_file)?;

    Ok(catalog)
}

/// Run a closure against the snapshot connection, or against a throwaway
/// source connection in non-consistent mode.
fn with_source_client<F>(
    specs: &CopySpecs,
    source_snapshot: &mut SourceSnapshot,
    action: F,
) -> Result<(), Error>
where
    F: FnOnce(&mut Client) -> Result<(), Error>,
{
    if source_snapshot.is_consistent() {
        action(source_snapshot.client()?)
    } else {
        let mut client = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;
        action(&mut client)
    }
}

/// Create the source's extensions on the target and copy their
/// configuration tables, honoring the per-table conditions the extension
/// registered.
fn copy_extensions(
    specs: &CopySpecs,
    catalog: &Catalog,
    source_snapshot: &mut SourceSnapshot,
) -> Result<(), Error> {
    if catalog.extensions.is_empty() {
        return Ok(());
    }

    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    for extension in &catalog.extensions {
        if !specs.skip_extensions {
            info!("creating extension \"{}\"", extension.name);

            dst.batch_execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                pgsql::quote_ident(&extension.name)
            ))
            .with_context(|| format!("unable to create extension {:?}", extension.name))?;
        }

        for config in &extension.config {
            let qname = pgsql::qualified_name(&config.nspname, &config.relname);

            info!(
                "copying configuration table {} of extension \"{}\"",
                qname, extension.name
            );

            let source_expr = format!("(SELECT * FROM {} {})", qname, config.condition);

            with_source_client(specs, source_snapshot, |client| {
                pgsql::copy_data(client, &mut dst, &source_expr, &qname, false).map(|_| ())
            })?;
        }
    }

    Ok(())
}

/// Export a snapshot and hold it open until a signal arrives; other
/// commands pick it up through --snapshot.
pub fn run_snapshot(specs: CopySpecs) -> Result<(), Error> {
    process::install_signal_handlers()?;

    workdir::init_workdir(&specs.paths, false, false, true)?;

    let mut source_snapshot = SourceSnapshot::prepare(&specs)?;

    let name = source_snapshot
        .snapshot
        .clone()
        .ok_or_else(|| anyhow::format_err!("no snapshot was exported"))?;

    println!("{}", name);
    info!("holding snapshot {:?} until this process is signaled", name);

    while !process::asked_to_quit() {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    source_snapshot.close()?;
    workdir::release_workdir(&specs.paths, true);

    Ok(())
}
