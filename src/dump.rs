//! Driver for the external dump and restore utilities.
//!
//! The schema travels in two halves: `pre.dump` (everything needed before
//! table data lands) and `post.dump` (indexes, constraints, views,
//! triggers, foreign keys). Both are restored through an edited listing
//! file so that entries we build ourselves never run twice.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};
use postgres::error::SqlState;

use crate::catalog::Catalog;
use crate::pgsql::{self, ConnKind};
use crate::tools;
use crate::workdir::CopyFilePaths;

#[derive(Debug, Clone)]
pub struct DumpPaths {
    pub roles: PathBuf,
    pub pre_dump: PathBuf,
    pub post_dump: PathBuf,
    pub pre_list: PathBuf,
    pub post_list: PathBuf,
}

impl DumpPaths {
    pub fn new(paths: &CopyFilePaths) -> Self {
        DumpPaths {
            roles: paths.schemadir.join("roles.sql"),
            pre_dump: paths.schemadir.join("pre.dump"),
            post_dump: paths.schemadir.join("post.dump"),
            pre_list: paths.schemadir.join("pre.list"),
            post_list: paths.schemadir.join("post.list"),
        }
    }
}

/// Run one external tool to completion, surfacing stderr on failure.
fn run_tool(command: &mut Command) -> Result<String, Error> {
    debug!("running {:?}", command);

    let output = command
        .output()
        .with_context(|| format!("unable to run {:?}", command))?;

    if !output.status.success() {
        bail!(
            "{:?} failed with {}: {}",
            command.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Dump one schema section from the source into an archive file.
fn dump_section(source_pguri: &str, section: &str, archive: &Path) -> Result<(), Error> {
    info!("dumping {} schema to {:?}", section, archive);

    run_tool(
        Command::new("pg_dump")
            .arg("--format=custom")
            .arg(format!("--section={}", section))
            .arg("--file")
            .arg(archive)
            .arg(source_pguri),
    )?;

    Ok(())
}

/// Dump both schema halves, honoring the done markers on resume.
pub fn dump_schema(
    source_pguri: &str,
    paths: &CopyFilePaths,
    dump_paths: &DumpPaths,
) -> Result<(), Error> {
    if tools::file_exists(&paths.done.pre_data_dump)
        && tools::file_exists(&paths.done.post_data_dump)
    {
        info!("schema dump already done, skipping");
        return Ok(());
    }

    dump_section(source_pguri, "pre-data", &dump_paths.pre_dump)?;
    tools::touch(&paths.done.pre_data_dump)?;

    dump_section(source_pguri, "post-data", &dump_paths.post_dump)?;
    tools::touch(&paths.done.post_data_dump)?;

    Ok(())
}

/// One line of `pg_restore --list` output that we may keep or drop.
fn listing_line_kind(line: &str) -> Option<&str> {
    // "123; 4567 16384 INDEX public orders_pkey owner"
    let after_oids = line.splitn(2, ';').nth(1)?;
    let mut fields = after_oids.split_whitespace();

    let _dump_oid = fields.next()?;
    let _catalog_oid = fields.next()?;
    fields.next()
}

/// Filter an archive listing. Extension entries always go away (we create
/// extensions ourselves); `drop_kinds` removes the object kinds we build
/// with our own workers, matched by name against the catalog.
fn filter_listing(
    listing: &str,
    drop_kinds: &[&str],
    known_names: &[String],
) -> String {
    let mut kept = String::new();

    for line in listing.lines() {
        let mut drop = false;

        if let Some(kind) = listing_line_kind(line) {
            if kind == "EXTENSION" {
                drop = true;
            } else if drop_kinds.contains(&kind)
                && known_names.iter().any(|name| line.contains(name.as_str()))
            {
                drop = true;
            }
        }

        // comments on extensions disappear along with the extensions
        if line.contains("COMMENT - EXTENSION") {
            drop = true;
        }

        if drop {
            kept.push_str(";;");
        }
        kept.push_str(line);
        kept.push('\n');
    }

    kept
}

fn restore_with_list(
    target_pguri: &str,
    archive: &Path,
    listing: &Path,
    drop_kinds: &[&str],
    known_names: &[String],
) -> Result<(), Error> {
    let raw = run_tool(Command::new("pg_restore").arg("--list").arg(archive))?;

    let filtered = filter_listing(&raw, drop_kinds, known_names);
    tools::file_set_contents(listing, filtered.as_bytes())?;

    run_tool(
        Command::new("pg_restore")
            .arg("--no-owner")
            .arg("--use-list")
            .arg(listing)
            .arg("--dbname")
            .arg(target_pguri)
            .arg(archive),
    )?;

    Ok(())
}

/// Restore the pre-data half on the target.
pub fn restore_pre_data(
    target_pguri: &str,
    paths: &CopyFilePaths,
    dump_paths: &DumpPaths,
) -> Result<(), Error> {
    if tools::file_exists(&paths.done.pre_data_restore) {
        info!("pre-data schema already restored, skipping");
        return Ok(());
    }

    info!("restoring pre-data schema on the target");

    restore_with_list(
        target_pguri,
        &dump_paths.pre_dump,
        &dump_paths.pre_list,
        &[],
        &[],
    )?;

    tools::touch(&paths.done.pre_data_restore)?;

    Ok(())
}

/// Restore the post-data half, minus the indexes and constraints that our
/// own workers already built. Views, triggers and foreign keys remain.
pub fn restore_post_data(
    target_pguri: &str,
    paths: &CopyFilePaths,
    dump_paths: &DumpPaths,
    catalog: &Catalog,
) -> Result<(), Error> {
    if tools::file_exists(&paths.done.post_data_restore) {
        info!("post-data schema already restored, skipping");
        return Ok(());
    }

    info!("restoring post-data schema on the target");

    let mut known_names: Vec<String> = Vec::new();
    for index in &catalog.indexes {
        known_names.push(index.relname.clone());
        if let Some(name) = &index.constraint_name {
            known_names.push(name.clone());
        }
    }

    restore_with_list(
        target_pguri,
        &dump_paths.post_dump,
        &dump_paths.post_list,
        &["INDEX", "CONSTRAINT"],
        &known_names,
    )?;

    tools::touch(&paths.done.post_data_restore)?;

    Ok(())
}

/// Copy roles from the source to the target, skipping the ones that exist.
pub fn copy_roles(
    source_pguri: &str,
    target_pguri: &str,
    dump_paths: &DumpPaths,
) -> Result<(), Error> {
    info!("copying roles from the source to the target");

    run_tool(
        Command::new("pg_dumpall")
            .arg("--roles-only")
            .arg("--no-role-passwords")
            .arg("--file")
            .arg(&dump_paths.roles)
            .arg("--dbname")
            .arg(source_pguri),
    )?;

    let script = tools::file_get_contents(&dump_paths.roles)?;
    let mut client = pgsql::connect(target_pguri, ConnKind::Target)?;

    for statement in split_sql_statements(&script) {
        match client.batch_execute(&statement) {
            Ok(()) => {}
            Err(err) if err.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                debug!("role already exists, skipping: {}", statement);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("unable to apply {:?}", statement));
            }
        }
    }

    Ok(())
}

/// Cut a SQL script into statements, dropping comments and psql noise.
fn split_sql_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in script.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with("--") || trimmed.starts_with('\\') {
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(trimmed);

        if trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        warn!("roles script ends mid-statement: {:?}", current);
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
;
; Archive created at 2022-06-27 14:42:21 UTC
;
215; 1259 16384 TABLE public orders app
3422; 1259 16402 INDEX public orders_created_idx app
3423; 2606 16401 CONSTRAINT public orders orders_pkey app
3430; 2606 16410 FK CONSTRAINT public lines lines_order_fkey app
2; 3079 13000 EXTENSION - hstore
3501; 0 0 COMMENT - EXTENSION hstore
3424; 1259 16420 VIEW public order_totals app
";

    #[test]
    fn listing_kind_extraction() {
        assert_eq!(
            listing_line_kind("215; 1259 16384 TABLE public orders app"),
            Some("TABLE")
        );
        assert_eq!(listing_line_kind("; comment"), None);
    }

    #[test]
    fn post_data_filter_drops_our_indexes_and_extensions() {
        let known = vec!["orders_created_idx".to_string(), "orders_pkey".to_string()];

        let filtered = filter_listing(LISTING, &["INDEX", "CONSTRAINT"], &known);

        // our index and constraint are commented out
        assert!(filtered.contains(";;3422;"));
        assert!(filtered.contains(";;3423;"));
        // extensions and their comments always are
        assert!(filtered.contains(";;2; 3079"));
        assert!(filtered.contains(";;3501;"));
        // foreign keys, tables and views stay
        assert!(!filtered.contains(";;3430;"));
        assert!(!filtered.contains(";;215;"));
        assert!(!filtered.contains(";;3424;"));
    }

    #[test]
    fn pre_data_filter_only_touches_extensions() {
        let filtered = filter_listing(LISTING, &[], &[]);

        assert!(filtered.contains(";;2; 3079"));
        assert!(!filtered.contains(";;215;"));
        assert!(!filtered.contains(";;3422;"));
    }

    #[test]
    fn sql_script_splitting() {
        let script = "\
-- comment
CREATE ROLE app;
ALTER ROLE app
  WITH LOGIN;
\\connect postgres
";
        let statements = split_sql_statements(script);
        assert_eq!(
            statements,
            vec!["CREATE ROLE app;", "ALTER ROLE app WITH LOGIN;"]
        );
    }
}
