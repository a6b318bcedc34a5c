//! On-disk summary records and the end-of-run report.
//!
//! A summary file doubles as a lock file while the work is in flight and
//! as the done file afterwards. Tables and indexes share one 8-line
//! format; the large objects summary is 3 lines. Line order is part of
//! the resume contract, a short file means the ledger is corrupt.

use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use log::error;

use crate::config::CopySpecs;
use crate::copy::CopyTableDataSpec;
use crate::tools;
use crate::workdir::{IndexFilePaths, WorkDirError};

pub const ITEM_SUMMARY_LINES: usize = 8;
pub const BLOBS_SUMMARY_LINES: usize = 3;

/// Summary of one unit of work: a table (or partition) COPY, an index
/// build, or a constraint attach.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSummary {
    pub pid: i32,
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub start_time: u64,
    pub done_time: u64,
    pub duration_ms: u64,
    pub command: String,
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ItemSummary {
    /// Start tracking a unit of work and register it on-disk, typically
    /// in the lock file. Returns the wall-clock handle for `finish`.
    pub fn open(
        pid: i32,
        oid: u32,
        nspname: &str,
        relname: &str,
        command: String,
        filename: &Path,
    ) -> Result<(Self, Instant), Error> {
        let summary = ItemSummary {
            pid,
            oid,
            nspname: nspname.to_string(),
            relname: relname.to_string(),
            start_time: epoch_now(),
            done_time: 0,
            duration_ms: 0,
            command,
        };

        summary.write(filename)?;

        Ok((summary, Instant::now()))
    }

    /// Complete the timing information and register the summary on-disk,
    /// typically in the done file.
    pub fn finish(&mut self, started: Instant, filename: &Path) -> Result<(), Error> {
        self.done_time = epoch_now();
        self.duration_ms = started.elapsed().as_millis() as u64;

        self.write(filename)
    }

    pub fn write(&self, filename: &Path) -> Result<(), Error> {
        let contents = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.pid,
            self.oid,
            self.nspname,
            self.relname,
            self.start_time,
            self.done_time,
            self.duration_ms,
            self.command
        );

        tools::file_set_contents(filename, contents.as_bytes())
            .with_context(|| format!("unable to write summary file {:?}", filename))
    }

    pub fn read(filename: &Path) -> Result<Self, Error> {
        let contents = tools::file_get_contents(filename)?;
        let lines: Vec<&str> = contents.lines().collect();

        if lines.len() < ITEM_SUMMARY_LINES {
            return Err(WorkDirError::LedgerInconsistent(
                filename.to_owned(),
                format!(
                    "contains only {} lines, at least {} expected",
                    lines.len(),
                    ITEM_SUMMARY_LINES
                ),
            )
            .into());
        }

        let parse =
            |line: &str, what: &str| -> Result<u64, Error> {
                line.parse().map_err(|_| {
                    WorkDirError::LedgerInconsistent(
                        filename.to_owned(),
                        format!("invalid {} {:?}", what, line),
                    )
                    .into()
                })
            };

        Ok(ItemSummary {
            pid: parse(lines[0], "pid")? as i32,
            oid: parse(lines[1], "oid")? as u32,
            nspname: lines[2].to_string(),
            relname: lines[3].to_string(),
            start_time: parse(lines[4], "start time")?,
            done_time: parse(lines[5], "done time")?,
            duration_ms: parse(lines[6], "duration")?,
            command: lines[7..].join("\n"),
        })
    }
}

/// Summary of the large objects copy.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobsSummary {
    pub pid: i32,
    pub count: u64,
    pub duration_ms: u64,
}

impl BlobsSummary {
    pub fn write(&self, filename: &Path) -> Result<(), Error> {
        let contents = format!("{}\n{}\n{}\n", self.pid, self.count, self.duration_ms);

        tools::file_set_contents(filename, contents.as_bytes())
            .with_context(|| format!("unable to write blobs summary {:?}", filename))
    }

    pub fn read(filename: &Path) -> Result<Self, Error> {
        let contents = tools::file_get_contents(filename)?;
        let lines: Vec<&str> = contents.lines().collect();

        if lines.len() < BLOBS_SUMMARY_LINES {
            return Err(WorkDirError::LedgerInconsistent(
                filename.to_owned(),
                format!(
                    "contains only {} lines, at least {} expected",
                    lines.len(),
                    BLOBS_SUMMARY_LINES
                ),
            )
            .into());
        }

        let parse = |line: &str, what: &str| -> Result<u64, Error> {
            line.parse().map_err(|_| {
                WorkDirError::LedgerInconsistent(
                    filename.to_owned(),
                    format!("invalid {} {:?}", what, line),
                )
                .into()
            })
        };

        Ok(BlobsSummary {
            pid: parse(lines[0], "pid")? as i32,
            count: parse(lines[1], "count")?,
            duration_ms: parse(lines[2], "duration")?,
        })
    }
}

/// Wall-clock measurements taken by the parent along the main sequence.
#[derive(Debug, Clone, Default)]
pub struct TopLevelTimings {
    pub dump_schema_ms: u64,
    pub fetch_schema_ms: u64,
    pub prepare_schema_ms: u64,
    pub data_and_indexes_ms: u64,
    pub finalize_schema_ms: u64,
    pub total_ms: u64,

    /// Cumulative per-item durations, collected from the done files.
    pub table_duration_ms: u64,
    pub index_duration_ms: u64,
    pub blobs_duration_ms: u64,
}

/// One line of the per-table report.
#[derive(Debug)]
struct SummaryTableEntry {
    oid: String,
    nspname: String,
    relname: String,
    table_ms: String,
    index_count: String,
    index_ms: String,
}

/// Pretty print a duration in milliseconds, like "12s335".
pub fn interval_pretty(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{}s{:03}", ms / 1_000, ms % 1_000)
    } else if ms < 3_600_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    } else {
        format!("{}h{:02}m", ms / 3_600_000, (ms % 3_600_000) / 60_000)
    }
}

/// Scan the done files and print the per-table report plus the top-level
/// timings. Also fills in the cumulative counters of `timings`.
pub fn print_summary(
    specs: &CopySpecs,
    table_specs: &[CopyTableDataSpec],
    timings: &mut TopLevelTimings,
) -> Result<(), Error> {
    let mut entries: Vec<SummaryTableEntry> = Vec::new();

    for spec in table_specs {
        let summary = match ItemSummary::read(&spec.paths.done_file) {
            Ok(summary) => summary,
            Err(err) => {
                error!("unable to read {:?} - {:#}", spec.paths.done_file, err);
                return Err(err);
            }
        };

        timings.table_duration_ms += summary.duration_ms;

        // several partitions share one index list; count it once
        let mut index_count = 0;
        let mut indexing_ms = 0;

        if spec.part_number() == 0 {
            let pairs = crate::indexes::read_index_list_file(&spec.paths.idx_list_file)?;
            index_count = pairs.len();

            for (index_oid, constraint_oid) in pairs {
                let paths = IndexFilePaths::new(&specs.paths, index_oid, constraint_oid);

                // a table without indexes simply has no done files
                if tools::file_exists(&paths.done_file) {
                    let index_summary = ItemSummary::read(&paths.done_file)?;
                    timings.index_duration_ms += index_summary.duration_ms;
                    indexing_ms += index_summary.duration_ms;
                }

                if let Some(constraint_done) = &paths.constraint_done_file {
                    if tools::file_exists(constraint_done) {
                        let constraint_summary = ItemSummary::read(constraint_done)?;
                        timings.index_duration_ms += constraint_summary.duration_ms;
                        indexing_ms += constraint_summary.duration_ms;
                    }
                }
            }
        }

        entries.push(SummaryTableEntry {
            oid: spec.table.oid.to_string(),
            nspname: spec.table.nspname.clone(),
            relname: spec.table.relname.clone(),
            table_ms: interval_pretty(summary.duration_ms),
            index_count: index_count.to_string(),
            index_ms: interval_pretty(indexing_ms),
        });
    }

    if tools::file_exists(&specs.paths.done.blobs) {
        let blobs = BlobsSummary::read(&specs.paths.done.blobs)?;
        timings.blobs_duration_ms = blobs.duration_ms;
    }

    print_summary_table(&entries);
    print_toplevel_summary(specs, timings);

    Ok(())
}

fn print_summary_table(entries: &[SummaryTableEntry]) {
    let headers = ["OID", "Schema", "Name", "copy duration", "indexes", "create index duration"];

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();

    for entry in entries {
        let columns = [
            &entry.oid,
            &entry.nspname,
            &entry.relname,
            &entry.table_ms,
            &entry.index_count,
            &entry.index_ms,
        ];
        for (width, column) in widths.iter_mut().zip(columns.iter()) {
            *width = (*width).max(column.len());
        }
    }

    println!();
    println!(
        "{:>w0$} | {:>w1$} | {:>w2$} | {:>w3$} | {:>w4$} | {:>w5$}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        headers[4],
        headers[5],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4],
        w5 = widths[5],
    );
    println!(
        "{}-+-{}-+-{}-+-{}-+-{}-+-{}",
        "-".repeat(widths[0]),
        "-".repeat(widths[1]),
        "-".repeat(widths[2]),
        "-".repeat(widths[3]),
        "-".repeat(widths[4]),
        "-".repeat(widths[5]),
    );

    for entry in entries {
        println!(
            "{:>w0$} | {:>w1$} | {:>w2$} | {:>w3$} | {:>w4$} | {:>w5$}",
            entry.oid,
            entry.nspname,
            entry.relname,
            entry.table_ms,
            entry.index_count,
            entry.index_ms,
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3],
            w4 = widths[4],
            w5 = widths[5],
        );
    }
    println!();
}

fn print_toplevel_summary(specs: &CopySpecs, timings: &TopLevelTimings) {
    let concurrency = format!(
        "{} + {}",
        specs.table_jobs,
        specs.table_jobs + specs.index_jobs
    );

    let rows: Vec<(&str, &str, String, String)> = vec![
        ("Dump Schema", "source", interval_pretty(timings.dump_schema_ms), "1".into()),
        (
            "Catalog Queries (table ordering, filtering, etc)",
            "source",
            interval_pretty(timings.fetch_schema_ms),
            "1".into(),
        ),
        (
            "Prepare Schema",
            "target",
            interval_pretty(timings.prepare_schema_ms),
            "1".into(),
        ),
        (
            "COPY, INDEX, CONSTRAINTS, VACUUM (wall clock)",
            "both",
            interval_pretty(timings.data_and_indexes_ms),
            concurrency.clone(),
        ),
        (
            "COPY (cumulative)",
            "both",
            interval_pretty(timings.table_duration_ms),
            specs.table_jobs.to_string(),
        ),
        (
            "Large Objects (cumulative)",
            "both",
            interval_pretty(timings.blobs_duration_ms),
            "1".into(),
        ),
        (
            "CREATE INDEX, CONSTRAINTS (cumulative)",
            "target",
            interval_pretty(timings.index_duration_ms),
            specs.index_jobs.to_string(),
        ),
        (
            "Finalize Schema",
            "target",
            interval_pretty(timings.finalize_schema_ms),
            "1".into(),
        ),
    ];

    let separator = format!(" {:>50}   {:>10}  {:>10}  {:>12}", "-".repeat(50), "-".repeat(10), "-".repeat(10), "-".repeat(12));

    println!();
    println!(" {:>50}   {:>10}  {:>10}  {:>12}", "Step", "Connection", "Duration", "Concurrency");
    println!("{}", separator);

    for (step, connection, duration, jobs) in &rows {
        println!(" {:>50}   {:>10}  {:>10}  {:>12}", step, connection, duration, jobs);
    }

    println!("{}", separator);
    println!(
        " {:>50}   {:>10}  {:>10}  {:>12}",
        "Total Wall Clock Duration",
        "both",
        interval_pretty(timings.total_ms),
        concurrency
    );
    println!("{}", separator);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("16384.done");

        let summary = ItemSummary {
            pid: 4242,
            oid: 16384,
            nspname: "public".into(),
            relname: "orders".into(),
            start_time: 1656340000,
            done_time: 1656340012,
            duration_ms: 12335,
            command: "COPY \"public\".\"orders\"".into(),
        };

        summary.write(&path).unwrap();
        assert_eq!(ItemSummary::read(&path).unwrap(), summary);

        // the on-disk format is exactly eight lines
        let raw = tools::file_get_contents(&path).unwrap();
        assert_eq!(raw.lines().count(), ITEM_SUMMARY_LINES);
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn short_summary_file_is_a_ledger_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.done");

        tools::file_set_contents(&path, b"4242\n16384\npublic\n").unwrap();

        let err = ItemSummary::read(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::LedgerInconsistent(_, _))
        ));
    }

    #[test]
    fn blobs_summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.done");

        let summary = BlobsSummary {
            pid: 17,
            count: 250,
            duration_ms: 4321,
        };

        summary.write(&path).unwrap();
        assert_eq!(BlobsSummary::read(&path).unwrap(), summary);

        let raw = tools::file_get_contents(&path).unwrap();
        assert_eq!(raw.lines().count(), BLOBS_SUMMARY_LINES);
    }

    #[test]
    fn open_then_finish_updates_timing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("16384");
        let done = dir.path().join("16384.done");

        let (mut summary, started) = ItemSummary::open(
            99,
            16384,
            "public",
            "events",
            "COPY \"public\".\"events\"".into(),
            &lock,
        )
        .unwrap();

        let on_disk = ItemSummary::read(&lock).unwrap();
        assert_eq!(on_disk.done_time, 0);
        assert_eq!(on_disk.duration_ms, 0);

        summary.finish(started, &done).unwrap();

        let on_disk = ItemSummary::read(&done).unwrap();
        assert!(on_disk.done_time >= on_disk.start_time);
    }

    #[test]
    fn pretty_intervals() {
        assert_eq!(interval_pretty(335), "335ms");
        assert_eq!(interval_pretty(12_335), "12s335");
        assert_eq!(interval_pretty(754_000), "12m34s");
        assert_eq!(interval_pretty(7_500_000), "2h05m");
    }
}
