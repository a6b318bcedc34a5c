//! Run-time configuration for a copy run.
//!
//! The whole configuration is a plain value: the parent builds it once and
//! every worker receives its own copy at fork time. Nothing in here is
//! shared after the fork.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

use crate::workdir::CopyFilePaths;

/// Environment variable that provides a default for `--snapshot`.
pub const SNAPSHOT_ENV: &str = "PGCLONE_SNAPSHOT";

/// Session settings applied to every source connection.
pub const SOURCE_GUCS: &[(&str, &str)] = &[
    ("client_encoding", "'UTF-8'"),
    ("tcp_keepalives_idle", "'60s'"),
];

/// Session settings applied to every target connection. Losing the target
/// mid-run is recoverable with --resume, so synchronous_commit is off.
pub const TARGET_GUCS: &[(&str, &str)] = &[
    ("client_encoding", "'UTF-8'"),
    ("maintenance_work_mem", "'1 GB'"),
    ("synchronous_commit", "'off'"),
];

/// Which part of the copy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    All,
    PreData,
    PostData,
    TableData,
}

impl FromStr for Section {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "all" => Ok(Section::All),
            "pre-data" => Ok(Section::PreData),
            "post-data" => Ok(Section::PostData),
            "table-data" => Ok(Section::TableData),
            other => bail!("unknown section {:?}", other),
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Section::All => "all",
            Section::PreData => "pre-data",
            Section::PostData => "post-data",
            Section::TableData => "table-data",
        };
        write!(f, "{}", name)
    }
}

/// Everything a copy run needs to know, paths included.
#[derive(Debug, Clone)]
pub struct CopySpecs {
    pub source_pguri: String,
    pub target_pguri: String,

    pub paths: CopyFilePaths,

    pub table_jobs: usize,
    pub index_jobs: usize,
    /// There is no separate knob for this one, it follows table_jobs.
    pub vacuum_jobs: usize,

    pub split_tables_larger_than: u64,

    pub section: Section,
    pub snapshot: Option<String>,

    pub roles: bool,
    pub skip_large_objects: bool,
    pub skip_extensions: bool,

    pub restart: bool,
    pub resume: bool,
    pub consistent: bool,
}

impl CopySpecs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_pguri: String,
        target_pguri: String,
        dir: Option<PathBuf>,
        table_jobs: usize,
        index_jobs: usize,
        split_tables_larger_than: u64,
        section: Section,
        snapshot: Option<String>,
        roles: bool,
        skip_large_objects: bool,
        skip_extensions: bool,
        restart: bool,
        resume: bool,
        consistent: bool,
    ) -> Result<Self, Error> {
        let paths = CopyFilePaths::new(dir)?;

        let snapshot = match snapshot {
            Some(name) => Some(name),
            None => snapshot_from_env(),
        };

        let mut specs = CopySpecs {
            source_pguri,
            target_pguri,
            paths,
            table_jobs,
            index_jobs,
            vacuum_jobs: table_jobs,
            split_tables_larger_than,
            section,
            snapshot,
            roles,
            skip_large_objects,
            skip_extensions,
            restart,
            resume,
            consistent,
        };

        // large objects only make sense when the whole database is copied
        if specs.section != Section::All {
            specs.skip_large_objects = true;
        }

        if specs.table_jobs == 0 || specs.index_jobs == 0 {
            bail!("--table-jobs and --index-jobs must be at least 1");
        }

        Ok(specs)
    }
}

pub fn snapshot_from_env() -> Option<String> {
    match std::env::var(SNAPSHOT_ENV) {
        Ok(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Default work directory: $TMPDIR/pgclone, falling back to /tmp.
pub fn default_workdir() -> PathBuf {
    let tmpdir = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(tmpdir).join("pgclone")
}

/// Where the change data capture files live when no --dir was given:
/// $XDG_DATA_HOME/pgclone (usually ~/.local/share/pgclone).
pub fn default_cdc_dir() -> Result<PathBuf, Error> {
    let base = xdg::BaseDirectories::new()
        .map_err(|err| format_err!("unable to compute XDG directories - {}", err))?;

    Ok(base.get_data_home().join("pgclone"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_round_trip() {
        for name in &["all", "pre-data", "post-data", "table-data"] {
            let section: Section = name.parse().unwrap();
            assert_eq!(&section.to_string(), name);
        }
        assert!("schema".parse::<Section>().is_err());
    }

    #[test]
    fn section_other_than_all_skips_blobs() {
        let specs = CopySpecs::new(
            "postgres://localhost/src".into(),
            "postgres://localhost/dst".into(),
            Some(std::env::temp_dir().join("pgclone-test-config")),
            4,
            2,
            0,
            Section::TableData,
            None,
            false,
            false,
            false,
            false,
            false,
            true,
        )
        .unwrap();

        assert!(specs.skip_large_objects);
        assert_eq!(specs.vacuum_jobs, 4);
    }
}
