//! Work directory layout and the on-disk ledger.
//!
//! Every unit of work leaves a lock file behind while it runs and a done
//! file once it completed, so that an interrupted run can be resumed. The
//! decision whether a new run may proceed, must resume, or has nothing left
//! to do is taken here, from the ledger alone.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config;
use crate::process;
use crate::tools;

/// Startup conditions that map to distinct fatal causes.
#[derive(Debug, thiserror::Error)]
pub enum WorkDirError {
    #[error("work directory {dir:?} contains a pidfile for process {pid}, which is currently running")]
    AlreadyRunning { dir: PathBuf, pid: i32 },

    #[error("a previous run completed; use --restart to remove its files and start over")]
    NothingToDo,

    #[error("a previous run left partial state behind; use --resume to continue it, or --restart to start over")]
    NeedsResumeOrRestart,

    #[error("done file {0:?} is corrupt: {1}")]
    LedgerInconsistent(PathBuf, String),
}

/// Top-level phase markers, all under `run/`.
#[derive(Debug, Clone)]
pub struct DoneFiles {
    pub pre_data_dump: PathBuf,
    pub post_data_dump: PathBuf,
    pub pre_data_restore: PathBuf,
    pub post_data_restore: PathBuf,
    pub tables: PathBuf,
    pub indexes: PathBuf,
    pub sequences: PathBuf,
    pub blobs: PathBuf,
}

/// Where the change data capture intermediate files live.
#[derive(Debug, Clone)]
pub struct CdcPaths {
    pub dir: PathBuf,
    pub origin_file: PathBuf,
    pub tli_file: PathBuf,
    pub tli_hist_file: PathBuf,
    pub wal_segsize_file: PathBuf,
}

impl CdcPaths {
    fn new(dir: PathBuf) -> Self {
        CdcPaths {
            origin_file: dir.join("origin"),
            tli_file: dir.join("tli"),
            tli_hist_file: dir.join("tli.history"),
            wal_segsize_file: dir.join("wal_segment_size"),
            dir,
        }
    }

    pub fn json_file(&self, first_lsn: crate::cdc::Lsn) -> PathBuf {
        self.dir.join(format!("{}.json", first_lsn.wal_file_basename()))
    }

    pub fn json_partial_file(&self, first_lsn: crate::cdc::Lsn) -> PathBuf {
        self.dir
            .join(format!("{}.json.partial", first_lsn.wal_file_basename()))
    }

    pub fn sql_file(&self, first_lsn: crate::cdc::Lsn) -> PathBuf {
        self.dir.join(format!("{}.sql", first_lsn.wal_file_basename()))
    }
}

/// All the file paths a run needs, computed once up-front.
#[derive(Debug, Clone)]
pub struct CopyFilePaths {
    pub topdir: PathBuf,
    pub pidfile: PathBuf,
    pub aux_pidfile: PathBuf,
    pub snapshot_file: PathBuf,
    pub schema_file: PathBuf,
    pub schemadir: PathBuf,
    pub rundir: PathBuf,
    pub tbldir: PathBuf,
    pub idxdir: PathBuf,
    pub done: DoneFiles,
    pub cdc: CdcPaths,
}

impl CopyFilePaths {
    /// Compute the layout. `dir` overrides the `$TMPDIR/pgclone` default;
    /// when given, the CDC files move under it too, otherwise they live in
    /// the XDG data home so they survive /tmp cleanups.
    pub fn new(dir: Option<PathBuf>) -> Result<Self, Error> {
        let explicit = dir.is_some();
        let topdir = dir.unwrap_or_else(config::default_workdir);

        let rundir = topdir.join("run");
        let tbldir = rundir.join("tables");
        let idxdir = rundir.join("indexes");

        let cdc_dir = if explicit {
            topdir.join("cdc")
        } else {
            config::default_cdc_dir()?
        };

        debug!("change data capture files are managed at {:?}", cdc_dir);

        Ok(CopyFilePaths {
            pidfile: topdir.join("pgclone.pid"),
            aux_pidfile: topdir.join("pgclone.aux.pid"),
            snapshot_file: topdir.join("snapshot"),
            schema_file: topdir.join("schema.json"),
            schemadir: topdir.join("schema"),
            done: DoneFiles {
                pre_data_dump: rundir.join("dump-pre.done"),
                post_data_dump: rundir.join("dump-post.done"),
                pre_data_restore: rundir.join("restore-pre.done"),
                post_data_restore: rundir.join("restore-post.done"),
                tables: rundir.join("tables.done"),
                indexes: rundir.join("indexes.done"),
                sequences: rundir.join("sequences.done"),
                blobs: rundir.join("blobs.done"),
            },
            cdc: CdcPaths::new(cdc_dir),
            rundir,
            tbldir,
            idxdir,
            topdir,
        })
    }

    fn subdirs(&self) -> [&Path; 4] {
        [&self.schemadir, &self.rundir, &self.tbldir, &self.idxdir]
    }
}

/// Lock and done files for one table, or for one partition of it.
#[derive(Debug, Clone)]
pub struct TableFilePaths {
    pub lock_file: PathBuf,
    pub done_file: PathBuf,
    pub idx_list_file: PathBuf,
    pub truncate_done_file: PathBuf,
}

impl TableFilePaths {
    pub fn for_table(paths: &CopyFilePaths, oid: u32) -> Self {
        TableFilePaths {
            lock_file: paths.tbldir.join(format!("{}", oid)),
            done_file: paths.tbldir.join(format!("{}.done", oid)),
            idx_list_file: paths.tbldir.join(format!("{}.idx", oid)),
            truncate_done_file: paths.tbldir.join(format!("{}.truncate", oid)),
        }
    }

    pub fn for_part(paths: &CopyFilePaths, oid: u32, part: usize) -> Self {
        TableFilePaths {
            lock_file: paths.tbldir.join(format!("{}.{}", oid, part)),
            done_file: paths.tbldir.join(format!("{}.{}.done", oid, part)),
            idx_list_file: paths.tbldir.join(format!("{}.idx", oid)),
            truncate_done_file: paths.tbldir.join(format!("{}.truncate", oid)),
        }
    }
}

/// Lock and done files for one index and its optional constraint.
#[derive(Debug, Clone)]
pub struct IndexFilePaths {
    pub lock_file: PathBuf,
    pub done_file: PathBuf,
    pub constraint_lock_file: Option<PathBuf>,
    pub constraint_done_file: Option<PathBuf>,
}

impl IndexFilePaths {
    pub fn new(paths: &CopyFilePaths, index_oid: u32, constraint_oid: u32) -> Self {
        let constraint = if constraint_oid != 0 {
            Some(constraint_oid)
        } else {
            None
        };

        IndexFilePaths {
            lock_file: paths.idxdir.join(format!("{}", index_oid)),
            done_file: paths.idxdir.join(format!("{}.done", index_oid)),
            constraint_lock_file: constraint.map(|oid| paths.idxdir.join(format!("{}", oid))),
            constraint_done_file: constraint.map(|oid| paths.idxdir.join(format!("{}.done", oid))),
        }
    }
}

/// What the inspection of an existing work directory found.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryState {
    pub directory_exists: bool,
    pub directory_is_ready: bool,

    pub schema_dump_is_done: bool,
    pub pre_data_restore_is_done: bool,
    pub post_data_restore_is_done: bool,
    pub table_copy_is_done: bool,
    pub index_copy_is_done: bool,
    pub sequence_copy_is_done: bool,
    pub blobs_copy_is_done: bool,

    pub all_done: bool,
}

/// Inspect the work directory. From the done files and the lock files we
/// can tell why the command is being run again.
pub fn inspect_workdir(paths: &CopyFilePaths) -> DirectoryState {
    let mut state = DirectoryState::default();

    state.directory_exists = tools::directory_exists(&paths.topdir);

    if !state.directory_exists {
        return state;
    }

    state.directory_is_ready = paths
        .subdirs()
        .iter()
        .all(|dir| tools::directory_exists(dir));

    if !state.directory_is_ready {
        debug!("inspect_workdir: not all components found");
        return state;
    }

    let done = &paths.done;

    state.schema_dump_is_done =
        tools::file_exists(&done.pre_data_dump) && tools::file_exists(&done.post_data_dump);
    state.pre_data_restore_is_done = tools::file_exists(&done.pre_data_restore);
    state.post_data_restore_is_done = tools::file_exists(&done.post_data_restore);
    state.table_copy_is_done = tools::file_exists(&done.tables);
    state.index_copy_is_done = tools::file_exists(&done.indexes);
    state.sequence_copy_is_done = tools::file_exists(&done.sequences);
    state.blobs_copy_is_done = tools::file_exists(&done.blobs);

    state.all_done = state.schema_dump_is_done
        && state.pre_data_restore_is_done
        && state.post_data_restore_is_done
        && state.table_copy_is_done
        && state.index_copy_is_done
        && state.sequence_copy_is_done
        && state.blobs_copy_is_done;

    state
}

/// Count the lock files without a matching done file, which indicates work
/// that was in flight when a previous run stopped.
fn count_stale_locks(dir: &Path) -> usize {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(name.ends_with(".done") || name.ends_with(".idx") || name.ends_with(".truncate"))
        })
        .filter(|entry| {
            let done = PathBuf::from(format!("{}.done", entry.path().display()));
            !tools::file_exists(done)
        })
        .count()
}

/// Create or re-use the work directory, per the restart protocol.
///
/// The decision table, in order:
///  - another live process owns the primary pidfile: fail
///  - --restart: wipe and recreate
///  - fresh directory, or the schema dump did not happen yet: proceed
///  - everything already done: fail, only --restart makes sense
///  - partial state with --resume: proceed
///  - partial state without --resume: fail
pub fn init_workdir(
    paths: &CopyFilePaths,
    restart: bool,
    resume: bool,
    auxiliary: bool,
) -> Result<DirectoryState, Error> {
    let pid = process::my_pid();

    info!("using work dir {:?}", paths.topdir);

    if tools::directory_exists(&paths.topdir) {
        if let Some(on_file_pid) = process::read_pidfile(&paths.pidfile)? {
            return Err(WorkDirError::AlreadyRunning {
                dir: paths.topdir.clone(),
                pid: on_file_pid,
            }
            .into());
        }
    }

    let mut state = DirectoryState::default();
    let remove_dir = restart;

    if !restart {
        state = inspect_workdir(paths);

        if state.directory_exists && state.directory_is_ready {
            if !state.schema_dump_is_done {
                info!("schema dump has not been done yet, just continuing");
            } else if resume {
                let stale = count_stale_locks(&paths.tbldir) + count_stale_locks(&paths.idxdir);
                if stale > 0 {
                    warn!("found {} in-progress items from a previous run", stale);
                }
            } else if state.all_done {
                return Err(WorkDirError::NothingToDo.into());
            } else {
                return Err(WorkDirError::NeedsResumeOrRestart.into());
            }
        }
    }

    if remove_dir {
        info!("removing directory {:?}", paths.topdir);
        tools::ensure_empty_dir(&paths.topdir)?;
        state = DirectoryState::default();
    } else {
        tools::ensure_dir(&paths.topdir)?;
    }

    let pidfile = if auxiliary {
        &paths.aux_pidfile
    } else {
        &paths.pidfile
    };
    process::create_pidfile(pidfile, pid)
        .with_context(|| format!("unable to create pidfile {:?}", pidfile))?;

    for dir in paths.subdirs().iter() {
        tools::ensure_dir(dir)?;
    }
    tools::ensure_dir(&paths.cdc.dir)?;

    Ok(state)
}

/// Remove our pidfile at the end of the run; failure is not fatal.
pub fn release_workdir(paths: &CopyFilePaths, auxiliary: bool) {
    let pidfile = if auxiliary {
        &paths.aux_pidfile
    } else {
        &paths.pidfile
    };

    if let Err(err) = std::fs::remove_file(pidfile) {
        warn!("unable to remove pidfile {:?} - {}", pidfile, err);
    }
}

/// Read the snapshot file left behind by a previous run, if any.
pub fn read_snapshot_file(paths: &CopyFilePaths) -> Result<Option<String>, Error> {
    if !tools::file_exists(&paths.snapshot_file) {
        return Ok(None);
    }

    let name = tools::file_get_contents(&paths.snapshot_file)?;
    let name = name.trim().to_string();

    if name.is_empty() {
        return Err(format_err!(
            "snapshot file {:?} is empty",
            paths.snapshot_file
        ));
    }

    Ok(Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths(dir: &Path) -> CopyFilePaths {
        CopyFilePaths::new(Some(dir.to_path_buf())).unwrap()
    }

    fn make_ready(paths: &CopyFilePaths) {
        for dir in paths.subdirs().iter() {
            tools::ensure_dir(dir).unwrap();
        }
    }

    #[test]
    fn layout_matches_the_ledger_contract() {
        let paths = test_paths(Path::new("/tmp/pgclone-layout"));

        assert_eq!(paths.pidfile, Path::new("/tmp/pgclone-layout/pgclone.pid"));
        assert_eq!(
            paths.done.tables,
            Path::new("/tmp/pgclone-layout/run/tables.done")
        );

        let table = TableFilePaths::for_part(&paths, 16384, 2);
        assert_eq!(
            table.lock_file,
            Path::new("/tmp/pgclone-layout/run/tables/16384.2")
        );
        assert_eq!(
            table.done_file,
            Path::new("/tmp/pgclone-layout/run/tables/16384.2.done")
        );
        assert_eq!(
            table.idx_list_file,
            Path::new("/tmp/pgclone-layout/run/tables/16384.idx")
        );
        assert_eq!(
            table.truncate_done_file,
            Path::new("/tmp/pgclone-layout/run/tables/16384.truncate")
        );

        // the CDC files live under the explicit dir
        assert_eq!(paths.cdc.dir, Path::new("/tmp/pgclone-layout/cdc"));
    }

    #[test]
    fn index_paths_without_constraint() {
        let paths = test_paths(Path::new("/tmp/pgclone-idx"));
        let index = IndexFilePaths::new(&paths, 20001, 0);

        assert!(index.constraint_done_file.is_none());
        assert_eq!(
            index.done_file,
            Path::new("/tmp/pgclone-idx/run/indexes/20001.done")
        );
    }

    #[test]
    fn inspect_empty_then_partial_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        let state = inspect_workdir(&paths);
        assert!(state.directory_exists);
        assert!(!state.directory_is_ready);

        make_ready(&paths);
        let state = inspect_workdir(&paths);
        assert!(state.directory_is_ready);
        assert!(!state.schema_dump_is_done);
        assert!(!state.all_done);

        for file in &[
            &paths.done.pre_data_dump,
            &paths.done.post_data_dump,
            &paths.done.pre_data_restore,
            &paths.done.post_data_restore,
            &paths.done.tables,
            &paths.done.indexes,
            &paths.done.sequences,
            &paths.done.blobs,
        ] {
            tools::touch(file).unwrap();
        }

        let state = inspect_workdir(&paths);
        assert!(state.all_done);
    }

    #[test]
    fn partial_state_requires_resume() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        make_ready(&paths);

        tools::touch(&paths.done.pre_data_dump).unwrap();
        tools::touch(&paths.done.post_data_dump).unwrap();

        let err = init_workdir(&paths, false, false, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::NeedsResumeOrRestart)
        ));

        // with --resume the same state is fine
        init_workdir(&paths, false, true, false).unwrap();
    }

    #[test]
    fn all_done_requires_restart() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        make_ready(&paths);

        for file in &[
            &paths.done.pre_data_dump,
            &paths.done.post_data_dump,
            &paths.done.pre_data_restore,
            &paths.done.post_data_restore,
            &paths.done.tables,
            &paths.done.indexes,
            &paths.done.sequences,
            &paths.done.blobs,
        ] {
            tools::touch(file).unwrap();
        }

        let err = init_workdir(&paths, false, true, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkDirError>(),
            Some(WorkDirError::NothingToDo)
        ));

        // --restart wipes the ledger
        let state = init_workdir(&paths, true, false, false).unwrap();
        assert!(!state.all_done);
        assert!(!tools::file_exists(&paths.done.tables));
        assert!(tools::file_exists(&paths.pidfile));
    }

    #[test]
    fn fresh_directory_just_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir.path().join("fresh"));

        let state = init_workdir(&paths, false, false, false).unwrap();
        assert!(!state.directory_exists);
        assert!(tools::directory_exists(&paths.tbldir));
    }

    #[test]
    fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());

        assert!(read_snapshot_file(&paths).unwrap().is_none());

        tools::file_set_contents(&paths.snapshot_file, b"00000003-0000001B-1\n").unwrap();
        assert_eq!(
            read_snapshot_file(&paths).unwrap().unwrap(),
            "00000003-0000001B-1"
        );
    }
}
