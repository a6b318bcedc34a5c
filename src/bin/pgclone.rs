use std::path::PathBuf;

use anyhow::Error;
use clap::{Args, Parser, Subcommand};
use log::error;

use pgclone::cdc::{self, Lsn, OutputPlugin, StreamSpecs};
use pgclone::clone;
use pgclone::config::CopySpecs;
use pgclone::workdir::CopyFilePaths;
use pgclone::Section;

#[derive(Parser)]
#[command(
    name = "pgclone",
    version,
    about = "Copy a PostgreSQL database between two instances, in parallel"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CloneArgs {
    /// Connection string to the source database
    source: String,

    /// Connection string to the target database
    target: String,

    /// Work directory (defaults to $TMPDIR/pgclone)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// How many COPY processes run concurrently
    #[arg(long, default_value_t = 4)]
    table_jobs: usize,

    /// How many CREATE INDEX processes run concurrently
    #[arg(long, default_value_t = 4)]
    index_jobs: usize,

    /// Split tables larger than this size into same-size COPY partitions
    /// (e.g. 10GB; 0 disables splitting)
    #[arg(long, default_value = "0", value_parser = parse_pretty_size)]
    split_tables_larger_than: u64,

    /// Resume an interrupted run, re-using its work directory
    #[arg(long)]
    resume: bool,

    /// Remove a previous run's work directory and start over
    #[arg(long)]
    restart: bool,

    /// Do not use a shared snapshot across the COPY processes
    #[arg(long = "not-consistent")]
    not_consistent: bool,

    /// Re-use an already exported snapshot (also: PGCLONE_SNAPSHOT)
    #[arg(long)]
    snapshot: Option<String>,

    /// Skip copying large objects
    #[arg(long)]
    skip_large_objects: bool,

    /// Skip creating extensions on the target
    #[arg(long)]
    skip_extensions: bool,

    /// Also copy roles with pg_dumpall --roles-only
    #[arg(long)]
    roles: bool,

    /// Which part of the copy to run
    #[arg(long, default_value = "all", value_parser = parse_section)]
    section: Section,
}

#[derive(Args, Debug, Clone)]
struct StreamArgs {
    /// Logical replication slot name on the source
    #[arg(long, default_value = "pgclone")]
    slot: String,

    /// Replication origin name on the target
    #[arg(long, default_value = "pgclone")]
    origin: String,

    /// Logical decoding output plugin
    #[arg(long, default_value = "wal2json", value_parser = parse_plugin)]
    plugin: OutputPlugin,

    /// Stop once this WAL position has been reached
    #[arg(long, value_parser = parse_lsn)]
    endpos: Option<Lsn>,
}

#[derive(Subcommand)]
enum Command {
    /// Clone a whole database from the source to the target
    Clone {
        #[command(flatten)]
        args: CloneArgs,

        /// After the base copy, stream and replay the changes
        #[arg(long)]
        follow: bool,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Export a snapshot and hold it open until signaled
    Snapshot {
        /// Connection string to the source database
        source: String,

        /// Work directory (defaults to $TMPDIR/pgclone)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Stream and replay changes for an already cloned database
    Follow {
        #[command(flatten)]
        args: CloneArgs,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Operate the change data capture pipeline one stage at a time
    Stream {
        #[command(subcommand)]
        command: StreamCommand,
    },
}

#[derive(Subcommand)]
enum StreamCommand {
    /// Receive decoded changes into JSON files, rotated per WAL segment
    Receive {
        /// Connection string to the source database
        source: String,

        /// Work directory (defaults to $TMPDIR/pgclone)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Transform one JSON file into its SQL script
    Transform {
        /// The <lsn>.json input file
        json: PathBuf,

        /// The <lsn>.sql output file
        sql: PathBuf,
    },

    /// Replay the SQL scripts on the target, following the sentinel
    Replay {
        /// Connection string to the source database
        source: String,

        /// Connection string to the target database
        target: String,

        /// Work directory (defaults to $TMPDIR/pgclone)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[command(flatten)]
        stream: StreamArgs,
    },
}

fn parse_pretty_size(input: &str) -> Result<u64, String> {
    pgclone::tools::parse_pretty_size(input).map_err(|err| err.to_string())
}

fn parse_section(input: &str) -> Result<Section, String> {
    input.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_plugin(input: &str) -> Result<OutputPlugin, String> {
    input.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn parse_lsn(input: &str) -> Result<Lsn, String> {
    input.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn copy_specs(args: &CloneArgs) -> Result<CopySpecs, Error> {
    CopySpecs::new(
        args.source.clone(),
        args.target.clone(),
        args.dir.clone(),
        args.table_jobs,
        args.index_jobs,
        args.split_tables_larger_than,
        args.section,
        args.snapshot.clone(),
        args.roles,
        args.skip_large_objects,
        args.skip_extensions,
        args.restart,
        args.resume,
        !args.not_consistent,
    )
}

fn stream_specs(specs: &CopySpecs, stream: &StreamArgs) -> StreamSpecs {
    StreamSpecs::from_copy_specs(
        specs,
        stream.plugin,
        stream.slot.clone(),
        stream.origin.clone(),
        stream.endpos,
    )
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Clone {
            args,
            follow,
            stream,
        } => {
            let specs = copy_specs(&args)?;
            let follow_specs = if follow {
                Some(stream_specs(&specs, &stream))
            } else {
                None
            };
            clone::run_clone(specs, follow_specs)
        }

        Command::Snapshot { source, dir } => {
            let specs = CopySpecs::new(
                source.clone(),
                source,
                dir,
                1,
                1,
                0,
                Section::All,
                None,
                false,
                false,
                false,
                false,
                false,
                true,
            )?;
            clone::run_snapshot(specs)
        }

        Command::Follow { args, stream } => {
            let specs = copy_specs(&args)?;
            let stream_specs = stream_specs(&specs, &stream);

            pgclone::process::install_signal_handlers()?;
            cdc::setup_databases(&stream_specs)?;
            cdc::run_follow(&stream_specs)
        }

        Command::Stream { command } => match command {
            StreamCommand::Receive {
                source,
                dir,
                stream,
            } => {
                let paths = CopyFilePaths::new(dir)?;

                pgclone::process::install_signal_handlers()?;
                cdc::receive::run_receive(&StreamSpecs {
                    paths: paths.cdc,
                    source_pguri: source.clone(),
                    target_pguri: source,
                    plugin: stream.plugin,
                    slot_name: stream.slot,
                    origin: stream.origin,
                    endpos: stream.endpos,
                })
            }

            StreamCommand::Transform { json, sql } => cdc::transform::transform_file(&json, &sql),

            StreamCommand::Replay {
                source,
                target,
                dir,
                stream,
            } => {
                let paths = CopyFilePaths::new(dir)?;

                pgclone::process::install_signal_handlers()?;
                cdc::apply::run_apply(&StreamSpecs {
                    paths: paths.cdc,
                    source_pguri: source,
                    target_pguri: target,
                    plugin: stream.plugin,
                    slot_name: stream.slot,
                    origin: stream.origin,
                    endpos: stream.endpos,
                })
            }
        },
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
