//! Change data capture: stream logical decoding output from the source,
//! transform it into SQL scripts, and replay those on the target with
//! replication-origin bookkeeping.
//!
//! The pipeline is three processes: receive writes JSON-lines files
//! rotated per WAL segment, a transform subprocess turns each rotated
//! file into an ordered SQL script, and apply replays the scripts inside
//! a replication origin session so that replay is idempotent.

pub mod apply;
pub mod receive;
pub mod sentinel;
pub mod transform;

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Context, Error};
use log::{info, warn};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::CopySpecs;
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::tools;
use crate::workdir::CdcPaths;

/// A position in the source's write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn segment_number(self, wal_segment_size: u64) -> u64 {
        self.0 / wal_segment_size
    }

    /// First position of the WAL segment containing this position.
    pub fn segment_start(self, wal_segment_size: u64) -> Lsn {
        Lsn(self.0 - self.0 % wal_segment_size)
    }

    /// Zero-padded hex, the basename of the on-disk JSON and SQL files.
    pub fn wal_file_basename(self) -> String {
        format!("{:016X}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut halves = s.trim().split('/');

        let hi = halves
            .next()
            .and_then(|part| u64::from_str_radix(part, 16).ok());
        let lo = halves
            .next()
            .and_then(|part| u64::from_str_radix(part, 16).ok());

        match (hi, lo, halves.next()) {
            (Some(hi), Some(lo), None) if lo <= u64::from(u32::MAX) => {
                Ok(Lsn((hi << 32) | lo))
            }
            _ => bail!("invalid LSN {:?}", s),
        }
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// One letter per logical decoding event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Truncate,
    Message,
    SwitchWal,
    Keepalive,
}

impl StreamAction {
    pub fn as_char(self) -> char {
        match self {
            StreamAction::Begin => 'B',
            StreamAction::Commit => 'C',
            StreamAction::Insert => 'I',
            StreamAction::Update => 'U',
            StreamAction::Delete => 'D',
            StreamAction::Truncate => 'T',
            StreamAction::Message => 'M',
            StreamAction::SwitchWal => 'X',
            StreamAction::Keepalive => 'K',
        }
    }

    pub fn from_char(c: char) -> Result<Self, Error> {
        Ok(match c {
            'B' => StreamAction::Begin,
            'C' => StreamAction::Commit,
            'I' => StreamAction::Insert,
            'U' => StreamAction::Update,
            'D' => StreamAction::Delete,
            'T' => StreamAction::Truncate,
            'M' => StreamAction::Message,
            'X' => StreamAction::SwitchWal,
            'K' => StreamAction::Keepalive,
            other => bail!("unknown stream action {:?}", other),
        })
    }
}

impl Serialize for StreamAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_char().to_string())
    }
}

impl<'de> Deserialize<'de> for StreamAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut chars = text.chars();

        match (chars.next(), chars.next()) {
            (Some(c), None) => StreamAction::from_char(c).map_err(D::Error::custom),
            _ => Err(D::Error::custom(format!("invalid stream action {:?}", text))),
        }
    }
}

/// The metadata header extracted from (or injected into) every JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessageMetadata {
    pub action: StreamAction,
    #[serde(default)]
    pub xid: u32,
    #[serde(default = "Lsn::default")]
    pub lsn: Lsn,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub filter_out: bool,
}

/// Parse one JSON line into its metadata header plus the full object.
pub fn parse_metadata(line: &str) -> Result<(LogicalMessageMetadata, serde_json::Value), Error> {
    let value: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("invalid JSON line {:?}", line))?;

    let metadata: LogicalMessageMetadata = serde_json::from_value(value.clone())
        .with_context(|| format!("missing metadata in {:?}", line))?;

    Ok((metadata, value))
}

/// Logical decoding output plugins we know how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPlugin {
    Wal2json,
    TestDecoding,
}

impl FromStr for OutputPlugin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "wal2json" => Ok(OutputPlugin::Wal2json),
            "test_decoding" => Ok(OutputPlugin::TestDecoding),
            other => bail!("unknown output plugin {:?}", other),
        }
    }
}

impl fmt::Display for OutputPlugin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputPlugin::Wal2json => write!(f, "wal2json"),
            OutputPlugin::TestDecoding => write!(f, "test_decoding"),
        }
    }
}

/// Everything the streaming commands need to know.
#[derive(Debug, Clone)]
pub struct StreamSpecs {
    pub paths: CdcPaths,
    pub source_pguri: String,
    pub target_pguri: String,
    pub plugin: OutputPlugin,
    pub slot_name: String,
    pub origin: String,
    pub endpos: Option<Lsn>,
}

impl StreamSpecs {
    pub fn from_copy_specs(
        specs: &CopySpecs,
        plugin: OutputPlugin,
        slot_name: String,
        origin: String,
        endpos: Option<Lsn>,
    ) -> Self {
        StreamSpecs {
            paths: specs.paths.cdc.clone(),
            source_pguri: specs.source_pguri.clone(),
            target_pguri: specs.target_pguri.clone(),
            plugin,
            slot_name,
            origin,
            endpos,
        }
    }
}

/// Persist the streaming context next to the JSON files so that resumed
/// commands agree with the original run on segment arithmetic.
pub fn write_stream_context(
    paths: &CdcPaths,
    origin: &str,
    timeline: u32,
    wal_segment_size: u64,
) -> Result<(), Error> {
    tools::ensure_dir(&paths.dir)?;

    tools::file_set_contents(&paths.origin_file, format!("{}\n", origin).as_bytes())?;
    tools::file_set_contents(&paths.tli_file, format!("{}\n", timeline).as_bytes())?;
    tools::file_set_contents(
        &paths.wal_segsize_file,
        format!("{}\n", wal_segment_size).as_bytes(),
    )?;

    Ok(())
}

/// Read back the persisted streaming context.
pub fn read_stream_context(paths: &CdcPaths) -> Result<(String, u32, u64), Error> {
    let origin = tools::file_get_contents(&paths.origin_file)?.trim().to_string();

    let timeline: u32 = tools::file_get_contents(&paths.tli_file)?
        .trim()
        .parse()
        .map_err(|_| format_err!("invalid timeline file {:?}", paths.tli_file))?;

    let wal_segment_size: u64 = tools::file_get_contents(&paths.wal_segsize_file)?
        .trim()
        .parse()
        .map_err(|_| {
            format_err!("invalid wal_segment_size file {:?}", paths.wal_segsize_file)
        })?;

    Ok((origin, timeline, wal_segment_size))
}

/// Create the replication slot, the replication origin and the sentinel
/// row; returns the slot's consistent point, where streaming begins.
pub fn setup_databases(specs: &StreamSpecs) -> Result<Lsn, Error> {
    let mut src = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;
    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    let startpos = receive::create_replication_slot(&mut src, &specs.slot_name, specs.plugin)?;

    let timeline = pgsql::timeline_id(&mut src)?;
    let wal_segment_size = pgsql::wal_segment_size(&mut src)?;

    write_stream_context(&specs.paths, &specs.origin, timeline, wal_segment_size)?;

    apply::create_replication_origin(&mut dst, &specs.origin)?;

    sentinel::create_sentinel(&mut dst, startpos, specs.endpos.unwrap_or(Lsn::INVALID))?;

    info!(
        "streaming is set up: slot {:?} at {}, origin {:?}",
        specs.slot_name, startpos, specs.origin
    );

    Ok(startpos)
}

/// Drop the replication slot, the origin and the sentinel. Used by
/// --restart and at the clean end of a follow run.
pub fn cleanup_databases(specs: &StreamSpecs) -> Result<(), Error> {
    let mut src = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;
    let mut dst = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    if let Err(err) = receive::drop_replication_slot(&mut src, &specs.slot_name) {
        warn!("unable to drop replication slot: {:#}", err);
    }

    if let Err(err) = apply::drop_replication_origin(&mut dst, &specs.origin) {
        warn!("unable to drop replication origin: {:#}", err);
    }

    if let Err(err) = sentinel::drop_sentinel(&mut dst) {
        warn!("unable to drop the sentinel: {:#}", err);
    }

    Ok(())
}

/// Follow mode: receive (with its transform subprocess) and apply run as
/// sibling processes until the sentinel's endpos is reached or a signal
/// stops the run.
pub fn run_follow(specs: &StreamSpecs) -> Result<(), Error> {
    let receive_specs = specs.clone();
    let receive_pid = process::fork_worker("stream-receive", move || {
        receive::run_receive(&receive_specs)
    })?;

    let apply_specs = specs.clone();
    let apply_pid =
        process::fork_worker("stream-apply", move || apply::run_apply(&apply_specs))?;

    // apply decides when the run is over (endpos reached, or a signal);
    // the receiver is then told to wind down too
    let apply_ok = process::wait_for_pids(&[apply_pid])?;

    let _ = nix::sys::signal::kill(receive_pid, nix::sys::signal::Signal::SIGTERM);
    let receive_ok = process::wait_for_pids(&[receive_pid])?;

    if !(apply_ok && receive_ok) {
        bail!("a streaming subprocess failed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_parse_and_format() {
        let lsn: Lsn = "0/24E3F28".parse().unwrap();
        assert_eq!(lsn.0, 0x24E3F28);
        assert_eq!(lsn.to_string(), "0/24E3F28");

        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16 << 32) | 0xB374D848);
        assert_eq!(lsn.to_string(), "16/B374D848");

        assert!("junk".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
        assert!("0/FFFFFFFF0".parse::<Lsn>().is_err());
    }

    #[test]
    fn lsn_segment_arithmetic() {
        let wal_segment_size = 16 * 1024 * 1024;

        let lsn: Lsn = "0/2000A28".parse().unwrap();
        assert_eq!(lsn.segment_number(wal_segment_size), 2);
        assert_eq!(lsn.segment_start(wal_segment_size), Lsn(0x2000000));
        assert_eq!(
            lsn.segment_start(wal_segment_size).wal_file_basename(),
            "0000000002000000"
        );

        // positions in the same segment share a file
        let other: Lsn = "0/2FFFFFF".parse().unwrap();
        assert_eq!(
            lsn.segment_number(wal_segment_size),
            other.segment_number(wal_segment_size)
        );

        // the next byte opens the next one
        let next: Lsn = "0/3000000".parse().unwrap();
        assert_eq!(next.segment_number(wal_segment_size), 3);
    }

    #[test]
    fn metadata_json_round_trip() {
        let line = r#"{"action":"I","xid":523,"lsn":"0/24E3F28","timestamp":"2022-06-27 14:42:21.795714+00","columns":[{"name":"id","type":"bigint","value":1}]}"#;

        let (metadata, value) = parse_metadata(line).unwrap();

        assert_eq!(metadata.action, StreamAction::Insert);
        assert_eq!(metadata.xid, 523);
        assert_eq!(metadata.lsn, Lsn(0x24E3F28));
        assert!(!metadata.filter_out);
        assert!(value.get("columns").is_some());
    }

    #[test]
    fn metadata_serializes_compactly() {
        let metadata = LogicalMessageMetadata {
            action: StreamAction::Keepalive,
            xid: 0,
            lsn: Lsn(0x1000000),
            timestamp: "2022-06-27 14:42:21.795714+00".into(),
            filter_out: false,
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains(r#""action":"K""#));
        assert!(json.contains(r#""lsn":"0/1000000""#));
        // the filter flag only shows up when set
        assert!(!json.contains("filter_out"));
    }

    #[test]
    fn stream_context_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CdcPaths {
            dir: dir.path().to_path_buf(),
            origin_file: dir.path().join("origin"),
            tli_file: dir.path().join("tli"),
            tli_hist_file: dir.path().join("tli.history"),
            wal_segsize_file: dir.path().join("wal_segment_size"),
        };

        write_stream_context(&paths, "pgclone", 3, 16 * 1024 * 1024).unwrap();

        let (origin, timeline, wal_segment_size) = read_stream_context(&paths).unwrap();
        assert_eq!(origin, "pgclone");
        assert_eq!(timeline, 3);
        assert_eq!(wal_segment_size, 16 * 1024 * 1024);
    }

    #[test]
    fn output_plugin_names() {
        assert_eq!("wal2json".parse::<OutputPlugin>().unwrap(), OutputPlugin::Wal2json);
        assert_eq!(
            "test_decoding".parse::<OutputPlugin>().unwrap(),
            OutputPlugin::TestDecoding
        );
        assert!("pgoutput".parse::<OutputPlugin>().is_err());
    }
}
