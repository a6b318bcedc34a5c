//! Receive side of the stream: pull decoded messages from the logical
//! replication slot, wrap them into JSON lines with a metadata header,
//! and rotate the output file on every WAL segment switch.
//!
//! Feedback is explicit: the slot only advances past a message once the
//! JSON file holding it has been flushed to disk, so a crash replays
//! messages instead of losing them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info, warn};
use postgres::Client;

use crate::ipc::{Queue, QueueMessage};
use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::tools;

use super::transform;
use super::{Lsn, LogicalMessageMetadata, OutputPlugin, StreamAction, StreamSpecs};

/// How many decoded messages one poll round may return.
const PEEK_BATCH_SIZE: i32 = 1000;

/// Idle sleep between empty poll rounds.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct StreamCounters {
    pub total: u64,
    pub begin: u64,
    pub commit: u64,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
    pub truncate: u64,
}

impl StreamCounters {
    fn account(&mut self, action: StreamAction) {
        self.total += 1;
        match action {
            StreamAction::Begin => self.begin += 1,
            StreamAction::Commit => self.commit += 1,
            StreamAction::Insert => self.insert += 1,
            StreamAction::Update => self.update += 1,
            StreamAction::Delete => self.delete += 1,
            StreamAction::Truncate => self.truncate += 1,
            _ => {}
        }
    }
}

struct OpenJsonFile {
    writer: BufWriter<File>,
    first_lsn: Lsn,
}

/// The receive state: current JSON file, feedback positions, counters and
/// the queue feeding the transform subprocess.
struct StreamContext {
    specs: StreamSpecs,
    wal_segment_size: u64,
    file: Option<OpenJsonFile>,
    last_lsn: Lsn,
    last_timestamp: String,
    counters: StreamCounters,
    transform_queue: Queue,
}

impl StreamContext {
    fn open_file(&mut self, lsn: Lsn) -> Result<(), Error> {
        let first_lsn = lsn.segment_start(self.wal_segment_size);
        let path = self.specs.paths.json_partial_file(first_lsn);

        debug!("opening {:?}", path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("unable to open {:?}", path))?;

        self.file = Some(OpenJsonFile {
            writer: BufWriter::new(file),
            first_lsn,
        });

        Ok(())
    }

    /// Close the current file, promote it from `.partial` to its final
    /// name, and hand it to the transform subprocess.
    fn close_file(&mut self) -> Result<(), Error> {
        let open = match self.file.take() {
            Some(open) => open,
            None => return Ok(()),
        };

        let OpenJsonFile { writer, first_lsn } = open;

        let file = writer
            .into_inner()
            .map_err(|err| format_err!("unable to flush JSON file - {}", err))?;
        file.sync_data().context("fsync of JSON file failed")?;
        drop(file);

        let partial = self.specs.paths.json_partial_file(first_lsn);
        let done = self.specs.paths.json_file(first_lsn);

        std::fs::rename(&partial, &done)
            .with_context(|| format!("unable to rename {:?} to {:?}", partial, done))?;

        info!("closed {:?}", done);

        self.transform_queue.send(&QueueMessage::File(first_lsn.0))?;

        Ok(())
    }

    /// The write callback: rotate on a WAL switch, then append one line.
    fn write_message(
        &mut self,
        metadata: &LogicalMessageMetadata,
        line: &str,
    ) -> Result<(), Error> {
        if self.file.is_none() {
            self.open_file(metadata.lsn)?;
        }

        let current_segment = self.file.as_ref().expect("open file").first_lsn;
        let message_segment = metadata.lsn.segment_start(self.wal_segment_size);

        if message_segment != current_segment {
            // a WAL switch: mark the old file, ship it, open the next one
            let switch = LogicalMessageMetadata {
                action: StreamAction::SwitchWal,
                xid: 0,
                lsn: message_segment,
                timestamp: self.last_timestamp.clone(),
                filter_out: false,
            };
            let switch_line = serde_json::to_string(&switch)?;
            self.append_line(&switch_line)?;
            self.counters.account(StreamAction::SwitchWal);

            self.close_file()?;
            self.open_file(metadata.lsn)?;
        }

        self.append_line(line)?;
        self.counters.account(metadata.action);

        self.last_lsn = self.last_lsn.max(metadata.lsn);
        if !metadata.timestamp.is_empty() {
            self.last_timestamp = metadata.timestamp.clone();
        }

        Ok(())
    }

    fn append_line(&mut self, line: &str) -> Result<(), Error> {
        let open = self.file.as_mut().expect("open file");
        open.writer.write_all(line.as_bytes())?;
        open.writer.write_all(b"\n")?;
        Ok(())
    }

    /// The flush callback: everything written so far becomes durable.
    fn flush(&mut self) -> Result<(), Error> {
        if let Some(open) = self.file.as_mut() {
            open.writer.flush()?;
            open.writer.get_ref().sync_data().context("fsync failed")?;
        }
        Ok(())
    }
}

/// Create the replication slot when it does not exist yet; returns its
/// consistent point (existing slots report their confirmed position).
pub fn create_replication_slot(
    client: &mut Client,
    slot_name: &str,
    plugin: OutputPlugin,
) -> Result<Lsn, Error> {
    let existing = client.query_opt(
        "SELECT confirmed_flush_lsn::text \
           FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
        &[&slot_name],
    )?;

    if let Some(row) = existing {
        let lsn: String = row.get(0);
        info!("replication slot {:?} already exists at {}", slot_name, lsn);
        return lsn.parse();
    }

    let row = client
        .query_one(
            "SELECT lsn::text \
               FROM pg_catalog.pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &plugin.to_string()],
        )
        .with_context(|| format!("unable to create replication slot {:?}", slot_name))?;

    let lsn: String = row.get(0);

    info!("created replication slot {:?} at {}", slot_name, lsn);

    lsn.parse()
}

pub fn drop_replication_slot(client: &mut Client, slot_name: &str) -> Result<(), Error> {
    let dropped = client.execute(
        "SELECT pg_catalog.pg_drop_replication_slot(slot_name) \
           FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
        &[&slot_name],
    )?;

    if dropped > 0 {
        info!("dropped replication slot {:?}", slot_name);
    }

    Ok(())
}

fn slot_confirmed_lsn(client: &mut Client, slot_name: &str) -> Result<Lsn, Error> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text \
               FROM pg_catalog.pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )?
        .ok_or_else(|| {
            format_err!(
                "replication slot {:?} does not exist; run the setup first",
                slot_name
            )
        })?;

    let lsn: String = row.get(0);
    lsn.parse()
}

/// Plugin options passed to every peek.
fn plugin_options(plugin: OutputPlugin) -> Vec<String> {
    match plugin {
        OutputPlugin::Wal2json => vec![
            "format-version".into(),
            "2".into(),
            "include-xids".into(),
            "true".into(),
            "include-timestamp".into(),
            "true".into(),
        ],
        OutputPlugin::TestDecoding => vec![
            "include-xids".into(),
            "1".into(),
            "include-timestamp".into(),
            "1".into(),
        ],
    }
}

/// One decoded message as the slot hands it out.
struct RawMessage {
    lsn: Lsn,
    xid: u32,
    data: String,
}

fn peek_changes(
    client: &mut Client,
    slot_name: &str,
    plugin: OutputPlugin,
) -> Result<Vec<RawMessage>, Error> {
    let options = plugin_options(plugin);

    let rows = client
        .query(
            "SELECT lsn::text, xid::text, data \
               FROM pg_catalog.pg_logical_slot_peek_changes($1, NULL, $2, VARIADIC $3::text[])",
            &[&slot_name, &PEEK_BATCH_SIZE, &options],
        )
        .context("pg_logical_slot_peek_changes failed")?;

    let mut messages = Vec::with_capacity(rows.len());

    for row in rows {
        let lsn: String = row.get(0);
        let xid: String = row.get(1);
        let data: String = row.get(2);

        messages.push(RawMessage {
            lsn: lsn.parse()?,
            xid: xid.parse().unwrap_or(0),
            data,
        });
    }

    Ok(messages)
}

/// Acknowledge durable progress back to the source.
fn advance_slot(client: &mut Client, slot_name: &str, lsn: Lsn) -> Result<(), Error> {
    if !lsn.is_valid() {
        return Ok(());
    }

    client
        .execute(
            "SELECT pg_catalog.pg_replication_slot_advance($1, $2::pg_lsn) \
              WHERE EXISTS (SELECT 1 FROM pg_catalog.pg_replication_slots \
                             WHERE slot_name = $1 AND confirmed_flush_lsn < $2::pg_lsn)",
            &[&slot_name, &lsn.to_string()],
        )
        .context("pg_replication_slot_advance failed")?;

    Ok(())
}

/// Wrap one raw message into the JSON-lines envelope. The lsn and xid
/// from the slot's own columns always win over whatever the plugin put in
/// the payload.
fn envelope(
    plugin: OutputPlugin,
    raw: &RawMessage,
) -> Result<(LogicalMessageMetadata, String), Error> {
    match plugin {
        OutputPlugin::Wal2json => {
            let mut value: serde_json::Value = serde_json::from_str(&raw.data)
                .with_context(|| format!("invalid wal2json message {:?}", raw.data))?;

            let object = value
                .as_object_mut()
                .ok_or_else(|| format_err!("wal2json message is not an object"))?;

            object.insert("lsn".into(), serde_json::json!(raw.lsn.to_string()));
            object.insert("xid".into(), serde_json::json!(raw.xid));

            let line = serde_json::to_string(&value)?;
            let (metadata, _) = super::parse_metadata(&line)?;

            Ok((metadata, line))
        }
        OutputPlugin::TestDecoding => {
            let (action, timestamp) = parse_test_decoding_action(&raw.data)?;

            let metadata = LogicalMessageMetadata {
                action,
                xid: raw.xid,
                lsn: raw.lsn,
                timestamp: timestamp.unwrap_or_default(),
                filter_out: false,
            };

            let mut value = serde_json::to_value(&metadata)?;
            value
                .as_object_mut()
                .expect("metadata object")
                .insert("message".into(), serde_json::json!(raw.data));

            Ok((metadata, serde_json::to_string(&value)?))
        }
    }
}

/// Classify a test_decoding text message, extracting the commit timestamp
/// when the plugin includes one.
fn parse_test_decoding_action(data: &str) -> Result<(StreamAction, Option<String>), Error> {
    if data.starts_with("BEGIN") {
        return Ok((StreamAction::Begin, None));
    }

    if data.starts_with("COMMIT") {
        let timestamp = data
            .find("(at ")
            .map(|at| data[at + 4..].trim_end_matches(')').to_string());
        return Ok((StreamAction::Commit, timestamp));
    }

    if data.starts_with("message:") {
        return Ok((StreamAction::Message, None));
    }

    if data.starts_with("table ") {
        let action = if data.contains(": INSERT:") {
            StreamAction::Insert
        } else if data.contains(": UPDATE:") {
            StreamAction::Update
        } else if data.contains(": DELETE:") {
            StreamAction::Delete
        } else if data.contains(": TRUNCATE") {
            StreamAction::Truncate
        } else {
            bail!("unknown test_decoding message {:?}", data);
        };
        return Ok((action, None));
    }

    bail!("unknown test_decoding message {:?}", data)
}

/// Stream from the slot until a signal or --endpos stops us.
pub fn run_receive(specs: &StreamSpecs) -> Result<(), Error> {
    let mut src = pgsql::connect(&specs.source_pguri, ConnKind::Source)?;

    tools::ensure_dir(&specs.paths.dir)?;

    // make sure the on-disk context agrees with the server
    let wal_segment_size = pgsql::wal_segment_size(&mut src)?;
    let timeline = pgsql::timeline_id(&mut src)?;

    if tools::file_exists(&specs.paths.wal_segsize_file) {
        let (_, disk_tli, disk_segsize) = super::read_stream_context(&specs.paths)?;

        if disk_segsize != wal_segment_size {
            bail!(
                "wal_segment_size changed from {} to {}; \
                 the streaming files cannot be resumed",
                disk_segsize,
                wal_segment_size
            );
        }

        if disk_tli != timeline {
            warn!("timeline changed from {} to {}", disk_tli, timeline);
        }
    }

    super::write_stream_context(&specs.paths, &specs.origin, timeline, wal_segment_size)?;

    let start_lsn = slot_confirmed_lsn(&mut src, &specs.slot_name)?;

    info!(
        "streaming changes from slot {:?}, starting at {}",
        specs.slot_name, start_lsn
    );

    let transform_queue = Queue::new()?;
    let transform_paths = specs.paths.clone();
    let transform_pid = process::fork_worker("stream-transform", move || {
        transform::transform_worker(&transform_paths, transform_queue)
    })?;

    let mut context = StreamContext {
        specs: specs.clone(),
        wal_segment_size,
        file: None,
        last_lsn: start_lsn,
        last_timestamp: String::new(),
        counters: StreamCounters::default(),
        transform_queue,
    };

    context.open_file(start_lsn)?;

    let outcome = receive_loop(&mut src, specs, &mut context);

    // wind down in order: close the file, then stop the transformer
    let close = context.close_file();
    let stop = context.transform_queue.send_stop(1);
    let transform_ok = process::wait_for_pids(&[transform_pid])?;

    let counters = &context.counters;
    info!(
        "streamed {} messages: {} begin, {} commit, {} insert, {} update, {} delete, {} truncate",
        counters.total,
        counters.begin,
        counters.commit,
        counters.insert,
        counters.update,
        counters.delete,
        counters.truncate
    );

    outcome?;
    close?;
    stop?;

    if !transform_ok {
        bail!("the transform subprocess failed");
    }

    Ok(())
}

fn receive_loop(
    src: &mut Client,
    specs: &StreamSpecs,
    context: &mut StreamContext,
) -> Result<(), Error> {
    loop {
        if process::asked_to_quit() {
            info!("received a termination signal, closing the stream");
            return Ok(());
        }

        // read the keepalive candidate before peeking: only positions
        // known to carry no pending output may be skipped over
        let keepalive_lsn = pgsql::current_wal_lsn(src)?;

        let batch = peek_changes(src, &specs.slot_name, specs.plugin)?;

        if batch.is_empty() {
            if keepalive_lsn > context.last_lsn {
                let keepalive = LogicalMessageMetadata {
                    action: StreamAction::Keepalive,
                    xid: 0,
                    lsn: keepalive_lsn,
                    timestamp: pgsql::server_now(src)?,
                    filter_out: false,
                };
                let line = serde_json::to_string(&keepalive)?;
                context.write_message(&keepalive, &line)?;
                context.flush()?;
                advance_slot(src, &specs.slot_name, keepalive_lsn)?;
            }

            if reached_endpos(specs, context.last_lsn) {
                return Ok(());
            }

            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        for raw in &batch {
            let (metadata, line) = envelope(specs.plugin, raw)?;
            context.write_message(&metadata, &line)?;
        }

        context.flush()?;
        advance_slot(src, &specs.slot_name, context.last_lsn)?;

        if reached_endpos(specs, context.last_lsn) {
            info!("reached the end position {}", context.last_lsn);
            return Ok(());
        }
    }
}

fn reached_endpos(specs: &StreamSpecs, lsn: Lsn) -> bool {
    match specs.endpos {
        Some(endpos) => endpos.is_valid() && lsn >= endpos,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal2json_envelope_injects_slot_metadata() {
        let raw = RawMessage {
            lsn: "0/24E3F28".parse().unwrap(),
            xid: 523,
            data: r#"{"action":"I","schema":"public","table":"users","columns":[{"name":"id","type":"bigint","value":7}]}"#
                .into(),
        };

        let (metadata, line) = envelope(OutputPlugin::Wal2json, &raw).unwrap();

        assert_eq!(metadata.action, StreamAction::Insert);
        assert_eq!(metadata.xid, 523);
        assert_eq!(metadata.lsn, Lsn(0x24E3F28));

        // the envelope keeps the payload and gains the header fields
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["xid"], serde_json::json!(523));
        assert_eq!(value["lsn"], serde_json::json!("0/24E3F28"));
        assert_eq!(value["table"], serde_json::json!("users"));
    }

    #[test]
    fn test_decoding_envelope_wraps_the_raw_message() {
        let raw = RawMessage {
            lsn: "0/24E3F60".parse().unwrap(),
            xid: 523,
            data: "table public.users: INSERT: id[bigint]:7 name[text]:'ada'".into(),
        };

        let (metadata, line) = envelope(OutputPlugin::TestDecoding, &raw).unwrap();

        assert_eq!(metadata.action, StreamAction::Insert);

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], serde_json::json!("I"));
        assert_eq!(
            value["message"],
            serde_json::json!("table public.users: INSERT: id[bigint]:7 name[text]:'ada'")
        );
    }

    #[test]
    fn test_decoding_actions() {
        let (action, _) = parse_test_decoding_action("BEGIN 529").unwrap();
        assert_eq!(action, StreamAction::Begin);

        let (action, timestamp) =
            parse_test_decoding_action("COMMIT 529 (at 2022-06-27 14:42:21.795714+00)").unwrap();
        assert_eq!(action, StreamAction::Commit);
        assert_eq!(
            timestamp.unwrap(),
            "2022-06-27 14:42:21.795714+00"
        );

        let (action, _) =
            parse_test_decoding_action("table public.t: TRUNCATE: (no-flags)").unwrap();
        assert_eq!(action, StreamAction::Truncate);

        assert!(parse_test_decoding_action("gibberish").is_err());
    }

    #[test]
    fn rotation_happens_on_segment_switch() {
        let dir = tempfile::tempdir().unwrap();
        let wal_segment_size: u64 = 16 * 1024 * 1024;

        let paths = crate::workdir::CdcPaths {
            dir: dir.path().to_path_buf(),
            origin_file: dir.path().join("origin"),
            tli_file: dir.path().join("tli"),
            tli_hist_file: dir.path().join("tli.history"),
            wal_segsize_file: dir.path().join("wal_segment_size"),
        };

        let specs = StreamSpecs {
            paths,
            source_pguri: "postgres://localhost/src".into(),
            target_pguri: "postgres://localhost/dst".into(),
            plugin: OutputPlugin::Wal2json,
            slot_name: "pgclone".into(),
            origin: "pgclone".into(),
            endpos: None,
        };

        let queue = Queue::new().unwrap();
        let mut context = StreamContext {
            specs: specs.clone(),
            wal_segment_size,
            file: None,
            last_lsn: Lsn::INVALID,
            last_timestamp: String::new(),
            counters: StreamCounters::default(),
            transform_queue: queue,
        };

        let in_first_segment = LogicalMessageMetadata {
            action: StreamAction::Insert,
            xid: 1,
            lsn: Lsn(0x1000100),
            timestamp: "2022-06-27 14:42:21.795714+00".into(),
            filter_out: false,
        };
        context
            .write_message(&in_first_segment, r#"{"action":"I"}"#)
            .unwrap();

        let in_second_segment = LogicalMessageMetadata {
            action: StreamAction::Insert,
            xid: 2,
            lsn: Lsn(0x2000040),
            timestamp: "2022-06-27 14:42:22.000000+00".into(),
            filter_out: false,
        };
        context
            .write_message(&in_second_segment, r#"{"action":"I"}"#)
            .unwrap();

        context.flush().unwrap();

        // the first file got its final name and went on the queue
        let first = specs.paths.json_file(Lsn(0x1000000));
        assert!(first.exists());
        assert_eq!(queue.recv().unwrap(), QueueMessage::File(0x1000000));

        // it ends with the switch marker
        let contents = tools::file_get_contents(&first).unwrap();
        let last_line = contents.lines().last().unwrap();
        assert!(last_line.contains(r#""action":"X""#));
        assert!(last_line.contains(r#""lsn":"0/2000000""#));

        // the second file is still partial
        assert!(specs.paths.json_partial_file(Lsn(0x2000000)).exists());

        context.close_file().unwrap();
        assert_eq!(queue.recv().unwrap(), QueueMessage::File(0x2000000));
        queue.close();
    }
}
