//! Apply side of the stream: replay the SQL files on the target inside a
//! replication origin session.
//!
//! Idempotence comes from the origin: every applied transaction runs
//! `pg_replication_origin_xact_setup` with its commit position before
//! COMMIT, so the recorded progress moves atomically with the data, and
//! transactions at or below the recorded position are skipped entirely.

use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use postgres::Client;
use regex::Regex;

use crate::pgsql::{self, ConnKind};
use crate::process;
use crate::tools;

use super::sentinel::{self, Sentinel};
use super::transform::{OUTPUT_BEGIN, OUTPUT_COMMIT, OUTPUT_KEEPALIVE, OUTPUT_SWITCHWAL};
use super::{Lsn, StreamSpecs};

const SENTINEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

lazy_static! {
    static ref KEEPALIVE_RE: Regex =
        Regex::new(r"^-- KEEPALIVE ([0-9A-Fa-f]+/[0-9A-Fa-f]+) (.+)$").unwrap();
    static ref SWITCHWAL_RE: Regex =
        Regex::new(r"^-- SWITCH WAL ([0-9A-Fa-f]+/[0-9A-Fa-f]+)$").unwrap();
}

/// Create the replication origin unless it already exists.
pub fn create_replication_origin(client: &mut Client, origin: &str) -> Result<(), Error> {
    let exists = client
        .query_opt(
            "SELECT roident FROM pg_catalog.pg_replication_origin WHERE roname = $1",
            &[&origin],
        )?
        .is_some();

    if exists {
        info!("replication origin {:?} already exists", origin);
        return Ok(());
    }

    client
        .execute("SELECT pg_catalog.pg_replication_origin_create($1)", &[&origin])
        .with_context(|| format!("unable to create replication origin {:?}", origin))?;

    info!("created replication origin {:?}", origin);

    Ok(())
}

pub fn drop_replication_origin(client: &mut Client, origin: &str) -> Result<(), Error> {
    let dropped = client.execute(
        "SELECT pg_catalog.pg_replication_origin_drop(roname) \
           FROM pg_catalog.pg_replication_origin WHERE roname = $1",
        &[&origin],
    )?;

    if dropped > 0 {
        info!("dropped replication origin {:?}", origin);
    }

    Ok(())
}

/// Last position this origin has applied, invalid when it never did.
fn origin_progress(client: &mut Client, origin: &str) -> Result<Lsn, Error> {
    let row = client.query_one(
        "SELECT coalesce(pg_catalog.pg_replication_origin_progress($1, false)::text, '0/0')",
        &[&origin],
    )?;

    let text: String = row.get(0);
    text.parse()
}

/// One transaction as read back from a SQL file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransaction {
    pub xid: u32,
    pub begin_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub timestamp: String,
    pub statements: Vec<String>,
}

/// The replayable content of a SQL file, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyItem {
    Transaction(FileTransaction),
    Keepalive { lsn: Lsn, timestamp: String },
    SwitchWal { lsn: Lsn },
}

/// Parse a transformed SQL file back into its replayable items.
pub fn parse_sql_file(contents: &str) -> Result<Vec<ApplyItem>, Error> {
    let mut items = Vec::new();
    let mut transaction: Option<FileTransaction> = None;

    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }

        if let Some(meta) = line.strip_prefix(OUTPUT_BEGIN) {
            if transaction.is_some() {
                bail!("BEGIN inside a transaction");
            }

            let meta: serde_json::Value =
                serde_json::from_str(meta).context("invalid BEGIN metadata")?;

            transaction = Some(FileTransaction {
                xid: meta.get("xid").and_then(|x| x.as_u64()).unwrap_or(0) as u32,
                begin_lsn: meta
                    .get("lsn")
                    .and_then(|l| l.as_str())
                    .unwrap_or("0/0")
                    .parse()?,
                commit_lsn: Lsn::INVALID,
                timestamp: meta
                    .get("timestamp")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                statements: Vec::new(),
            });
            continue;
        }

        if let Some(meta) = line.strip_prefix(OUTPUT_COMMIT) {
            let mut txn = transaction
                .take()
                .ok_or_else(|| format_err!("COMMIT without a BEGIN"))?;

            let meta: serde_json::Value =
                serde_json::from_str(meta).context("invalid COMMIT metadata")?;

            txn.commit_lsn = meta
                .get("lsn")
                .and_then(|l| l.as_str())
                .unwrap_or("0/0")
                .parse()?;

            items.push(ApplyItem::Transaction(txn));
            continue;
        }

        if let Some(captures) = KEEPALIVE_RE.captures(line) {
            let lsn: Lsn = captures[1].parse()?;
            let timestamp = captures[2].to_string();

            // keepalives inside a transaction carry no progress of their
            // own; the commit position supersedes them
            if transaction.is_none() {
                items.push(ApplyItem::Keepalive { lsn, timestamp });
            }
            continue;
        }

        if let Some(captures) = SWITCHWAL_RE.captures(line) {
            let lsn: Lsn = captures[1].parse()?;

            if transaction.is_none() {
                items.push(ApplyItem::SwitchWal { lsn });
            } else {
                warn!("WAL switch in the middle of transaction, continuing");
            }
            continue;
        }

        match transaction.as_mut() {
            Some(txn) => txn.statements.push(line.to_string()),
            None => bail!("statement outside of a transaction: {:?}", line),
        }
    }

    Ok(items)
}

/// What to do with one transaction given the origin progress and endpos.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// Already applied by an earlier run or an earlier pass on this file.
    Skip,
    Apply,
    /// At or past endpos: do not apply, report a clean stop.
    StopAtEndpos,
}

pub fn transaction_disposition(commit_lsn: Lsn, previous_lsn: Lsn, endpos: Lsn) -> Disposition {
    if endpos.is_valid() && commit_lsn >= endpos {
        return Disposition::StopAtEndpos;
    }

    if commit_lsn <= previous_lsn {
        return Disposition::Skip;
    }

    Disposition::Apply
}

struct ApplyContext {
    previous_lsn: Lsn,
    endpos: Lsn,
    reached_endpos: bool,
}

/// Replay one file. Returns the first position of the next file when the
/// stream switched segments within this one.
fn apply_items(
    client: &mut Client,
    context: &mut ApplyContext,
    items: &[ApplyItem],
) -> Result<Option<Lsn>, Error> {
    for item in items {
        if process::asked_to_quit() {
            bail!("interrupted while applying");
        }

        match item {
            ApplyItem::Transaction(txn) => {
                match transaction_disposition(txn.commit_lsn, context.previous_lsn, context.endpos)
                {
                    Disposition::Skip => {
                        debug!(
                            "skipping transaction {} (commit {} already applied)",
                            txn.xid, txn.commit_lsn
                        );
                    }
                    Disposition::StopAtEndpos => {
                        context.reached_endpos = true;
                        return Ok(None);
                    }
                    Disposition::Apply => {
                        apply_transaction(client, txn)?;
                        context.previous_lsn = txn.commit_lsn;
                    }
                }
            }

            ApplyItem::Keepalive { lsn, .. } => {
                if context.endpos.is_valid() && *lsn >= context.endpos {
                    context.reached_endpos = true;
                    return Ok(None);
                }

                // progress within the session; the origin itself advances
                // with the next applied transaction
                if *lsn > context.previous_lsn {
                    context.previous_lsn = *lsn;
                }
            }

            ApplyItem::SwitchWal { lsn } => {
                return Ok(Some(*lsn));
            }
        }
    }

    Ok(None)
}

fn apply_transaction(client: &mut Client, txn: &FileTransaction) -> Result<(), Error> {
    debug!(
        "applying transaction {} with {} statements, commit {}",
        txn.xid,
        txn.statements.len(),
        txn.commit_lsn
    );

    client.batch_execute("BEGIN").context("BEGIN failed")?;

    let result = (|| -> Result<(), Error> {
        for statement in &txn.statements {
            client
                .batch_execute(statement)
                .with_context(|| format!("unable to apply {:?}", statement))?;
        }

        // ties the origin progress to this very commit
        client
            .execute(
                "SELECT pg_catalog.pg_replication_origin_xact_setup($1::pg_lsn, $2::timestamptz)",
                &[&txn.commit_lsn.to_string(), &txn.timestamp],
            )
            .context("pg_replication_origin_xact_setup failed")?;

        client.batch_execute("COMMIT").context("COMMIT failed")?;

        Ok(())
    })();

    if result.is_err() {
        pgsql::rollback(client);
    }

    result
}

/// Block until the user flips the sentinel's apply switch.
fn wait_for_sentinel(client: &mut Client) -> Result<Sentinel, Error> {
    let mut reported = false;

    loop {
        if process::asked_to_quit() {
            bail!("interrupted while waiting on the sentinel");
        }

        let sentinel = sentinel::get_sentinel(client)?;

        if sentinel.apply {
            return Ok(sentinel);
        }

        if !reported {
            info!("waiting for the sentinel apply switch to turn on");
            reported = true;
        }

        std::thread::sleep(SENTINEL_POLL_INTERVAL);
    }
}

/// Replay SQL files on the target until endpos or a signal stops us.
pub fn run_apply(specs: &StreamSpecs) -> Result<(), Error> {
    let mut client = pgsql::connect(&specs.target_pguri, ConnKind::Target)?;

    let (_, _, wal_segment_size) = super::read_stream_context(&specs.paths)?;

    create_replication_origin(&mut client, &specs.origin)?;

    let previous_lsn = origin_progress(&mut client, &specs.origin)?;

    client
        .execute(
            "SELECT pg_catalog.pg_replication_origin_session_setup($1)",
            &[&specs.origin],
        )
        .with_context(|| format!("unable to attach to origin {:?}", specs.origin))?;

    let sentinel = wait_for_sentinel(&mut client)?;

    let mut context = ApplyContext {
        previous_lsn: previous_lsn.max(sentinel.startpos),
        endpos: specs.endpos.unwrap_or(sentinel.endpos),
        reached_endpos: false,
    };

    info!(
        "replaying changes from {} (origin progress {}, sentinel startpos {})",
        context.previous_lsn, previous_lsn, sentinel.startpos
    );

    let mut current = context.previous_lsn.segment_start(wal_segment_size);

    loop {
        if process::asked_to_quit() {
            info!("received a termination signal, stopping the replay");
            return Ok(());
        }

        // the user may move endpos while we run
        let sentinel = sentinel::get_sentinel(&mut client)?;
        context.endpos = specs.endpos.unwrap_or(sentinel.endpos);

        let sql_file = specs.paths.sql_file(current);

        if !tools::file_exists(&sql_file) {
            debug!("waiting for {:?}", sql_file);
            std::thread::sleep(SENTINEL_POLL_INTERVAL);
            continue;
        }

        let contents = tools::file_get_contents(&sql_file)?;
        let items = parse_sql_file(&contents)
            .with_context(|| format!("unable to parse {:?}", sql_file))?;

        let next = apply_items(&mut client, &mut context, &items)?;

        if context.reached_endpos {
            info!(
                "reached the end position {} at {}, stopping",
                context.endpos, context.previous_lsn
            );
            return Ok(());
        }

        match next {
            Some(lsn) => {
                current = lsn.segment_start(wal_segment_size);
            }
            None => {
                // no switch yet: re-read the same file once it grows; the
                // skip rule makes the second pass a no-op for applied work
                std::thread::sleep(SENTINEL_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQL_FILE: &str = r#"BEGIN; -- {"lsn":"0/24E3F28","timestamp":"2022-06-27 14:42:21.900000+00","xid":523}
INSERT INTO "public"."users" ("id", "name") VALUES (7, 'ada');
UPDATE "public"."users" SET "name" = 'grace' WHERE "id" = 7;
COMMIT; -- {"lsn":"0/24E3F88"}
-- KEEPALIVE 0/24E4000 2022-06-27 14:42:25.000000+00
BEGIN; -- {"lsn":"0/24E4100","timestamp":"2022-06-27 14:43:00.000000+00","xid":524}
DELETE FROM "public"."users" WHERE "id" = 7;
COMMIT; -- {"lsn":"0/24E4180"}
-- SWITCH WAL 0/3000000
"#;

    #[test]
    fn sql_file_parses_into_items() {
        let items = parse_sql_file(SQL_FILE).unwrap();

        assert_eq!(items.len(), 4);

        match &items[0] {
            ApplyItem::Transaction(txn) => {
                assert_eq!(txn.xid, 523);
                assert_eq!(txn.begin_lsn, Lsn(0x24E3F28));
                assert_eq!(txn.commit_lsn, Lsn(0x24E3F88));
                assert_eq!(txn.statements.len(), 2);
                assert!(txn.statements[0].starts_with("INSERT INTO"));
            }
            other => panic!("expected a transaction, got {:?}", other),
        }

        assert_eq!(
            items[1],
            ApplyItem::Keepalive {
                lsn: Lsn(0x24E4000),
                timestamp: "2022-06-27 14:42:25.000000+00".into()
            }
        );

        assert_eq!(items[3], ApplyItem::SwitchWal { lsn: Lsn(0x3000000) });
    }

    #[test]
    fn statements_outside_transactions_are_rejected() {
        let bad = "DELETE FROM \"public\".\"users\" WHERE \"id\" = 7;\n";
        assert!(parse_sql_file(bad).is_err());
    }

    #[test]
    fn disposition_skip_apply_stop() {
        let previous = Lsn(0x2000);
        let endpos = Lsn(0x5000);

        // already applied: at or below the origin progress
        assert_eq!(
            transaction_disposition(Lsn(0x1000), previous, endpos),
            Disposition::Skip
        );
        assert_eq!(
            transaction_disposition(Lsn(0x2000), previous, endpos),
            Disposition::Skip
        );

        // new work below endpos
        assert_eq!(
            transaction_disposition(Lsn(0x3000), previous, endpos),
            Disposition::Apply
        );

        // commit at or past endpos must not be applied
        assert_eq!(
            transaction_disposition(Lsn(0x5000), previous, endpos),
            Disposition::StopAtEndpos
        );
        assert_eq!(
            transaction_disposition(Lsn(0x6000), previous, endpos),
            Disposition::StopAtEndpos
        );

        // no endpos set: apply everything new
        assert_eq!(
            transaction_disposition(Lsn(0x6000), previous, Lsn::INVALID),
            Disposition::Apply
        );
    }

    #[test]
    fn replaying_the_same_items_twice_is_a_no_op() {
        let items = parse_sql_file(SQL_FILE).unwrap();

        // first pass applied everything up to the second commit
        let previous = Lsn(0x24E4180);

        for item in &items {
            if let ApplyItem::Transaction(txn) = item {
                assert_eq!(
                    transaction_disposition(txn.commit_lsn, previous, Lsn::INVALID),
                    Disposition::Skip
                );
            }
        }
    }

    #[test]
    fn keepalives_inside_transactions_are_dropped() {
        let contents = "\
BEGIN; -- {\"lsn\":\"0/100\",\"timestamp\":\"t\",\"xid\":1}
-- KEEPALIVE 0/110 t
INSERT INTO \"public\".\"t\" (\"id\") VALUES (1);
COMMIT; -- {\"lsn\":\"0/120\"}
";
        let items = parse_sql_file(contents).unwrap();

        assert_eq!(items.len(), 1);
        match &items[0] {
            ApplyItem::Transaction(txn) => assert_eq!(txn.statements.len(), 1),
            other => panic!("expected a transaction, got {:?}", other),
        }
    }
}
