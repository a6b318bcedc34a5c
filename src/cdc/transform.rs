//! Transform side of the stream: turn one JSON-lines file into one SQL
//! script, reassembling transactions on the way.
//!
//! The SQL file is the replay contract: every transaction is a
//! `BEGIN; -- {metadata}` line, the DML statements one per line, and a
//! `COMMIT; -- {metadata}` line carrying the commit position. SWITCH WAL
//! and KEEPALIVE marker comments keep the origin moving across quiet
//! stretches. The file only takes its final name once it is complete.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info};

use crate::ipc::{Queue, QueueMessage};
use crate::pgsql;
use crate::process;
use crate::tools;
use crate::workdir::CdcPaths;

use super::{Lsn, LogicalMessageMetadata, StreamAction};

pub const OUTPUT_BEGIN: &str = "BEGIN; -- ";
pub const OUTPUT_COMMIT: &str = "COMMIT; -- ";
pub const OUTPUT_SWITCHWAL: &str = "-- SWITCH WAL ";
pub const OUTPUT_KEEPALIVE: &str = "-- KEEPALIVE ";

/// A tuple value, typed just enough to know how to quote it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// SQL literal form: booleans, integers and floats go bare, text is
    /// quoted, and anything we do not recognize travels as quoted text.
    pub fn as_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => pgsql::quote_literal(s),
        }
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, Error> {
        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(
                    n.as_f64()
                        .ok_or_else(|| format_err!("unrepresentable number {}", n))?,
                ),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            // arrays and composites travel as their text representation
            other => Value::Text(other.to_string()),
        })
    }
}

/// Column names and their values, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Tuple {
    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|name| pgsql::quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn value_list(&self) -> String {
        self.values
            .iter()
            .map(|value| value.as_sql())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn set_clause(&self) -> String {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| format!("{} = {}", pgsql::quote_ident(name), value.as_sql()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn where_clause(&self) -> String {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| match value {
                Value::Null => format!("{} IS NULL", pgsql::quote_ident(name)),
                other => format!("{} = {}", pgsql::quote_ident(name), other.as_sql()),
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// One replayable statement inside a transaction, or a protocol marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert {
        nspname: String,
        relname: String,
        new: Tuple,
    },
    Update {
        nspname: String,
        relname: String,
        old: Tuple,
        new: Tuple,
    },
    Delete {
        nspname: String,
        relname: String,
        old: Tuple,
    },
    Truncate {
        nspname: String,
        relname: String,
    },
    SwitchWal {
        lsn: Lsn,
    },
    Keepalive {
        lsn: Lsn,
        timestamp: String,
    },
}

impl Statement {
    pub fn as_sql(&self) -> String {
        match self {
            Statement::Insert {
                nspname,
                relname,
                new,
            } => format!(
                "INSERT INTO {} ({}) VALUES ({});",
                pgsql::qualified_name(nspname, relname),
                new.column_list(),
                new.value_list()
            ),
            Statement::Update {
                nspname,
                relname,
                old,
                new,
            } => {
                // without replica identity the new tuple is all we have
                // to match on
                let matching = if old.is_empty() { new } else { old };
                format!(
                    "UPDATE {} SET {} WHERE {};",
                    pgsql::qualified_name(nspname, relname),
                    new.set_clause(),
                    matching.where_clause()
                )
            }
            Statement::Delete {
                nspname,
                relname,
                old,
            } => format!(
                "DELETE FROM {} WHERE {};",
                pgsql::qualified_name(nspname, relname),
                old.where_clause()
            ),
            Statement::Truncate { nspname, relname } => {
                format!("TRUNCATE ONLY {};", pgsql::qualified_name(nspname, relname))
            }
            Statement::SwitchWal { lsn } => format!("{}{}", OUTPUT_SWITCHWAL, lsn),
            Statement::Keepalive { lsn, timestamp } => {
                format!("{}{} {}", OUTPUT_KEEPALIVE, lsn, timestamp)
            }
        }
    }
}

/// A reassembled source transaction: an ordered run of statements between
/// a BEGIN and its COMMIT.
#[derive(Debug, Clone, Default)]
pub struct LogicalTransaction {
    pub xid: u32,
    pub begin_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub timestamp: String,
    pub statements: Vec<Statement>,
}

/// The transform subprocess: pop file names until the stop sentinel.
pub fn transform_worker(paths: &CdcPaths, queue: Queue) -> Result<(), Error> {
    loop {
        if process::asked_to_quit() {
            bail!("interrupted");
        }

        match queue.recv()? {
            QueueMessage::Stop => {
                debug!("transform worker drained its queue");
                return Ok(());
            }
            QueueMessage::File(lsn) => {
                let first_lsn = Lsn(lsn);
                transform_file(
                    &paths.json_file(first_lsn),
                    &paths.sql_file(first_lsn),
                )?;
            }
            other => bail!("unexpected message {:?} on the transform queue", other),
        }
    }
}

/// Transform one JSON file into its SQL sibling.
pub fn transform_file(json_path: &Path, sql_path: &Path) -> Result<(), Error> {
    info!("transforming {:?} into {:?}", json_path, sql_path);

    let contents = tools::file_get_contents(json_path)?;

    let mut partial = sql_path.to_path_buf();
    partial.set_extension("sql.partial");

    let file = File::create(&partial)
        .with_context(|| format!("unable to create {:?}", partial))?;
    let mut out = BufWriter::new(file);

    let mut transaction: Option<LogicalTransaction> = None;

    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }

        let (metadata, value) = super::parse_metadata(line)?;

        if metadata.filter_out {
            continue;
        }

        match metadata.action {
            StreamAction::Begin => {
                if transaction.is_some() {
                    bail!("found BEGIN inside a transaction in {:?}", json_path);
                }
                transaction = Some(LogicalTransaction {
                    xid: metadata.xid,
                    begin_lsn: metadata.lsn,
                    commit_lsn: Lsn::INVALID,
                    timestamp: metadata.timestamp.clone(),
                    statements: Vec::new(),
                });
            }

            StreamAction::Commit => {
                let mut txn = transaction.take().ok_or_else(|| {
                    format_err!("found COMMIT without a BEGIN in {:?}", json_path)
                })?;
                txn.commit_lsn = metadata.lsn;
                if !metadata.timestamp.is_empty() {
                    txn.timestamp = metadata.timestamp.clone();
                }
                write_transaction(&mut out, &txn)?;
            }

            StreamAction::Insert
            | StreamAction::Update
            | StreamAction::Delete
            | StreamAction::Truncate => {
                let statement = parse_statement(&metadata, &value)?;
                match transaction.as_mut() {
                    Some(txn) => txn.statements.push(statement),
                    None => bail!(
                        "found {:?} outside of a transaction in {:?}",
                        metadata.action,
                        json_path
                    ),
                }
            }

            StreamAction::SwitchWal => {
                let statement = Statement::SwitchWal { lsn: metadata.lsn };
                match transaction.as_mut() {
                    // a switch mid-transaction stays inside it, so apply
                    // tracks the boundary at statement granularity
                    Some(txn) => txn.statements.push(statement),
                    None => writeln!(out, "{}", statement.as_sql())?,
                }
            }

            StreamAction::Keepalive => {
                let statement = Statement::Keepalive {
                    lsn: metadata.lsn,
                    timestamp: metadata.timestamp.clone(),
                };
                match transaction.as_mut() {
                    Some(txn) => txn.statements.push(statement),
                    None => writeln!(out, "{}", statement.as_sql())?,
                }
            }

            StreamAction::Message => {
                // decoded messages carry no replayable change
                continue;
            }
        }
    }

    if let Some(txn) = transaction {
        // the COMMIT lives in the next file; the receiver splits files on
        // WAL switches, so replay of this part belongs there too
        debug!(
            "transaction {} is still open at the end of {:?}",
            txn.xid, json_path
        );
    }

    out.flush()?;
    drop(out);

    std::fs::rename(&partial, sql_path)
        .with_context(|| format!("unable to rename {:?} to {:?}", partial, sql_path))?;

    Ok(())
}

/// Write one transaction in replay order with its metadata trailers.
pub fn write_transaction<W: Write>(out: &mut W, txn: &LogicalTransaction) -> Result<(), Error> {
    let begin_meta = serde_json::json!({
        "xid": txn.xid,
        "lsn": txn.begin_lsn.to_string(),
        "timestamp": txn.timestamp,
    });
    writeln!(out, "{}{}", OUTPUT_BEGIN, begin_meta)?;

    for statement in &txn.statements {
        writeln!(out, "{}", statement.as_sql())?;
    }

    let commit_meta = serde_json::json!({
        "lsn": txn.commit_lsn.to_string(),
    });
    writeln!(out, "{}{}", OUTPUT_COMMIT, commit_meta)?;

    Ok(())
}

/// Parse one DML message into a statement, whatever plugin produced it.
fn parse_statement(
    metadata: &LogicalMessageMetadata,
    value: &serde_json::Value,
) -> Result<Statement, Error> {
    if value.get("message").is_some() {
        parse_test_decoding_statement(metadata, value)
    } else {
        parse_wal2json_statement(metadata, value)
    }
}

fn tuple_from_wal2json(columns: &serde_json::Value) -> Result<Tuple, Error> {
    let array = columns
        .as_array()
        .ok_or_else(|| format_err!("column list is not an array"))?;

    let mut tuple = Tuple::default();

    for column in array {
        let name = column
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| format_err!("column without a name: {}", column))?;

        let value = column
            .get("value")
            .map(Value::from_json)
            .transpose()?
            .unwrap_or(Value::Null);

        tuple.columns.push(name.to_string());
        tuple.values.push(value);
    }

    Ok(tuple)
}

fn parse_wal2json_statement(
    metadata: &LogicalMessageMetadata,
    value: &serde_json::Value,
) -> Result<Statement, Error> {
    let nspname = value
        .get("schema")
        .and_then(|s| s.as_str())
        .ok_or_else(|| format_err!("message without schema: {}", value))?
        .to_string();
    let relname = value
        .get("table")
        .and_then(|s| s.as_str())
        .ok_or_else(|| format_err!("message without table: {}", value))?
        .to_string();

    let columns = || -> Result<Tuple, Error> {
        tuple_from_wal2json(value.get("columns").unwrap_or(&serde_json::Value::Null))
    };
    let identity = || -> Result<Tuple, Error> {
        match value.get("identity") {
            Some(identity) => tuple_from_wal2json(identity),
            None => Ok(Tuple::default()),
        }
    };

    Ok(match metadata.action {
        StreamAction::Insert => Statement::Insert {
            nspname,
            relname,
            new: columns()?,
        },
        StreamAction::Update => Statement::Update {
            nspname,
            relname,
            old: identity()?,
            new: columns()?,
        },
        StreamAction::Delete => Statement::Delete {
            nspname,
            relname,
            old: identity()?,
        },
        StreamAction::Truncate => Statement::Truncate { nspname, relname },
        other => bail!("unexpected action {:?} for a DML message", other),
    })
}

/// test_decoding text format: `table public.users: INSERT: id[bigint]:7
/// name[text]:'ada'`, with an optional `old-key:`/`new-tuple:` split on
/// updates.
fn parse_test_decoding_statement(
    metadata: &LogicalMessageMetadata,
    value: &serde_json::Value,
) -> Result<Statement, Error> {
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .ok_or_else(|| format_err!("test_decoding envelope without message"))?;

    let rest = message
        .strip_prefix("table ")
        .ok_or_else(|| format_err!("unexpected test_decoding message {:?}", message))?;

    let colon = rest
        .find(": ")
        .ok_or_else(|| format_err!("unexpected test_decoding message {:?}", message))?;
    let (qname, rest) = rest.split_at(colon);
    let rest = &rest[2..];

    let (nspname, relname) = split_qualified_name(qname)?;

    // the payload follows the action word: "INSERT: id[bigint]:7 ..."
    let payload = rest
        .find(':')
        .map(|at| rest[at + 1..].trim())
        .unwrap_or("");

    Ok(match metadata.action {
        StreamAction::Insert => Statement::Insert {
            nspname,
            relname,
            new: parse_test_decoding_columns(payload)?,
        },
        StreamAction::Update => {
            let (old, new) = match payload.find("new-tuple:") {
                Some(at) => {
                    let old_part = payload[..at]
                        .trim()
                        .trim_start_matches("old-key:")
                        .trim();
                    let new_part = payload[at + "new-tuple:".len()..].trim();
                    (
                        parse_test_decoding_columns(old_part)?,
                        parse_test_decoding_columns(new_part)?,
                    )
                }
                None => (Tuple::default(), parse_test_decoding_columns(payload)?),
            };
            Statement::Update {
                nspname,
                relname,
                old,
                new,
            }
        }
        StreamAction::Delete => Statement::Delete {
            nspname,
            relname,
            old: parse_test_decoding_columns(payload)?,
        },
        StreamAction::Truncate => Statement::Truncate { nspname, relname },
        other => bail!("unexpected action {:?} for a test_decoding message", other),
    })
}

fn split_qualified_name(qname: &str) -> Result<(String, String), Error> {
    let mut parts = qname.splitn(2, '.');

    match (parts.next(), parts.next()) {
        (Some(nspname), Some(relname)) => Ok((nspname.to_string(), relname.to_string())),
        _ => bail!("unqualified relation name {:?}", qname),
    }
}

/// Tokenize `col[type]:value` pairs; values are either bare tokens or
/// single-quoted strings with doubled-quote escapes.
fn parse_test_decoding_columns(payload: &str) -> Result<Tuple, Error> {
    let mut tuple = Tuple::default();
    let bytes = payload.as_bytes();
    let mut position = 0;

    while position < bytes.len() {
        // skip separators
        while position < bytes.len() && bytes[position] == b' ' {
            position += 1;
        }
        if position >= bytes.len() {
            break;
        }

        let bracket = payload[position..]
            .find('[')
            .map(|at| position + at)
            .ok_or_else(|| format_err!("expected a column at {:?}", &payload[position..]))?;
        let name = payload[position..bracket].to_string();

        let close = payload[bracket..]
            .find("]:")
            .map(|at| bracket + at)
            .ok_or_else(|| format_err!("unterminated type in {:?}", &payload[bracket..]))?;
        let type_name = &payload[bracket + 1..close];

        position = close + 2;

        let (raw, next) = if bytes.get(position) == Some(&b'\'') {
            read_quoted_value(payload, position)?
        } else {
            let end = payload[position..]
                .find(' ')
                .map(|at| position + at)
                .unwrap_or_else(|| payload.len());
            (payload[position..end].to_string(), end)
        };
        position = next;

        tuple.values.push(typed_value(type_name, &raw)?);
        tuple.columns.push(name);
    }

    Ok(tuple)
}

/// Read a `'quoted value'`, handling `''` escapes; returns the unquoted
/// content and the position after the closing quote.
fn read_quoted_value(payload: &str, start: usize) -> Result<(String, usize), Error> {
    let bytes = payload.as_bytes();
    let mut content = String::new();
    let mut position = start + 1;

    while position < bytes.len() {
        match bytes[position] {
            b'\'' if bytes.get(position + 1) == Some(&b'\'') => {
                content.push('\'');
                position += 2;
            }
            b'\'' => return Ok((content, position + 1)),
            _ => {
                // values are utf-8; collect char by char
                let ch = payload[position..].chars().next().expect("char");
                content.push(ch);
                position += ch.len_utf8();
            }
        }
    }

    bail!("unterminated quoted value in {:?}", payload)
}

fn typed_value(type_name: &str, raw: &str) -> Result<Value, Error> {
    if raw == "null" {
        return Ok(Value::Null);
    }

    Ok(match type_name {
        "boolean" => Value::Bool(raw == "true" || raw == "t"),
        "smallint" | "integer" | "bigint" => raw
            .parse()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        "real" | "double precision" => raw
            .parse()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        _ => Value::Text(raw.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_lines(lines: &[&str]) -> String {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("0000000001000000.json");
        let sql = dir.path().join("0000000001000000.sql");

        tools::file_set_contents(&json, format!("{}\n", lines.join("\n")).as_bytes()).unwrap();

        transform_file(&json, &sql).unwrap();
        tools::file_get_contents(&sql).unwrap()
    }

    #[test]
    fn one_wal2json_transaction_round_trip() {
        let sql = transform_lines(&[
            r#"{"action":"B","xid":523,"lsn":"0/24E3F28","timestamp":"2022-06-27 14:42:21.795714+00"}"#,
            r#"{"action":"I","xid":523,"lsn":"0/24E3F60","schema":"public","table":"users","columns":[{"name":"id","type":"bigint","value":7},{"name":"name","type":"text","value":"ada"}]}"#,
            r#"{"action":"U","xid":523,"lsn":"0/24E3F70","schema":"public","table":"users","identity":[{"name":"id","type":"bigint","value":7}],"columns":[{"name":"id","type":"bigint","value":7},{"name":"name","type":"text","value":"grace"}]}"#,
            r#"{"action":"D","xid":523,"lsn":"0/24E3F80","schema":"public","table":"users","identity":[{"name":"id","type":"bigint","value":7}]}"#,
            r#"{"action":"C","xid":523,"lsn":"0/24E3F88","timestamp":"2022-06-27 14:42:21.900000+00"}"#,
        ]);

        let lines: Vec<&str> = sql.lines().collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[0],
            r#"BEGIN; -- {"lsn":"0/24E3F28","timestamp":"2022-06-27 14:42:21.900000+00","xid":523}"#
        );
        assert_eq!(
            lines[1],
            r#"INSERT INTO "public"."users" ("id", "name") VALUES (7, 'ada');"#
        );
        assert_eq!(
            lines[2],
            r#"UPDATE "public"."users" SET "id" = 7, "name" = 'grace' WHERE "id" = 7;"#
        );
        assert_eq!(lines[3], r#"DELETE FROM "public"."users" WHERE "id" = 7;"#);
        assert_eq!(lines[4], r#"COMMIT; -- {"lsn":"0/24E3F88"}"#);
    }

    #[test]
    fn markers_outside_transactions_become_comments() {
        let sql = transform_lines(&[
            r#"{"action":"K","lsn":"0/2000028","timestamp":"2022-06-27 14:42:25.000000+00"}"#,
            r#"{"action":"X","lsn":"0/3000000","timestamp":"2022-06-27 14:42:26.000000+00"}"#,
        ]);

        let lines: Vec<&str> = sql.lines().collect();
        assert_eq!(
            lines,
            vec![
                "-- KEEPALIVE 0/2000028 2022-06-27 14:42:25.000000+00",
                "-- SWITCH WAL 0/3000000",
            ]
        );
    }

    #[test]
    fn markers_inside_a_transaction_stay_inside() {
        let sql = transform_lines(&[
            r#"{"action":"B","xid":9,"lsn":"0/1000010","timestamp":"2022-06-27 15:00:00.000000+00"}"#,
            r#"{"action":"I","xid":9,"lsn":"0/1000020","schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":1}]}"#,
            r#"{"action":"K","lsn":"0/1000030","timestamp":"2022-06-27 15:00:01.000000+00"}"#,
            r#"{"action":"C","xid":9,"lsn":"0/1000040","timestamp":"2022-06-27 15:00:02.000000+00"}"#,
        ]);

        let lines: Vec<&str> = sql.lines().collect();
        assert!(lines[0].starts_with("BEGIN; -- "));
        assert!(lines[2].starts_with("-- KEEPALIVE "));
        assert!(lines[3].starts_with("COMMIT; -- "));
    }

    #[test]
    fn truncate_and_null_handling() {
        let sql = transform_lines(&[
            r#"{"action":"B","xid":11,"lsn":"0/1000100","timestamp":"2022-06-27 15:10:00.000000+00"}"#,
            r#"{"action":"T","xid":11,"lsn":"0/1000110","schema":"public","table":"audit"}"#,
            r#"{"action":"D","xid":11,"lsn":"0/1000120","schema":"public","table":"t","identity":[{"name":"key","type":"text","value":null}]}"#,
            r#"{"action":"C","xid":11,"lsn":"0/1000130","timestamp":"2022-06-27 15:10:01.000000+00"}"#,
        ]);

        assert!(sql.contains(r#"TRUNCATE ONLY "public"."audit";"#));
        assert!(sql.contains(r#"DELETE FROM "public"."t" WHERE "key" IS NULL;"#));
    }

    #[test]
    fn value_quoting_per_type() {
        assert_eq!(Value::Bool(true).as_sql(), "true");
        assert_eq!(Value::Integer(-42).as_sql(), "-42");
        assert_eq!(Value::Float(1.5).as_sql(), "1.5");
        assert_eq!(Value::Text("o'brien".into()).as_sql(), "'o''brien'");
        assert_eq!(Value::Null.as_sql(), "NULL");

        // timestamps and anything stringly arrive quoted
        assert_eq!(
            Value::Text("2022-06-27 14:42:21".into()).as_sql(),
            "'2022-06-27 14:42:21'"
        );
    }

    #[test]
    fn test_decoding_insert_parses_quoted_values() {
        let metadata = LogicalMessageMetadata {
            action: StreamAction::Insert,
            xid: 5,
            lsn: Lsn(0x1000200),
            timestamp: String::new(),
            filter_out: false,
        };
        let value = serde_json::json!({
            "action": "I",
            "message": "table public.users: INSERT: id[bigint]:7 name[text]:'o''brien' active[boolean]:true"
        });

        let statement = parse_statement(&metadata, &value).unwrap();

        assert_eq!(
            statement.as_sql(),
            r#"INSERT INTO "public"."users" ("id", "name", "active") VALUES (7, 'o''brien', true);"#
        );
    }

    #[test]
    fn test_decoding_update_with_old_key() {
        let metadata = LogicalMessageMetadata {
            action: StreamAction::Update,
            xid: 5,
            lsn: Lsn(0x1000210),
            timestamp: String::new(),
            filter_out: false,
        };
        let value = serde_json::json!({
            "action": "U",
            "message": "table public.users: UPDATE: old-key: id[bigint]:7 new-tuple: id[bigint]:7 name[text]:'grace'"
        });

        let statement = parse_statement(&metadata, &value).unwrap();

        assert_eq!(
            statement.as_sql(),
            r#"UPDATE "public"."users" SET "id" = 7, "name" = 'grace' WHERE "id" = 7;"#
        );
    }

    #[test]
    fn open_transaction_at_file_end_is_left_for_the_next_file() {
        let sql = transform_lines(&[
            r#"{"action":"B","xid":77,"lsn":"0/1FFFF00","timestamp":"2022-06-27 16:00:00.000000+00"}"#,
            r#"{"action":"I","xid":77,"lsn":"0/1FFFF10","schema":"public","table":"t","columns":[{"name":"id","type":"integer","value":1}]}"#,
        ]);

        // nothing of the unfinished transaction may be replayed
        assert_eq!(sql, "");
    }
}
