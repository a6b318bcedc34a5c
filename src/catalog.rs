//! Source catalog introspection: ordered tables with split keys, index
//! definitions with their backing constraints, sequences and extensions.
//!
//! The catalog is fetched once on the snapshot connection, persisted to
//! `schema.json`, and re-loaded from there on resume so that a resumed run
//! schedules exactly the same work items as the interrupted one.

use std::path::Path;

use anyhow::{Context, Error};
use log::{debug, info};
use postgres::Client;
use serde::{Deserialize, Serialize};

use crate::pgsql;
use crate::tools;

/// One COPY partition of a table: an inclusive range of the split key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePart {
    pub number: usize,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTable {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub bytes: i64,
    pub bytes_pretty: String,
    /// Single integer column suitable for range partitioning, when the
    /// table has one.
    pub part_key: Option<String>,
    /// Empty for a table copied in one piece.
    pub parts: Vec<TablePart>,
}

impl SourceTable {
    pub fn qname(&self) -> String {
        pgsql::qualified_name(&self.nspname, &self.relname)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIndex {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub table_oid: u32,
    pub index_def: String,
    /// Zero when the index does not back a constraint.
    pub constraint_oid: u32,
    pub constraint_name: Option<String>,
    pub constraint_def: Option<String>,
}

impl SourceIndex {
    pub fn qname(&self) -> String {
        pgsql::qualified_name(&self.nspname, &self.relname)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSequence {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
}

impl SourceSequence {
    pub fn qname(&self) -> String {
        pgsql::qualified_name(&self.nspname, &self.relname)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub nspname: String,
    pub relname: String,
    /// WHERE clause registered by the extension for its config table,
    /// possibly empty.
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceExtension {
    pub name: String,
    pub config: Vec<ExtensionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: Vec<SourceTable>,
    pub indexes: Vec<SourceIndex>,
    pub sequences: Vec<SourceSequence>,
    pub extensions: Vec<SourceExtension>,
}

impl Catalog {
    pub fn indexes_for_table(&self, table_oid: u32) -> Vec<&SourceIndex> {
        self.indexes
            .iter()
            .filter(|index| index.table_oid == table_oid)
            .collect()
    }

    pub fn index_by_oid(&self, oid: u32) -> Option<&SourceIndex> {
        self.indexes.iter().find(|index| index.oid == oid)
    }

    pub fn table_by_oid(&self, oid: u32) -> Option<&SourceTable> {
        self.tables.iter().find(|table| table.oid == oid)
    }

    pub fn write_file(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)?;
        tools::file_set_contents(path, json.as_bytes())
    }

    pub fn read_file(path: &Path) -> Result<Self, Error> {
        let contents = tools::file_get_contents(path)?;
        serde_json::from_str(&contents)
            .with_context(|| format!("unable to parse catalog file {:?}", path))
    }
}

/// Schemas whose relations are never copied.
const SYSTEM_SCHEMAS: &str = "('pg_catalog', 'information_schema', 'pgclone')";

/// Fetch the whole catalog on the given (snapshot) connection. Tables are
/// ordered largest first so the big ones start copying early.
pub fn fetch_catalog(
    client: &mut Client,
    split_tables_larger_than: u64,
) -> Result<Catalog, Error> {
    let tables = list_tables(client, split_tables_larger_than)?;
    let indexes = list_indexes(client)?;
    let sequences = list_sequences(client)?;
    let extensions = list_extensions(client)?;

    info!(
        "fetched catalog: {} tables, {} indexes, {} sequences, {} extensions",
        tables.len(),
        indexes.len(),
        sequences.len(),
        extensions.len()
    );

    Ok(Catalog {
        tables,
        indexes,
        sequences,
        extensions,
    })
}

fn list_tables(
    client: &mut Client,
    split_tables_larger_than: u64,
) -> Result<Vec<SourceTable>, Error> {
    let sql = format!(
        "SELECT c.oid, n.nspname, c.relname, \
                pg_table_size(c.oid) AS bytes, \
                pg_size_pretty(pg_table_size(c.oid)), \
                (SELECT a.attname \
                   FROM pg_index i \
                   JOIN pg_attribute a \
                     ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                  WHERE i.indrelid = c.oid \
                    AND i.indisprimary \
                    AND i.indnatts = 1 \
                    AND a.atttypid IN ('int2'::regtype, 'int4'::regtype, 'int8'::regtype) \
                  LIMIT 1) AS part_key \
           FROM pg_class c \
           JOIN pg_namespace n ON n.oid = c.relnamespace \
          WHERE c.relkind = 'r' \
            AND c.relpersistence = 'p' \
            AND n.nspname NOT IN {} \
          ORDER BY pg_table_size(c.oid) DESC, c.oid",
        SYSTEM_SCHEMAS
    );

    let mut tables = Vec::new();

    for row in client.query(sql.as_str(), &[])? {
        let mut table = SourceTable {
            oid: row.get(0),
            nspname: row.get(1),
            relname: row.get(2),
            bytes: row.get(3),
            bytes_pretty: row.get(4),
            part_key: row.get(5),
            parts: Vec::new(),
        };

        if split_tables_larger_than > 0
            && table.bytes as u64 >= split_tables_larger_than
            && table.part_key.is_some()
        {
            table.parts =
                compute_partitions(client, &table, split_tables_larger_than)?;
        }

        tables.push(table);
    }

    Ok(tables)
}

/// Split a table into same-size key ranges. The COPY sub-queries use
/// inclusive BETWEEN on both ends, so the bounds must be disjoint:
/// each range starts right after the previous one ends.
fn compute_partitions(
    client: &mut Client,
    table: &SourceTable,
    split_size: u64,
) -> Result<Vec<TablePart>, Error> {
    let key = table.part_key.as_ref().expect("split key");

    let sql = format!(
        "SELECT min({key})::bigint, max({key})::bigint FROM {qname}",
        key = pgsql::quote_ident(key),
        qname = table.qname()
    );

    let row = client.query_one(sql.as_str(), &[])?;

    let min: Option<i64> = row.get(0);
    let max: Option<i64> = row.get(1);

    let (min, max) = match (min, max) {
        (Some(min), Some(max)) => (min, max),
        // empty table, nothing to split
        _ => return Ok(Vec::new()),
    };

    let count = (table.bytes as u64 / split_size) + 1;

    let parts = distribute_range(min, max, count as usize);

    debug!(
        "table {} ({}) splits into {} parts on \"{}\"",
        table.qname(),
        table.bytes_pretty,
        parts.len(),
        key
    );

    Ok(parts)
}

/// Cut `[min, max]` into at most `count` inclusive, non-overlapping,
/// covering ranges with `min(i+1) = max(i) + 1`.
pub fn distribute_range(min: i64, max: i64, count: usize) -> Vec<TablePart> {
    let total = (max - min + 1).max(1) as u64;
    let count = (count as u64).min(total).max(1);
    let step = total / count;
    let remainder = total % count;

    let mut parts = Vec::with_capacity(count as usize);
    let mut lower = min;

    for number in 0..count {
        // spread the remainder over the first ranges
        let size = step + if number < remainder { 1 } else { 0 };
        let upper = lower + size as i64 - 1;

        parts.push(TablePart {
            number: number as usize,
            min: lower,
            max: upper,
        });

        lower = upper + 1;
    }

    parts
}

fn list_indexes(client: &mut Client) -> Result<Vec<SourceIndex>, Error> {
    let sql = format!(
        "SELECT i.indexrelid, n.nspname, ic.relname, i.indrelid, \
                pg_get_indexdef(i.indexrelid), \
                coalesce(con.oid, 0::oid), \
                con.conname, \
                CASE WHEN con.oid IS NOT NULL \
                     THEN pg_get_constraintdef(con.oid) END \
           FROM pg_index i \
           JOIN pg_class ic ON ic.oid = i.indexrelid \
           JOIN pg_class tc ON tc.oid = i.indrelid \
           JOIN pg_namespace n ON n.oid = ic.relnamespace \
           LEFT JOIN pg_constraint con \
             ON con.conindid = i.indexrelid AND con.contype IN ('p', 'u') \
          WHERE tc.relkind = 'r' \
            AND tc.relpersistence = 'p' \
            AND (SELECT nspname FROM pg_namespace WHERE oid = tc.relnamespace) \
                NOT IN {} \
          ORDER BY i.indrelid, i.indexrelid",
        SYSTEM_SCHEMAS
    );

    let mut indexes = Vec::new();

    for row in client.query(sql.as_str(), &[])? {
        indexes.push(SourceIndex {
            oid: row.get(0),
            nspname: row.get(1),
            relname: row.get(2),
            table_oid: row.get(3),
            index_def: row.get(4),
            constraint_oid: row.get(5),
            constraint_name: row.get(6),
            constraint_def: row.get(7),
        });
    }

    Ok(indexes)
}

fn list_sequences(client: &mut Client) -> Result<Vec<SourceSequence>, Error> {
    let sql = format!(
        "SELECT c.oid, n.nspname, c.relname \
           FROM pg_class c \
           JOIN pg_namespace n ON n.oid = c.relnamespace \
          WHERE c.relkind = 'S' \
            AND n.nspname NOT IN {} \
          ORDER BY n.nspname, c.relname",
        SYSTEM_SCHEMAS
    );

    let mut sequences = Vec::new();

    for row in client.query(sql.as_str(), &[])? {
        sequences.push(SourceSequence {
            oid: row.get(0),
            nspname: row.get(1),
            relname: row.get(2),
        });
    }

    Ok(sequences)
}

fn list_extensions(client: &mut Client) -> Result<Vec<SourceExtension>, Error> {
    let rows = client.query(
        "SELECT e.extname, \
                n.nspname, \
                c.relname, \
                e.extcondition[array_position(e.extconfig, c.oid)] \
           FROM pg_extension e \
           LEFT JOIN LATERAL unnest(e.extconfig) AS cfg(oid) ON true \
           LEFT JOIN pg_class c ON c.oid = cfg.oid \
           LEFT JOIN pg_namespace n ON n.oid = c.relnamespace \
          ORDER BY e.extname",
        &[],
    )?;

    let mut extensions: Vec<SourceExtension> = Vec::new();

    for row in rows {
        let name: String = row.get(0);
        let nspname: Option<String> = row.get(1);
        let relname: Option<String> = row.get(2);
        let condition: Option<String> = row.get(3);

        if extensions.last().map(|e| e.name.as_str()) != Some(name.as_str()) {
            extensions.push(SourceExtension {
                name: name.clone(),
                config: Vec::new(),
            });
        }

        if let (Some(nspname), Some(relname)) = (nspname, relname) {
            extensions
                .last_mut()
                .expect("extension entry")
                .config
                .push(ExtensionConfig {
                    nspname,
                    relname,
                    condition: condition.unwrap_or_default(),
                });
        }
    }

    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint_and_covering(parts: &[TablePart], min: i64, max: i64) {
        assert_eq!(parts.first().unwrap().min, min);
        assert_eq!(parts.last().unwrap().max, max);

        for pair in parts.windows(2) {
            // inclusive BETWEEN needs the next range to start one past
            assert_eq!(pair[1].min, pair[0].max + 1);
        }

        for part in parts {
            assert!(part.min <= part.max);
        }
    }

    #[test]
    fn distribute_range_splits_evenly() {
        let parts = distribute_range(1, 10_000_000, 4);

        assert_eq!(parts.len(), 4);
        assert_disjoint_and_covering(&parts, 1, 10_000_000);
        assert_eq!(parts[0].min, 1);
        assert_eq!(parts[0].max, 2_500_000);
        assert_eq!(parts[3].min, 7_500_001);
    }

    #[test]
    fn distribute_range_with_remainder() {
        let parts = distribute_range(0, 9, 3);

        assert_eq!(parts.len(), 3);
        assert_disjoint_and_covering(&parts, 0, 9);
        // 10 values over 3 ranges: 4 + 3 + 3
        assert_eq!(parts[0].max - parts[0].min + 1, 4);
        assert_eq!(parts[1].max - parts[1].min + 1, 3);
    }

    #[test]
    fn distribute_range_never_makes_empty_parts() {
        // more parts requested than key values available
        let parts = distribute_range(5, 7, 10);

        assert_eq!(parts.len(), 3);
        assert_disjoint_and_covering(&parts, 5, 7);
    }

    #[test]
    fn distribute_range_single_value() {
        let parts = distribute_range(42, 42, 4);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].min, 42);
        assert_eq!(parts[0].max, 42);
    }

    #[test]
    fn distribute_range_negative_keys() {
        let parts = distribute_range(-100, 100, 2);

        assert_eq!(parts.len(), 2);
        assert_disjoint_and_covering(&parts, -100, 100);
    }

    #[test]
    fn catalog_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");

        let catalog = Catalog {
            tables: vec![SourceTable {
                oid: 16384,
                nspname: "public".into(),
                relname: "orders".into(),
                bytes: 8192 * 1000,
                bytes_pretty: "8000 kB".into(),
                part_key: Some("id".into()),
                parts: distribute_range(1, 1000, 2),
            }],
            indexes: vec![SourceIndex {
                oid: 16400,
                nspname: "public".into(),
                relname: "orders_pkey".into(),
                table_oid: 16384,
                index_def: "CREATE UNIQUE INDEX orders_pkey ON public.orders USING btree (id)"
                    .into(),
                constraint_oid: 16401,
                constraint_name: Some("orders_pkey".into()),
                constraint_def: Some("PRIMARY KEY (id)".into()),
            }],
            sequences: vec![],
            extensions: vec![SourceExtension {
                name: "hstore".into(),
                config: vec![],
            }],
        };

        catalog.write_file(&path).unwrap();
        let read = Catalog::read_file(&path).unwrap();

        assert_eq!(read.tables, catalog.tables);
        assert_eq!(read.indexes, catalog.indexes);
        assert_eq!(read.indexes_for_table(16384).len(), 1);
        assert!(read.table_by_oid(999).is_none());
    }
}
