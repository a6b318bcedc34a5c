//! The sentinel: one control row on the target that the user drives and
//! apply obeys. `apply` gates the replay, `endpos` stops it cleanly.

use anyhow::{Context, Error};
use log::info;
use postgres::Client;

use super::Lsn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sentinel {
    pub apply: bool,
    pub startpos: Lsn,
    pub endpos: Lsn,
}

const CREATE_SENTINEL_SQL: &str = "\
CREATE SCHEMA IF NOT EXISTS pgclone;
CREATE TABLE IF NOT EXISTS pgclone.sentinel (
    id int PRIMARY KEY CHECK (id = 1) DEFAULT 1,
    apply bool NOT NULL DEFAULT false,
    startpos pg_lsn NOT NULL DEFAULT '0/0',
    endpos pg_lsn NOT NULL DEFAULT '0/0'
);";

/// Create (or reset) the sentinel row during streaming setup.
pub fn create_sentinel(client: &mut Client, startpos: Lsn, endpos: Lsn) -> Result<(), Error> {
    client
        .batch_execute(CREATE_SENTINEL_SQL)
        .context("unable to create the sentinel table")?;

    client
        .execute(
            "INSERT INTO pgclone.sentinel (id, apply, startpos, endpos) \
             VALUES (1, false, $1::pg_lsn, $2::pg_lsn) \
             ON CONFLICT (id) DO UPDATE \
                SET startpos = excluded.startpos, endpos = excluded.endpos",
            &[&startpos.to_string(), &endpos.to_string()],
        )
        .context("unable to initialize the sentinel row")?;

    info!("sentinel is set: startpos {}, endpos {}", startpos, endpos);

    Ok(())
}

/// Read the current sentinel values.
pub fn get_sentinel(client: &mut Client) -> Result<Sentinel, Error> {
    let row = client
        .query_one(
            "SELECT apply, startpos::text, endpos::text FROM pgclone.sentinel",
            &[],
        )
        .context("unable to read the sentinel; was streaming set up?")?;

    let apply: bool = row.get(0);
    let startpos: String = row.get(1);
    let endpos: String = row.get(2);

    Ok(Sentinel {
        apply,
        startpos: startpos.parse()?,
        endpos: endpos.parse()?,
    })
}

/// Flip the apply switch.
pub fn set_apply(client: &mut Client, apply: bool) -> Result<(), Error> {
    client
        .execute("UPDATE pgclone.sentinel SET apply = $1", &[&apply])
        .context("unable to update the sentinel")?;

    Ok(())
}

/// Register the position where apply should stop.
pub fn set_endpos(client: &mut Client, endpos: Lsn) -> Result<(), Error> {
    client
        .execute(
            "UPDATE pgclone.sentinel SET endpos = $1::pg_lsn",
            &[&endpos.to_string()],
        )
        .context("unable to update the sentinel")?;

    Ok(())
}

/// Remove the whole control schema from the target.
pub fn drop_sentinel(client: &mut Client) -> Result<(), Error> {
    client
        .batch_execute("DROP SCHEMA IF EXISTS pgclone CASCADE")
        .context("unable to drop the sentinel schema")?;

    Ok(())
}
