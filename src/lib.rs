//! Copy a PostgreSQL database between two instances.
//!
//! The heavy lifting is a multi-process COPY orchestrator driven by an
//! on-disk work directory ledger, plus an optional logical replication
//! follow-up pipeline (receive, transform, apply).

pub mod blobs;
pub mod catalog;
pub mod cdc;
pub mod clone;
pub mod config;
pub mod copy;
pub mod dump;
pub mod indexes;
pub mod ipc;
pub mod pgsql;
pub mod process;
pub mod sequences;
pub mod snapshot;
pub mod summary;
pub mod tools;
pub mod vacuum;
pub mod workdir;

pub use config::{CopySpecs, Section};
pub use workdir::{CopyFilePaths, DirectoryState};
