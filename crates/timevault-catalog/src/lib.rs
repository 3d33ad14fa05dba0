//! timevault-catalog: the local versioned index of backed-up files.
//!
//! An append-only multi-set of FileVersions in a single SQLite file.
//! A file's state at time `t` is the state established by the most recent
//! session with timestamp at or before `t`; the whole store exports as
//! one self-contained blob for encrypted off-site snapshotting.

mod snapshot;
mod store;

pub use store::Catalog;
