//! girder-lib: Core orchestration engine for Girder
//!
//! This crate provides the incremental build engine:
//! - `Artifact`: versioned, buildable-or-source entities (files, lists, recipe proxies)
//! - `Graph` / `Rule`: the static build topology
//! - `Recipe`: the pluggable "how" of a rule, including shell commands
//! - `Db`: the persistent version ledger driving incremental rebuilds
//! - `Build` / `Job`: the per-run scheduler with its up-to-date algorithm
//!   and cross-job version-consistency guarantee
//!
//! The declarative front end, CLI, and terminal UI live in separate crates
//! and consume this engine through `Graph`, `Build`, and the event bus.

pub mod artifact;
pub mod build;
pub mod consts;
pub mod db;
pub mod events;
pub mod graph;
pub mod job;
pub mod recipe;
pub mod util;
