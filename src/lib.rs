// src/lib.rs

//! Pinwatch
//!
//! Tracks the versions a project pins against what a package registry has
//! released, and records which pins have fallen behind.
//!
//! # Architecture
//!
//! - Database-first: all state in SQLite, no config files
//! - Manifests: pluggable parsers turn requirement files into pins
//! - Sync: registry changelog events become package versions
//! - Reconciliation: each pin points at the newest ingested release
//! - Logs: every new release and pin change is recorded per project

pub mod catalog;
pub mod db;
mod error;
pub mod import;
pub mod manifest;
pub mod reconcile;
pub mod registry;
pub mod sync;

pub use error::{Error, Result};
