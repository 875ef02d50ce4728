//! Library to backup and restore a web site installation.
//!
//! A snapshot bundles the database dump, the uploaded media and, for full
//! backups, the dependency manifest and source trees of all repositories in
//! a single ZIP archive. The snapshot contents are produced by the
//! [`backends`], started through the [`manager`] and periodically by the
//! [`scheduler`]. The [`restore`] module reverses a snapshot with rollback
//! on failure.

#![forbid(unsafe_code)]

pub mod archive;
pub mod backends;
pub mod cli;
pub mod config;
pub mod lease;
pub mod manager;
pub mod model;
pub mod notify;
pub mod process;
pub mod repositories;
pub mod restore;
pub mod scheduler;
pub mod store;
pub mod util;
