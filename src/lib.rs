//! Logical backup and restore toolchain for a document-oriented database.
//!
//! This crate implements the archive codec, the intent/plan model, and the
//! parallel dump and restore pipelines that sit on top of a server
//! connection. It does not implement the connection itself; callers supply
//! one by implementing [`server::ServerHandle`].

pub mod archive;
pub mod bson_io;
pub mod common;
pub mod concurrency;
pub mod dump;
pub mod error;
pub mod intent;
pub mod metadata;
pub mod namespace;
pub mod oplog;
pub mod restore;
pub mod server;
pub mod users_roles;

pub use error::{Error, Result};
