//! Database module: row view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories and insert parameters.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `stac_ingestor::db`; the repository
//! API and commonly used view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BatchMember, NewSubmission, QueueBacklog, TokenRecord};
