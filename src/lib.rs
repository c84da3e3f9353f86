//! Collection archiver library.
//!
//! Downloads the media URLs listed in collection files through a primary
//! fetcher with a fallback tier, records every outcome in plain-text logs,
//! and moves finished folders to remote storage.

pub mod collection;
pub mod config;
pub mod constants;
pub mod content_id;
pub mod fetch;
pub mod logstore;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod summary;
pub mod sync;

pub use config::Config;
pub use runner::{Collaborators, Runner};
