//! Persistence: the data model and the SQLite-backed store.

pub mod db;
pub mod models;

pub use db::{CapstoneDb, DbHandle};
