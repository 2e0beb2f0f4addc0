//! Database module for netpoll.
//!
//! Provides the SQLite device registry and poll history.

mod models;
mod store;

pub use models::*;
pub use store::*;
