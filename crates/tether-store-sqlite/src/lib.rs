//! SQLite driver for the Tether runtime.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime.

mod connection;
mod encode;

pub mod error;

pub use connection::SqliteConnection;
pub use error::{Error, Result};
