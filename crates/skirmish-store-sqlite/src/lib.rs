//! SQLite backend for the skirmish battle detector.
//!
//! One [`SqliteStore`] serves all three store traits: the killmail feed, the
//! battle documents and the universe reference data. Access goes through
//! [`tokio_rusqlite`] so queries run on a dedicated thread without blocking
//! the async runtime.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
