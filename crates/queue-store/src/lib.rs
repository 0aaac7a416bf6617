//! SQL backends for the job queue.

pub mod config;
pub mod store;

pub use config::StoreConfig;
pub use store::postgres::PostgresStore;
pub use store::sqlite::SqliteStore;
pub use store::{Backend, connect};
