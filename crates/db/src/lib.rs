//! `db` crate: pure persistence layer.
//!
//! Provides a connection pool, typed row structs, the [`Store`] abstraction
//! the engine is written against, a Postgres-backed implementation built on
//! repository functions, and an in-memory implementation for tests and local
//! runs. No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pool::DbPool;
pub use store::Store;
