//! Repository functions: one function per database operation.
//!
//! Every function takes a `&PgPool` (or an open transaction) and returns a
//! `Result<T, DbError>`. No business logic, no domain types: pure SQL.

pub mod logs;
pub mod runs;
pub mod steps;
pub mod workflows;
