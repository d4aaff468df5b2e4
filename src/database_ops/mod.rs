pub mod backfill;
pub mod db;
pub mod error;
pub mod matcher;
pub mod memory_store;
pub mod models;
pub mod pg_store;
pub mod store;
pub mod sync;
pub mod verify;
