pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod schedule;
pub mod sql;
pub mod store;
pub mod sweeper;
pub mod wal;
pub mod wire;
