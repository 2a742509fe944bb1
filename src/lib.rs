pub mod batch;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod network;
pub mod repository;
pub mod schema;
pub mod stages;
pub mod traits;
pub mod types;

pub use db::{new_db_pool, run_pending_migrations, DbPool};
pub use error::{BatchError, BatchResult};
