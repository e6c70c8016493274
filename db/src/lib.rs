pub mod dtos;
pub mod entities;
pub mod error;
pub mod store;

pub use error::{DecodeError, StoreError};
pub use store::{JobStore, MemoryStore, PgJobStore};

use sqlx::migrate::Migrator;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
