pub mod init;
pub mod kv;
pub mod migrations;

pub use init::{get_db_path, get_db_stats, init_db, run_migrations, DbStats};
pub use kv::{keys, LocalStore};
