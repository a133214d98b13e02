//! Postgres-backed implementations of the repository traits.

pub mod node_repo;
pub mod usage_repo;
pub mod user_repo;

pub use node_repo::PgNodeRepository;
pub use usage_repo::PgUsageRepository;
pub use user_repo::PgUserRepository;
