//! PostgreSQL-backed stores.

pub mod flags;
pub mod queue;

pub use flags::PgFeatureFlags;
pub use queue::PgQueueStore;
