//! Database module for PostgreSQL persistence.

mod changes;
mod mutations;
mod pool;
mod shards;
mod watermarks;

pub use changes::PgChangeSource;
pub use mutations::{PgMutationStore, PgTx};
pub use pool::*;
pub use shards::PgShardStateStore;
pub use watermarks::PgWatermarkStore;
