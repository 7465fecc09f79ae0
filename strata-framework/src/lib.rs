//! Allocators for small native objects that are handed out in bulk: queries, semaphores and
//! descriptor sets. Each one recycles whole native pools, and only after the queue serial that last
//! referenced the pool has completed.

pub use strata_api;

mod descriptor_pool;
pub use descriptor_pool::*;

mod pool;
pub use pool::*;

mod query_pool;
pub use query_pool::*;

mod semaphore_pool;
pub use semaphore_pool::*;

pub use strata_api::StrataResult;
