//! Lowest level crate of `strata`. Includes alignment math, queue serials and the shared resource use
//! tracker. Nothing in here knows about a graphics API.

pub mod memory;

mod serial;
pub use serial::QueueSerialTracker;
pub use serial::Serial;
pub use serial::SerialSource;

mod resource_use;
pub use resource_use::ResourceUse;
