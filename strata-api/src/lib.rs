//! Resource helpers that sit directly on top of the graphics API: buffers and images that remember
//! how they were last accessed, a ring allocator for transient data, and deferred destruction keyed
//! on queue serials.
//!
//! Native objects are created through a [`DeviceContext`] and commands are appended to a
//! [`CommandRecorder`]. The `vulkan` feature provides both on top of `ash`. The `headless` feature
//! provides a recording backend with no GPU, used by the tests.

pub use ash;
pub use strata_base;

pub use buffer::*;
pub use command_recorder::*;
pub use context::*;
pub use device_context::*;
pub use dynamic_buffer::*;
pub use error::*;
pub use format::*;
pub use garbage::*;
pub use image::*;
pub use layout::*;

mod buffer;
mod command_recorder;
mod context;
mod device_context;
mod dynamic_buffer;
mod error;
mod format;
mod garbage;
mod image;
mod layout;

#[cfg(any(test, feature = "headless"))]
pub mod headless;

#[cfg(feature = "vulkan")]
pub mod vulkan;
