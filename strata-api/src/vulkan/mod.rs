//! Backend that creates objects on a real `ash::Device` and records into a real command buffer

mod command_buffer;
pub use command_buffer::CommandBufferVulkan;

mod device_context;
pub use device_context::DeviceContextVulkan;

mod util;
pub use util::find_memory_type_index;
