use ash::vk;

/// Find a memory type index that meets the requirements
pub fn find_memory_type_index(
    memory_requirements: &vk::MemoryRequirements,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    required_property_flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let memory_type_count = memory_properties.memory_type_count as usize;
    for (index, memory_type) in memory_properties.memory_types[..memory_type_count]
        .iter()
        .enumerate()
    {
        let type_supported = (memory_requirements.memory_type_bits & (1 << index)) != 0;
        let flags_supported = memory_type
            .property_flags
            .contains(required_property_flags);

        if type_supported && flags_supported {
            return Some(index as u32);
        }
    }

    None
}
