use ash::vk;

pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Debug, Clone, PartialEq)]
pub enum StrataError {
    StringError(String),
    VkError(vk::Result),
    /// No memory type satisfies both the resource's type bits and the requested properties
    NoSuitableMemoryType {
        memory_type_bits: u32,
        required_flags: vk::MemoryPropertyFlags,
    },
    /// Host access through memory that has no host mapping
    MemoryNotMapped,
    /// Caller-provided pixel data or output memory is smaller than the operation touches
    InsufficientData { required: usize, provided: usize },
    /// The operation has no path for this format
    UnsupportedFormat(vk::Format),
}

impl std::error::Error for StrataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StrataError::VkError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl core::fmt::Display for StrataError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            StrataError::StringError(ref e) => e.fmt(fmt),
            StrataError::VkError(ref e) => e.fmt(fmt),
            StrataError::NoSuitableMemoryType {
                memory_type_bits,
                required_flags,
            } => write!(
                fmt,
                "No memory type supports {:?} for memory type bits {:#b}",
                required_flags, memory_type_bits
            ),
            StrataError::MemoryNotMapped => write!(fmt, "Memory is not mapped for host access"),
            StrataError::InsufficientData { required, provided } => write!(
                fmt,
                "Operation needs {} bytes but only {} were provided",
                required, provided
            ),
            StrataError::UnsupportedFormat(format) => {
                write!(fmt, "Format {:?} is not supported here", format)
            }
        }
    }
}

impl From<&str> for StrataError {
    fn from(str: &str) -> Self {
        StrataError::StringError(str.to_string())
    }
}

impl From<String> for StrataError {
    fn from(string: String) -> Self {
        StrataError::StringError(string)
    }
}

impl From<vk::Result> for StrataError {
    fn from(result: vk::Result) -> Self {
        StrataError::VkError(result)
    }
}

impl StrataError {
    /// The native result code, if this error came from the driver
    pub fn vk_result(&self) -> Option<vk::Result> {
        match *self {
            StrataError::VkError(result) => Some(result),
            _ => None,
        }
    }

    /// Out of host, device or pool memory. Callers may free resources and retry.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self.vk_result(),
            Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
                | Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                | Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Some(vk::Result::ERROR_FRAGMENTED_POOL)
        )
    }
}
