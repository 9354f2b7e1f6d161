//! RHI-specific error types.

use thiserror::Error;

use crate::command::CommandListState;
use crate::descriptor::DescriptorHeapKind;

/// RHI-specific error type.
///
/// Variants fall into three groups:
/// - fatal device conditions ([`RhiError::DeviceLost`], [`RhiError::Timeout`])
/// - mis-sized pools ([`RhiError::PoolExhausted`])
/// - logic errors that callers can observe and recover from (everything else)
#[derive(Error, Debug)]
pub enum RhiError {
    /// The device stopped responding or reported loss; nothing submitted
    /// after this point will complete.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A bounded fence wait expired before the GPU reached the target value
    #[error("GPU wait timed out after {timeout:?}: waiting for {target}, completed {completed}")]
    Timeout {
        /// Value the caller waited for
        target: u64,
        /// Last value the GPU reported
        completed: u64,
        /// How long the wait blocked
        timeout: std::time::Duration,
    },

    /// A fixed-capacity pool has no free entries left
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted {
        /// Which pool ran dry
        pool: &'static str,
        /// Its fixed capacity
        capacity: usize,
    },

    /// A descriptor slot was freed while already free
    #[error("Double free of {kind:?} descriptor {index}")]
    DoubleFree {
        /// Heap the descriptor belongs to
        kind: DescriptorHeapKind,
        /// Slot index
        index: u32,
    },

    /// A descriptor does not belong to the heap it was returned to
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A write larger than the destination resource
    #[error("Write of {size} bytes exceeds buffer capacity of {capacity} bytes")]
    WriteOutOfBounds {
        /// Bytes the write would touch (after alignment)
        size: u64,
        /// Resource capacity
        capacity: u64,
    },

    /// A handle that no longer refers to a registered resource
    #[error("Unregistered resource: {0}")]
    UnregisteredResource(String),

    /// An operation that does not apply to this resource or its usage
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// A command list was used in the wrong lifecycle state
    #[error("Command list is {actual:?}, expected {expected}")]
    InvalidCommandListState {
        /// State(s) the operation requires
        expected: &'static str,
        /// State the list was in
        actual: CommandListState,
    },

    /// Backend failure that does not imply device loss
    #[error("Backend error: {0}")]
    Backend(String),

    /// Vulkan API error
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[cfg(feature = "vulkan")]
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU allocator error
    #[cfg(feature = "vulkan")]
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[cfg(feature = "vulkan")]
    #[error("No suitable GPU found")]
    NoSuitableGpu,
}

impl RhiError {
    /// Returns true for conditions after which the device cannot be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            RhiError::DeviceLost(_) | RhiError::Timeout { .. } => true,
            #[cfg(feature = "vulkan")]
            RhiError::Vulkan(result) => *result == ash::vk::Result::ERROR_DEVICE_LOST,
            _ => false,
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RhiError::DeviceLost("gone".to_string()).is_fatal());
        assert!(
            RhiError::Timeout {
                target: 2,
                completed: 1,
                timeout: std::time::Duration::from_millis(5),
            }
            .is_fatal()
        );
        assert!(
            !RhiError::WriteOutOfBounds {
                size: 65,
                capacity: 64
            }
            .is_fatal()
        );
        assert!(
            !RhiError::DoubleFree {
                kind: DescriptorHeapKind::Sampler,
                index: 3
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_messages_name_the_pool() {
        let err = RhiError::PoolExhausted {
            pool: "render target descriptor",
            capacity: 4,
        };
        assert_eq!(
            err.to_string(),
            "render target descriptor pool exhausted (capacity 4)"
        );
    }
}
