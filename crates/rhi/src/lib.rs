//! Frame-pipelined GPU resource and synchronization layer.
//!
//! This crate lets the CPU record and submit GPU work several frames ahead of
//! the GPU while recycling command lists, descriptor slots and staging memory
//! without ever freeing something the GPU may still be reading.
//! It handles:
//! - Counter-based fences with bounded waits
//! - Fixed-capacity descriptor tables
//! - Command list recycling keyed by frame completion
//! - Default and upload buffers, textures and samplers
//! - Frame-stamped deferred destruction
//! - The render device that drives the per-frame lifecycle
//!
//! Everything is generic over [`backend::RenderBackend`]. The
//! [`software::SoftwareBackend`] runs anywhere; the Vulkan backend is
//! available with the `vulkan` feature.

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod fence;
pub mod release;
pub mod software;
pub mod texture;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use backend::RenderBackend;
pub use buffer::{Buffer, BufferDesc, BufferUsage, BufferViewKind};
pub use command::{CommandList, CommandListRecycler, CommandListState, CommandQueue};
pub use descriptor::{Descriptor, DescriptorCapacities, DescriptorHeapKind, DescriptorHeapPool, SamplerDesc};
pub use device::{BufferHandle, DeviceConfig, FrameReport, RenderDevice, TextureHandle};
pub use error::{RhiError, RhiResult};
pub use fence::Fence;
pub use release::{ReleaseQueue, Retired};
pub use texture::{Sampler, Texture, TextureDesc};

// Re-export ash types that backend users might need
#[cfg(feature = "vulkan")]
pub use ash::vk;
