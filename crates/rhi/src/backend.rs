//! The seam between the frame pipeline and a concrete GPU API.
//!
//! Everything above this module (fences, descriptor pools, command list
//! recycling, buffers, the render device) is written against
//! [`RenderBackend`] and never names a specific API. A backend supplies five
//! kinds of objects:
//!
//! - [`GpuResource`]: a block of GPU memory backing a buffer or texture
//! - [`GpuCommandList`]: a recordable unit of GPU work plus its allocator
//! - [`GpuQueue`]: a submission queue that executes lists and signals fences
//! - [`GpuFence`]: a monotonically increasing GPU/CPU counter
//! - [`GpuDescriptorHeap`]: a fixed-capacity table of resource views
//!
//! All objects are owned values. Dropping a resource destroys it, so handing
//! ownership to the release queue is what keeps it alive until the GPU is done
//! with it.
//!
//! Two backends ship with the crate: [`crate::software::SoftwareBackend`]
//! (always available) and `VulkanBackend` behind the `vulkan` feature.

use std::time::Duration;

use crate::descriptor::{DescriptorHeapKind, DescriptorView};
use crate::error::RhiResult;

/// Row pitch alignment for buffer-to-texture copies, in bytes.
pub const TEXTURE_PITCH_ALIGNMENT: u64 = 256;

/// Rounds `value` up to a multiple of `alignment` (which must be non-zero).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Queue (and command list) type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Draw, dispatch and copy
    Graphics,
    /// Dispatch and copy
    Compute,
    /// Copy only
    Copy,
}

impl QueueKind {
    /// Returns a human-readable name for the queue type.
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        }
    }
}

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// GPU-resident; written only through copy commands
    Default,
    /// CPU-writable staging memory, readable by the GPU
    Upload,
}

impl MemoryKind {
    /// Returns a human-readable name for the memory kind.
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Default => "default",
            MemoryKind::Upload => "upload",
        }
    }
}

/// Texture dimensionality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    /// Width x height
    D2,
    /// Width x height x depth
    D3,
}

/// Texel formats understood by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit RGBA, normalized
    Rgba8Unorm,
    /// 8-bit BGRA, normalized
    Bgra8Unorm,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float RG
    Rg32Float,
    /// 32-bit float R
    R32Float,
    /// 32-bit float depth
    D32Float,
    /// 24-bit depth + 8-bit stencil
    D24UnormS8Uint,
}

impl TextureFormat {
    /// Size of one texel in bytes.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::D32Float
            | TextureFormat::D24UnormS8Uint => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
        }
    }

    /// Returns true for depth/stencil formats.
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float | TextureFormat::D24UnormS8Uint)
    }
}

bitflags::bitflags! {
    /// Extra ways a texture may be bound besides shader reads.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// May be bound as a render target
        const RENDER_TARGET = 1 << 0;
        /// May be bound as a depth-stencil target
        const DEPTH_STENCIL = 1 << 1;
        /// May be bound for unordered (read-write) access
        const UNORDERED_ACCESS = 1 << 2;
    }
}

/// Shape and format of a texture resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    /// 2D or 3D
    pub dimension: TextureDimension,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels (1 for 2D)
    pub depth: u32,
    /// Number of mip levels (at least 1)
    pub mip_levels: u32,
    /// Texel format
    pub format: TextureFormat,
    /// Binding flags
    pub usage: TextureUsage,
}

impl TextureInfo {
    /// Extent of mip level `mip` as (width, height, depth).
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        let shrink = |v: u32| (v >> mip).max(1);
        let depth = match self.dimension {
            TextureDimension::D2 => 1,
            TextureDimension::D3 => shrink(self.depth),
        };
        (shrink(self.width), shrink(self.height), depth)
    }

    /// Tightly packed size of mip level `mip` in bytes.
    pub fn mip_size(&self, mip: u32) -> u64 {
        let (w, h, d) = self.mip_extent(mip);
        w as u64 * h as u64 * d as u64 * self.format.bytes_per_texel() as u64
    }

    /// Offset of mip level `mip` in tightly packed storage.
    pub fn mip_offset(&self, mip: u32) -> u64 {
        (0..mip).map(|m| self.mip_size(m)).sum()
    }

    /// Tightly packed size of every mip level.
    pub fn total_size(&self) -> u64 {
        self.mip_offset(self.mip_levels)
    }
}

/// Layout of one texture subresource inside an upload buffer.
///
/// Rows are padded to [`TEXTURE_PITCH_ALIGNMENT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureFootprint {
    /// Mip level this footprint describes
    pub mip_level: u32,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Depth in texels
    pub depth: u32,
    /// Texel format
    pub format: TextureFormat,
    /// Unpadded bytes per row
    pub row_size: u64,
    /// Padded bytes per row
    pub row_pitch: u64,
}

impl TextureFootprint {
    /// Footprint of mip level `mip` of a texture.
    pub fn for_subresource(info: &TextureInfo, mip: u32) -> Self {
        let (width, height, depth) = info.mip_extent(mip);
        let row_size = width as u64 * info.format.bytes_per_texel() as u64;
        Self {
            mip_level: mip,
            width,
            height,
            depth,
            format: info.format,
            row_size,
            row_pitch: align_up(row_size, TEXTURE_PITCH_ALIGNMENT),
        }
    }

    /// Bytes the padded subresource occupies in an upload buffer.
    pub fn upload_size(&self) -> u64 {
        self.row_pitch * self.height as u64 * self.depth as u64
    }

    /// Offset of row `y` of slice `z` in the upload buffer.
    #[inline]
    pub fn row_offset(&self, y: u32, z: u32) -> u64 {
        (z as u64 * self.height as u64 + y as u64) * self.row_pitch
    }
}

/// What a resource is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Linear buffer of `size` bytes
    Buffer {
        /// Size in bytes
        size: u64,
    },
    /// Texture
    Texture(TextureInfo),
}

/// Creation parameters for a GPU resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Debug name
    pub name: String,
    /// Buffer or texture
    pub kind: ResourceKind,
    /// Memory placement
    pub memory: MemoryKind,
}

impl ResourceDesc {
    /// Describes a buffer.
    pub fn buffer(name: impl Into<String>, size: u64, memory: MemoryKind) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Buffer { size },
            memory,
        }
    }

    /// Describes a GPU-resident texture.
    pub fn texture(name: impl Into<String>, info: TextureInfo) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Texture(info),
            memory: MemoryKind::Default,
        }
    }

    /// Bytes of memory the resource needs.
    pub fn size(&self) -> u64 {
        match &self.kind {
            ResourceKind::Buffer { size } => *size,
            ResourceKind::Texture(info) => info.total_size(),
        }
    }

    /// Texture shape, if this is a texture.
    pub fn texture_info(&self) -> Option<&TextureInfo> {
        match &self.kind {
            ResourceKind::Texture(info) => Some(info),
            ResourceKind::Buffer { .. } => None,
        }
    }
}

/// A GPU device capable of creating the pipeline's objects.
pub trait RenderBackend: Send + Sync + Sized + 'static {
    /// GPU memory backing a buffer or texture.
    type Resource: GpuResource;
    /// Recordable command list with its allocator.
    type CommandList: GpuCommandList<Self>;
    /// Submission queue.
    type Queue: GpuQueue<Self>;
    /// Counter-based synchronization primitive.
    type Fence: GpuFence;
    /// Fixed-capacity descriptor table.
    type DescriptorHeap: GpuDescriptorHeap<Self>;

    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Creates a resource.
    fn create_resource(&self, desc: &ResourceDesc) -> RhiResult<Self::Resource>;

    /// Creates a command list in the recording state.
    fn create_command_list(&self, kind: QueueKind) -> RhiResult<Self::CommandList>;

    /// Creates (or retrieves) a queue of the given type.
    fn create_queue(&self, kind: QueueKind) -> RhiResult<Self::Queue>;

    /// Creates a fence whose GPU counter starts at `initial_value`.
    fn create_fence(&self, initial_value: u64) -> RhiResult<Self::Fence>;

    /// Creates a descriptor heap with `capacity` slots.
    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<Self::DescriptorHeap>;

    /// Returns [`crate::RhiError::DeviceLost`] once the device is gone.
    fn check_device(&self) -> RhiResult<()>;
}

/// GPU memory backing a buffer or texture.
pub trait GpuResource: Send + 'static {
    /// Creation parameters.
    fn desc(&self) -> &ResourceDesc;

    /// Size of the resource's memory in bytes.
    fn size(&self) -> u64 {
        self.desc().size()
    }

    /// GPU virtual address (non-zero).
    fn gpu_address(&self) -> u64;

    /// Copies `data` into CPU-visible memory at `offset`.
    ///
    /// Only valid for [`MemoryKind::Upload`] resources.
    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> RhiResult<()>;
}

/// A recordable unit of GPU work.
pub trait GpuCommandList<B: RenderBackend>: Send {
    /// Queue type this list can be submitted to.
    fn kind(&self) -> QueueKind;

    /// Resets the list and its allocator and reopens it for recording.
    fn reset(&mut self) -> RhiResult<()>;

    /// Ends recording.
    fn close(&mut self) -> RhiResult<()>;

    /// Records a copy of `size` bytes from the start of `src` into `dst`.
    fn copy_buffer(&mut self, dst: &B::Resource, src: &B::Resource, size: u64) -> RhiResult<()>;

    /// Records a copy from a padded upload buffer into one texture subresource.
    fn copy_buffer_to_texture(
        &mut self,
        dst: &B::Resource,
        src: &B::Resource,
        footprint: &TextureFootprint,
    ) -> RhiResult<()>;

    /// Commands recorded since the last reset.
    fn command_count(&self) -> usize;
}

/// A submission queue.
pub trait GpuQueue<B: RenderBackend>: Send + Sync {
    /// Queue type.
    fn kind(&self) -> QueueKind;

    /// Submits closed command lists for execution, in order.
    fn execute(&self, lists: &[&B::CommandList]) -> RhiResult<()>;

    /// Raises `fence` to `value` once all previously submitted work completes.
    fn signal(&self, fence: &B::Fence, value: u64) -> RhiResult<()>;

    /// Makes later submissions on this queue wait until `fence` reaches `value`.
    fn wait(&self, fence: &B::Fence, value: u64) -> RhiResult<()>;
}

/// A monotonically increasing counter advanced by the GPU.
pub trait GpuFence: Send + Sync {
    /// Highest value the GPU has reached.
    fn completed_value(&self) -> RhiResult<u64>;

    /// Blocks until the counter reaches `value` or `timeout` elapses.
    ///
    /// Returns `Ok(true)` when reached and `Ok(false)` on timeout.
    fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool>;
}

/// A fixed-capacity table of resource views.
pub trait GpuDescriptorHeap<B: RenderBackend>: Send {
    /// Heap kind.
    fn kind(&self) -> DescriptorHeapKind;

    /// Number of slots.
    fn capacity(&self) -> u32;

    /// CPU handle of slot 0 (non-zero).
    fn cpu_start(&self) -> u64;

    /// GPU handle of slot 0; zero for heaps that are not shader visible.
    fn gpu_start(&self) -> u64;

    /// Distance between consecutive slot handles.
    fn increment_size(&self) -> u64;

    /// Writes a view into slot `index`.
    fn write(&mut self, index: u32, view: &DescriptorView<'_, B>) -> RhiResult<()>;

    /// Releases whatever the backend created for slot `index`.
    fn clear(&mut self, index: u32);
}
