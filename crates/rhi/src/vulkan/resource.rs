//! Buffers and images backed by `gpu-allocator`.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use super::DeviceShared;
use crate::backend::{
    GpuResource, MemoryKind, ResourceDesc, ResourceKind, TextureDimension, TextureFormat,
    TextureInfo, TextureUsage,
};
use crate::error::{RhiError, RhiResult};

/// Vulkan format for a texel format.
pub(crate) fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
        TextureFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Image aspects a view or copy of `format` touches.
pub(crate) fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    match format {
        TextureFormat::D32Float => vk::ImageAspectFlags::DEPTH,
        TextureFormat::D24UnormS8Uint => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn memory_location(memory: MemoryKind) -> MemoryLocation {
    match memory {
        MemoryKind::Default => MemoryLocation::GpuOnly,
        MemoryKind::Upload => MemoryLocation::CpuToGpu,
    }
}

fn image_usage(info: &TextureInfo) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
    if info.usage.contains(TextureUsage::RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if info.usage.contains(TextureUsage::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if info.usage.contains(TextureUsage::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    usage
}

#[derive(Clone, Copy)]
enum Raw {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// A Vulkan buffer or image with its memory.
pub struct VulkanResource {
    shared: Arc<DeviceShared>,
    desc: ResourceDesc,
    raw: Raw,
    allocation: Option<Allocation>,
    address: u64,
}

impl VulkanResource {
    pub(crate) fn new(shared: Arc<DeviceShared>, desc: &ResourceDesc) -> RhiResult<Self> {
        if desc.size() == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' has zero size",
                desc.name
            )));
        }

        let (raw, requirements, linear) = match &desc.kind {
            ResourceKind::Buffer { size } => {
                let usage = vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
                let buffer_info = vk::BufferCreateInfo::default()
                    .size(*size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                let buffer = unsafe { shared.device().create_buffer(&buffer_info, None) }
                    .map_err(|e| shared.vk_error(e))?;
                let requirements =
                    unsafe { shared.device().get_buffer_memory_requirements(buffer) };
                (Raw::Buffer(buffer), requirements, true)
            }
            ResourceKind::Texture(info) => {
                if desc.memory != MemoryKind::Default {
                    return Err(RhiError::InvalidUsage(format!(
                        "texture '{}' must live in default memory",
                        desc.name
                    )));
                }
                let image_type = match info.dimension {
                    TextureDimension::D2 => vk::ImageType::TYPE_2D,
                    TextureDimension::D3 => vk::ImageType::TYPE_3D,
                };
                let image_info = vk::ImageCreateInfo::default()
                    .image_type(image_type)
                    .format(vk_format(info.format))
                    .extent(vk::Extent3D {
                        width: info.width,
                        height: info.height,
                        depth: info.depth,
                    })
                    .mip_levels(info.mip_levels)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(image_usage(info))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let image = unsafe { shared.device().create_image(&image_info, None) }
                    .map_err(|e| shared.vk_error(e))?;
                let requirements = unsafe { shared.device().get_image_memory_requirements(image) };
                (Raw::Image(image), requirements, false)
            }
        };

        let allocation = shared.with_allocator(|allocator| {
            Ok(allocator.allocate(&AllocationCreateDesc {
                name: &desc.name,
                requirements,
                location: memory_location(desc.memory),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?)
        });

        // From here on Drop cleans up whatever was created.
        let mut resource = Self {
            shared,
            desc: desc.clone(),
            raw,
            allocation: None,
            address: 0,
        };
        resource.allocation = Some(allocation?);
        resource.bind_memory()?;

        debug!(
            "Created {} resource '{}' ({} bytes)",
            desc.memory.name(),
            desc.name,
            desc.size()
        );
        Ok(resource)
    }

    fn bind_memory(&mut self) -> RhiResult<()> {
        let Some(allocation) = self.allocation.as_ref() else {
            return Ok(());
        };
        let device = self.shared.device();
        match self.raw {
            Raw::Buffer(buffer) => {
                unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
                    .map_err(|e| self.shared.vk_error(e))?;
                let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
                self.address = unsafe { device.get_buffer_device_address(&info) };
            }
            Raw::Image(image) => {
                unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
                    .map_err(|e| self.shared.vk_error(e))?;
                self.address = image.as_raw();
            }
        }
        Ok(())
    }

    /// The buffer handle, if this is a buffer.
    #[inline]
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.raw {
            Raw::Buffer(buffer) => Some(buffer),
            Raw::Image(_) => None,
        }
    }

    /// The image handle, if this is a texture.
    #[inline]
    pub fn image(&self) -> Option<vk::Image> {
        match self.raw {
            Raw::Image(image) => Some(image),
            Raw::Buffer(_) => None,
        }
    }

    pub(crate) fn require_buffer(&self) -> RhiResult<vk::Buffer> {
        self.buffer().ok_or_else(|| {
            RhiError::InvalidUsage(format!("'{}' is not a buffer", self.desc.name))
        })
    }

    pub(crate) fn require_image(&self) -> RhiResult<(vk::Image, &TextureInfo)> {
        match (self.raw, &self.desc.kind) {
            (Raw::Image(image), ResourceKind::Texture(info)) => Ok((image, info)),
            _ => Err(RhiError::InvalidUsage(format!(
                "'{}' is not a texture",
                self.desc.name
            ))),
        }
    }
}

impl GpuResource for VulkanResource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn gpu_address(&self) -> u64 {
        self.address
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.check_device()?;
        if self.desc.memory != MemoryKind::Upload {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' lives in {} memory and is not CPU-writable",
                self.desc.name,
                self.desc.memory.name()
            )));
        }

        let capacity = self.desc.size();
        let end = offset + data.len() as u64;
        if end > capacity {
            return Err(RhiError::WriteOutOfBounds {
                size: end,
                capacity,
            });
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| {
                RhiError::Backend(format!("'{}' memory is not mapped", self.desc.name))
            })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self
                .shared
                .with_allocator(|allocator| Ok(allocator.free(allocation)?))
        {
            error!("Failed to free allocation of '{}': {}", self.desc.name, e);
        }

        unsafe {
            match self.raw {
                Raw::Buffer(buffer) => self.shared.device().destroy_buffer(buffer, None),
                Raw::Image(image) => self.shared.device().destroy_image(image, None),
            }
        }

        debug!("Destroyed resource '{}'", self.desc.name);
    }
}
