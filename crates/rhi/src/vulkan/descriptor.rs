//! Descriptor heaps on top of update-after-bind descriptor sets.
//!
//! # Overview
//!
//! Shader-visible heaps own one descriptor set whose bindings are arrays of
//! `capacity` partially bound entries. Slot `i` of the heap is array element
//! `i` of the binding matching the view type:
//!
//! | binding | CBV/SRV/UAV heap | sampler heap |
//! |---------|------------------|--------------|
//! | 0       | uniform buffer   | sampler      |
//! | 1       | storage buffer   |              |
//! | 2       | sampled image    |              |
//! | 3       | storage image    |              |
//!
//! Render target and depth-stencil heaps are plain tables of image views.
//! Handles are synthetic: the CPU start is a process-unique base with an
//! increment of one, and the GPU start is the raw descriptor set handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use ash::vk::Handle;
use tracing::debug;

use super::DeviceShared;
use super::resource::{VulkanResource, aspect_mask, vk_format};
use super::VulkanBackend;
use crate::backend::{GpuDescriptorHeap, TextureDimension};
use crate::descriptor::{AddressMode, DescriptorHeapKind, DescriptorView, SamplerDesc, SamplerFilter};
use crate::error::{RhiError, RhiResult};

const UNIFORM_BUFFER_BINDING: u32 = 0;
const STORAGE_BUFFER_BINDING: u32 = 1;
const SAMPLED_IMAGE_BINDING: u32 = 2;
const STORAGE_IMAGE_BINDING: u32 = 3;
const SAMPLER_BINDING: u32 = 0;

static NEXT_HEAP_BASE: AtomicU64 = AtomicU64::new(0x1000);

/// Object created for a slot that must be destroyed when the slot is cleared.
#[derive(Clone, Copy)]
enum SlotObject {
    None,
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
}

/// A fixed-capacity descriptor table.
pub struct VulkanDescriptorHeap {
    shared: Arc<DeviceShared>,
    kind: DescriptorHeapKind,
    cpu_start: u64,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    slots: Vec<SlotObject>,
}

impl VulkanDescriptorHeap {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<Self> {
        let mut heap = Self {
            shared,
            kind,
            cpu_start: NEXT_HEAP_BASE.fetch_add(capacity as u64 + 1, Ordering::Relaxed),
            pool: vk::DescriptorPool::null(),
            layout: vk::DescriptorSetLayout::null(),
            set: vk::DescriptorSet::null(),
            slots: vec![SlotObject::None; capacity as usize],
        };

        if kind.is_shader_visible() {
            heap.create_set(capacity)?;
        }

        debug!("Created {} heap with {} slots", kind.name(), capacity);
        Ok(heap)
    }

    /// Descriptor set layout, null for heaps that are not shader visible.
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Descriptor set, null for heaps that are not shader visible.
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Image view written into `index`, if any.
    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        match self.slots.get(index as usize) {
            Some(SlotObject::ImageView(view)) => Some(*view),
            _ => None,
        }
    }

    fn create_set(&mut self, capacity: u32) -> RhiResult<()> {
        let types: &[(u32, vk::DescriptorType)] = match self.kind {
            DescriptorHeapKind::Sampler => &[(SAMPLER_BINDING, vk::DescriptorType::SAMPLER)],
            _ => &[
                (UNIFORM_BUFFER_BINDING, vk::DescriptorType::UNIFORM_BUFFER),
                (STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
                (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
                (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
            ],
        };

        let bindings: Vec<_> = types
            .iter()
            .map(|&(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(capacity)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let binding_flags = vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            bindings.len()
        ];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let device = self.shared.device();
        self.layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| self.shared.vk_error(e))?;

        let pool_sizes: Vec<_> = types
            .iter()
            .map(|&(_, ty)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: capacity,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        self.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| self.shared.vk_error(e))?;

        let layouts = [self.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| self.shared.vk_error(e))?;
        self.set = sets.first().copied().ok_or_else(|| {
            RhiError::Backend("descriptor set allocation returned nothing".to_string())
        })?;
        Ok(())
    }

    fn create_image_view(
        &self,
        resource: &VulkanResource,
        base_mip: u32,
        level_count: u32,
    ) -> RhiResult<vk::ImageView> {
        let (image, info) = resource.require_image()?;
        if base_mip >= info.mip_levels {
            return Err(RhiError::InvalidUsage(format!(
                "texture has {} mip levels, view requested level {}",
                info.mip_levels, base_mip
            )));
        }
        let view_type = match info.dimension {
            TextureDimension::D2 => vk::ImageViewType::TYPE_2D,
            TextureDimension::D3 => vk::ImageViewType::TYPE_3D,
        };
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(vk_format(info.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask(info.format))
                    .base_mip_level(base_mip)
                    .level_count(level_count)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        unsafe { self.shared.device().create_image_view(&create_info, None) }
            .map_err(|e| self.shared.vk_error(e))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        let (filter, mipmap_mode) = match desc.filter {
            SamplerFilter::Point => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
            SamplerFilter::Linear | SamplerFilter::Anisotropic => {
                (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR)
            }
        };
        let address_mode = match desc.address_mode {
            AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
            AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        };
        let anisotropy = desc.max_anisotropy() as f32;
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(anisotropy > 0.0)
            .max_anisotropy(anisotropy.min(self.shared.physical().max_anisotropy()).max(1.0))
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        unsafe { self.shared.device().create_sampler(&create_info, None) }
            .map_err(|e| self.shared.vk_error(e))
    }

    fn write_buffer(&self, index: u32, binding: u32, ty: vk::DescriptorType, resource: &VulkanResource) -> RhiResult<()> {
        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(resource.require_buffer()?)
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(ty)
            .buffer_info(&buffer_info);
        unsafe { self.shared.device().update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_image(&self, index: u32, binding: u32, ty: vk::DescriptorType, image_info: vk::DescriptorImageInfo) {
        let image_info = [image_info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(ty)
            .image_info(&image_info);
        unsafe { self.shared.device().update_descriptor_sets(&[write], &[]) };
    }

    /// Writes a shader-resource or unordered-access view.
    fn write_resource_view(
        &self,
        index: u32,
        resource: &VulkanResource,
        mip_level: u32,
        unordered: bool,
    ) -> RhiResult<SlotObject> {
        if resource.buffer().is_some() {
            if mip_level != 0 {
                return Err(RhiError::InvalidUsage(
                    "buffers have no mip levels".to_string(),
                ));
            }
            self.write_buffer(index, STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER, resource)?;
            return Ok(SlotObject::None);
        }

        let (binding, ty, layout, levels) = if unordered {
            (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE, vk::ImageLayout::GENERAL, 1)
        } else {
            (
                SAMPLED_IMAGE_BINDING,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::REMAINING_MIP_LEVELS,
            )
        };
        let view = self.create_image_view(resource, mip_level, levels)?;
        self.write_image(
            index,
            binding,
            ty,
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(layout),
        );
        Ok(SlotObject::ImageView(view))
    }

    fn destroy(&self, object: SlotObject) {
        let device = self.shared.device();
        unsafe {
            match object {
                SlotObject::None => {}
                SlotObject::ImageView(view) => device.destroy_image_view(view, None),
                SlotObject::Sampler(sampler) => device.destroy_sampler(sampler, None),
            }
        }
    }
}

impl GpuDescriptorHeap<VulkanBackend> for VulkanDescriptorHeap {
    fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn cpu_start(&self) -> u64 {
        self.cpu_start
    }

    fn gpu_start(&self) -> u64 {
        if self.kind.is_shader_visible() {
            self.set.as_raw()
        } else {
            0
        }
    }

    fn increment_size(&self) -> u64 {
        1
    }

    fn write(&mut self, index: u32, view: &DescriptorView<'_, VulkanBackend>) -> RhiResult<()> {
        if index as usize >= self.slots.len() {
            return Err(RhiError::InvalidDescriptor(format!(
                "slot {} out of range",
                index
            )));
        }
        self.shared.check_device()?;

        let object = match view {
            DescriptorView::ConstantBuffer(resource) => {
                self.write_buffer(
                    index,
                    UNIFORM_BUFFER_BINDING,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    resource,
                )?;
                SlotObject::None
            }
            DescriptorView::ShaderResource {
                resource,
                mip_level,
            } => self.write_resource_view(index, resource, *mip_level, false)?,
            DescriptorView::UnorderedAccess {
                resource,
                mip_level,
            } => self.write_resource_view(index, resource, *mip_level, true)?,
            DescriptorView::Sampler(desc) => {
                let sampler = self.create_sampler(desc)?;
                self.write_image(
                    index,
                    SAMPLER_BINDING,
                    vk::DescriptorType::SAMPLER,
                    vk::DescriptorImageInfo::default().sampler(sampler),
                );
                SlotObject::Sampler(sampler)
            }
            DescriptorView::RenderTarget(resource) | DescriptorView::DepthStencil(resource) => {
                SlotObject::ImageView(self.create_image_view(resource, 0, 1)?)
            }
        };

        self.clear(index);
        self.slots[index as usize] = object;
        Ok(())
    }

    fn clear(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            let object = std::mem::replace(slot, SlotObject::None);
            self.destroy(object);
        }
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        for object in std::mem::take(&mut self.slots) {
            self.destroy(object);
        }
        let device = self.shared.device();
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool, None);
            }
            if self.layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.layout, None);
            }
        }
        debug!("Destroyed {} heap", self.kind.name());
    }
}
