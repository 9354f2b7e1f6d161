//! Command buffers and queue submission.
//!
//! Each [`VulkanCommandList`] owns a transient command pool with a single
//! primary command buffer, so resetting the list resets its allocator too.

use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use super::DeviceShared;
use super::resource::{VulkanResource, aspect_mask};
use super::sync::VulkanFence;
use super::VulkanBackend;
use crate::backend::{GpuCommandList, GpuQueue, GpuResource, QueueKind, TextureFootprint};
use crate::error::{RhiError, RhiResult};

/// A primary command buffer with its own pool.
pub struct VulkanCommandList {
    shared: Arc<DeviceShared>,
    kind: QueueKind,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    commands: usize,
    recording: bool,
}

impl VulkanCommandList {
    pub(crate) fn new(shared: Arc<DeviceShared>, kind: QueueKind) -> RhiResult<Self> {
        let device = shared.device();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(shared.physical().queue_family);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| shared.vk_error(e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(shared.vk_error(e));
            }
        };

        let mut list = Self {
            shared,
            kind,
            pool,
            buffer,
            commands: 0,
            recording: false,
        };
        list.begin()?;
        debug!("Created {} command list", kind.name());
        Ok(list)
    }

    /// Returns the command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    fn begin(&mut self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.shared.device().begin_command_buffer(self.buffer, &begin_info) }
            .map_err(|e| self.shared.vk_error(e))?;
        self.commands = 0;
        self.recording = true;
        Ok(())
    }

    fn expect_open(&self) -> RhiResult<()> {
        if !self.recording {
            return Err(RhiError::Backend(
                "recording into a closed command list".to_string(),
            ));
        }
        Ok(())
    }

    fn image_barrier(
        &self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        (old_layout, src_access, src_stage): (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags),
        (new_layout, dst_access, dst_stage): (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags),
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range);
        unsafe {
            self.shared.device().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl GpuCommandList<VulkanBackend> for VulkanCommandList {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn reset(&mut self) -> RhiResult<()> {
        unsafe {
            self.shared
                .device()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| self.shared.vk_error(e))?;
        self.begin()
    }

    fn close(&mut self) -> RhiResult<()> {
        self.expect_open()?;
        unsafe { self.shared.device().end_command_buffer(self.buffer) }
            .map_err(|e| self.shared.vk_error(e))?;
        self.recording = false;
        Ok(())
    }

    fn copy_buffer(&mut self, dst: &VulkanResource, src: &VulkanResource, size: u64) -> RhiResult<()> {
        self.expect_open()?;
        let capacity = dst.size().min(src.size());
        if size > capacity {
            return Err(RhiError::WriteOutOfBounds { size, capacity });
        }
        let dst_buffer = dst.require_buffer()?;
        let src_buffer = src.require_buffer()?;

        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.shared
                .device()
                .cmd_copy_buffer(self.buffer, src_buffer, dst_buffer, &[region]);
        }
        self.commands += 1;
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        dst: &VulkanResource,
        src: &VulkanResource,
        footprint: &TextureFootprint,
    ) -> RhiResult<()> {
        self.expect_open()?;
        let (image, info) = dst.require_image()?;
        if footprint.mip_level >= info.mip_levels {
            return Err(RhiError::InvalidUsage(format!(
                "'{}' has no mip level {}",
                dst.desc().name,
                footprint.mip_level
            )));
        }
        if footprint.upload_size() > src.size() {
            return Err(RhiError::WriteOutOfBounds {
                size: footprint.upload_size(),
                capacity: src.size(),
            });
        }
        let src_buffer = src.require_buffer()?;

        let aspect = aspect_mask(footprint.format);
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(footprint.mip_level)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        self.image_barrier(
            image,
            range,
            (
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TOP_OF_PIPE,
            ),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
        );

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length((footprint.row_pitch / footprint.format.bytes_per_texel() as u64) as u32)
            .buffer_image_height(footprint.height)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(footprint.mip_level)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: footprint.width,
                height: footprint.height,
                depth: footprint.depth,
            });
        unsafe {
            self.shared.device().cmd_copy_buffer_to_image(
                self.buffer,
                src_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.image_barrier(
            image,
            range,
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
        );

        self.commands += 1;
        Ok(())
    }

    fn command_count(&self) -> usize {
        self.commands
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        unsafe {
            self.shared.device().destroy_command_pool(self.pool, None);
        }
        debug!("Destroyed {} command list", self.kind.name());
    }
}

/// A submission queue.
///
/// Waits recorded with [`GpuQueue::wait`] are attached to the next
/// submission on this queue; the waited fence must outlive that submission.
pub struct VulkanQueue {
    shared: Arc<DeviceShared>,
    kind: QueueKind,
    pending_waits: Mutex<Vec<(vk::Semaphore, u64)>>,
}

impl VulkanQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>, kind: QueueKind) -> Self {
        Self {
            shared,
            kind,
            pending_waits: Mutex::new(Vec::new()),
        }
    }

    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        signal: Option<(vk::Semaphore, u64)>,
    ) -> RhiResult<()> {
        self.shared.check_device()?;

        let waits = std::mem::take(
            &mut *self
                .pending_waits
                .lock()
                .map_err(|_| RhiError::Backend("queue wait list poisoned".to_string()))?,
        );
        let (wait_semaphores, wait_values): (Vec<_>, Vec<_>) = waits.into_iter().unzip();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let (signal_semaphores, signal_values): (Vec<_>, Vec<_>) = signal.into_iter().unzip();

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let queue = self.shared.queue()?;
        unsafe {
            self.shared
                .device()
                .queue_submit(*queue, &[submit_info], vk::Fence::null())
        }
        .map_err(|e| self.shared.vk_error(e))
    }
}

impl GpuQueue<VulkanBackend> for VulkanQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn execute(&self, lists: &[&VulkanCommandList]) -> RhiResult<()> {
        let buffers: Vec<_> = lists.iter().map(|list| list.buffer).collect();
        self.submit(&buffers, None)
    }

    fn signal(&self, fence: &VulkanFence, value: u64) -> RhiResult<()> {
        self.submit(&[], Some((fence.handle(), value)))
    }

    fn wait(&self, fence: &VulkanFence, value: u64) -> RhiResult<()> {
        self.pending_waits
            .lock()
            .map_err(|_| RhiError::Backend("queue wait list poisoned".to_string()))?
            .push((fence.handle(), value));
        Ok(())
    }
}
