//! The render device: frame counter, upload path and resource registry.
//!
//! [`RenderDevice`] owns every pool of the frame pipeline and drives the
//! per-frame lifecycle:
//!
//! - the global frame number
//! - a copy queue, copy fence and recycled upload command lists
//! - the [`DescriptorHeapPool`]
//! - the deferred [`ReleaseQueue`]
//! - slot maps of registered [`Buffer`]s and [`Texture`]s, addressed by
//!   generational handles
//!
//! # Frame lifecycle
//!
//! Once per frame the render loop submits the upload list with
//! [`RenderDevice::execute_uploading`] and, after polling its own frame
//! fence, calls [`RenderDevice::finish_frame`] with the newest completed frame.
//! `finish_frame` runs, in order:
//!
//! 1. drain the release queue up to the completed frame
//! 2. queue this frame's submitted upload list, then recycle upload command
//!    lists up to the completed frame
//! 3. reclaim completed upload resources of every buffer
//! 4. advance the frame number and the copy fence's expected value
//! 5. stage the new frame's upload resource in every buffer
//!
//! Reclaiming before the counter advances keeps a resource from being tagged
//! with two frame generations.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameflight_rhi::buffer::{BufferDesc, BufferUsage};
//! use frameflight_rhi::device::{DeviceConfig, RenderDevice};
//! use frameflight_rhi::software::SoftwareBackend;
//!
//! # fn main() -> Result<(), frameflight_rhi::RhiError> {
//! let mut device = RenderDevice::new(Arc::new(SoftwareBackend::new()), DeviceConfig::default())?;
//! let buffer = device.create_buffer(BufferDesc::new("data", 1, 64, BufferUsage::Default), None)?;
//! device.write_buffer(buffer, &[42; 64], 0)?;
//!
//! let frame = device.frame_number();
//! device.execute_uploading()?.wait_for_gpu()?;
//! device.finish_frame(frame)?;
//! assert_eq!(device.buffer(buffer)?.in_flight_count(), 0);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use slotmap::{SlotMap, new_key_type};
use tracing::{debug, error, info, warn};

use crate::backend::{QueueKind, RenderBackend};
use crate::buffer::{Buffer, BufferDesc, BufferViewKind, UploadContext};
use crate::command::{CommandList, CommandListRecycler, CommandListState, CommandQueue};
use crate::descriptor::{Descriptor, DescriptorCapacities, DescriptorHeapPool, SamplerDesc};
use crate::error::{RhiError, RhiResult};
use crate::fence::Fence;
use crate::release::{ReleaseQueue, Retired};
use crate::texture::{Sampler, Texture, TextureDesc};

/// Construction parameters for a [`RenderDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Frame number of the first frame
    pub initial_frame: u64,
    /// Capacity of each descriptor table
    pub descriptor_capacities: DescriptorCapacities,
    /// Upper bound on upload command lists
    pub max_command_lists: usize,
    /// Upper bound on every fence wait
    pub gpu_wait_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            initial_frame: 1,
            descriptor_capacities: DescriptorCapacities::default(),
            max_command_lists: 8,
            gpu_wait_timeout: Duration::from_secs(5),
        }
    }
}

new_key_type! {
    /// Handle to a buffer registered with a [`RenderDevice`].
    pub struct BufferHandle;

    /// Handle to a texture registered with a [`RenderDevice`].
    pub struct TextureHandle;
}

/// What one [`RenderDevice::finish_frame`] call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Frame the caller reported complete
    pub completed_frame: u64,
    /// Frame number after the call
    pub frame_number: u64,
    /// Release queue entries destroyed or returned to the descriptor pool
    pub released: usize,
    /// Upload command lists recycled
    pub command_lists_recycled: usize,
    /// Buffer upload resources destroyed or pooled
    pub upload_resources_reclaimed: usize,
    /// True if a recorded but unsubmitted upload list had to be submitted
    pub auto_submitted_uploads: bool,
}

/// Owner of the frame pipeline's pools and registries.
pub struct RenderDevice<B: RenderBackend> {
    backend: Arc<B>,
    config: DeviceConfig,
    frame_number: u64,
    copy_queue: CommandQueue<B>,
    copy_fence: Fence<B>,
    copy_signaled: Option<u64>,
    upload_generation: u64,
    upload_list: CommandList<B>,
    upload_lists: CommandListRecycler<B>,
    descriptor_pool: DescriptorHeapPool<B>,
    release_queue: ReleaseQueue<Retired<B>>,
    buffers: SlotMap<BufferHandle, Buffer<B>>,
    textures: SlotMap<TextureHandle, Texture<B>>,
}

impl<B: RenderBackend> RenderDevice<B> {
    /// Creates a device on `backend`.
    ///
    /// # Arguments
    ///
    /// * `backend` - GPU to drive; shared with whoever else submits to it
    /// * `config` - Pool sizes, initial frame number and wait timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is lost or any pool cannot be created.
    pub fn new(backend: Arc<B>, config: DeviceConfig) -> RhiResult<Self> {
        backend.check_device()?;

        let copy_queue = CommandQueue::new(&*backend, QueueKind::Copy)?;
        let copy_fence = Fence::new(&*backend, config.initial_frame, config.gpu_wait_timeout)?;
        let descriptor_pool = DescriptorHeapPool::new(&*backend, config.descriptor_capacities)?;
        let mut upload_lists = CommandListRecycler::new(QueueKind::Copy, config.max_command_lists);
        let upload_list = upload_lists.acquire(&*backend)?;

        info!(
            "Render device created on {} backend (frame {}, {} upload lists max)",
            backend.name(),
            config.initial_frame,
            config.max_command_lists
        );

        Ok(Self {
            backend,
            config,
            frame_number: config.initial_frame,
            copy_queue,
            copy_fence,
            copy_signaled: None,
            upload_generation: 0,
            upload_list,
            upload_lists,
            descriptor_pool,
            release_queue: ReleaseQueue::new(),
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
        })
    }

    // ===== Upload List =====

    /// Makes sure the upload list is open for recording.
    ///
    /// A list already submitted this frame is handed to the recycler and a
    /// fresh one takes its place.
    fn ensure_upload_recording(&mut self) -> RhiResult<()> {
        match self.upload_list.state() {
            CommandListState::Recording => Ok(()),
            CommandListState::Closed => self.rotate_upload_list(self.frame_number),
            CommandListState::InFlight(_) | CommandListState::Completed => {
                self.upload_list.reset()
            }
        }
    }

    fn rotate_upload_list(&mut self, frame: u64) -> RhiResult<()> {
        let fresh = self.upload_lists.acquire(&*self.backend)?;
        let submitted = std::mem::replace(&mut self.upload_list, fresh);
        self.upload_lists.submit(frame, submitted)
    }

    /// Upload command list for the current frame, open for recording.
    pub fn upload_command_list(&mut self) -> RhiResult<&mut CommandList<B>> {
        self.ensure_upload_recording()?;
        Ok(&mut self.upload_list)
    }

    /// Closes and submits the upload list on the copy queue, then signals the
    /// copy fence with its expected value.
    ///
    /// Calling it again in the same frame without new uploads only returns
    /// the fence. A second batch recorded after the first submission moves
    /// the expected value past the one already signaled, so the returned
    /// fence covers every batch and no value is signaled twice.
    pub fn execute_uploading(&mut self) -> RhiResult<&Fence<B>> {
        if self.upload_list.state() == CommandListState::Recording {
            self.upload_list.close()?;
            self.copy_queue.execute(&[&self.upload_list])?;
            self.upload_generation += 1;

            if self.copy_signaled == Some(self.copy_fence.expected_value()) {
                self.copy_fence.increment_expected_value();
                debug!(
                    "Frame {} submitted another upload batch; copy fence now expects {}",
                    self.frame_number,
                    self.copy_fence.expected_value()
                );
            }
            self.copy_fence.signal(&self.copy_queue)?;
            self.copy_signaled = Some(self.copy_fence.expected_value());
        }
        Ok(&self.copy_fence)
    }

    // ===== Buffers =====

    /// Creates and registers a buffer, optionally uploading initial data.
    pub fn create_buffer(&mut self, desc: BufferDesc, data: Option<&[u8]>) -> RhiResult<BufferHandle> {
        self.ensure_upload_recording()?;
        let mut ctx = UploadContext {
            backend: &*self.backend,
            frame_number: self.frame_number,
            upload_generation: self.upload_generation,
            command_list: &mut self.upload_list,
            release_queue: &mut self.release_queue,
        };
        let buffer = Buffer::new(&mut ctx, desc, data)?;
        Ok(self.buffers.insert(buffer))
    }

    /// Unregisters a buffer and defers destruction of its resources.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> RhiResult<()> {
        let buffer = self
            .buffers
            .remove(handle)
            .ok_or_else(|| unregistered("buffer", handle))?;
        buffer.retire(self.frame_number, &mut self.release_queue);
        Ok(())
    }

    /// Registered buffer.
    pub fn buffer(&self, handle: BufferHandle) -> RhiResult<&Buffer<B>> {
        self.buffers
            .get(handle)
            .ok_or_else(|| unregistered("buffer", handle))
    }

    /// Writes `data` into a buffer for the current frame.
    ///
    /// # Errors
    ///
    /// - [`RhiError::UnregisteredResource`] for a stale handle
    /// - [`RhiError::WriteOutOfBounds`] if the data does not fit
    pub fn write_buffer(&mut self, handle: BufferHandle, data: &[u8], alignment: u64) -> RhiResult<()> {
        self.ensure_upload_recording()?;
        let buffer = self
            .buffers
            .get_mut(handle)
            .ok_or_else(|| unregistered("buffer", handle))?;
        let mut ctx = UploadContext {
            backend: &*self.backend,
            frame_number: self.frame_number,
            upload_generation: self.upload_generation,
            command_list: &mut self.upload_list,
            release_queue: &mut self.release_queue,
        };
        buffer.write(&mut ctx, data, alignment)
    }

    /// Writes a slice of plain-old-data values into a buffer.
    pub fn write_buffer_pod<T: bytemuck::Pod>(
        &mut self,
        handle: BufferHandle,
        data: &[T],
    ) -> RhiResult<()> {
        self.write_buffer(handle, bytemuck::cast_slice(data), 0)
    }

    /// Schedules an out-of-cadence re-upload of a default-usage buffer.
    pub fn request_write(&mut self, handle: BufferHandle) -> RhiResult<()> {
        self.ensure_upload_recording()?;
        let buffer = self
            .buffers
            .get_mut(handle)
            .ok_or_else(|| unregistered("buffer", handle))?;
        let mut ctx = UploadContext {
            backend: &*self.backend,
            frame_number: self.frame_number,
            upload_generation: self.upload_generation,
            command_list: &mut self.upload_list,
            release_queue: &mut self.release_queue,
        };
        buffer.request_write(&mut ctx)
    }

    /// Allocates a descriptor viewing a buffer's current resource.
    ///
    /// The caller owns the descriptor and returns it with
    /// [`free_descriptor`](Self::free_descriptor) or
    /// [`safe_release_descriptor`](Self::safe_release_descriptor).
    pub fn allocate_buffer_descriptor(
        &mut self,
        handle: BufferHandle,
        view: BufferViewKind,
    ) -> RhiResult<Descriptor> {
        let buffer = self
            .buffers
            .get(handle)
            .ok_or_else(|| unregistered("buffer", handle))?;
        let resource = buffer.current_resource().ok_or_else(|| {
            RhiError::InvalidUsage(format!(
                "buffer '{}' has no resource staged for frame {}",
                buffer.desc().name,
                self.frame_number
            ))
        })?;
        match view {
            BufferViewKind::Constant => self.descriptor_pool.allocate_cb_descriptor(resource),
            BufferViewKind::ShaderResource => {
                self.descriptor_pool.allocate_sr_descriptor(resource, 0)
            }
            BufferViewKind::UnorderedAccess => {
                self.descriptor_pool.allocate_ua_descriptor(resource, 0)
            }
        }
    }

    // ===== Textures =====

    /// Creates and registers a texture, optionally uploading texel data.
    pub fn create_texture(
        &mut self,
        desc: TextureDesc,
        data: Option<&[u8]>,
    ) -> RhiResult<TextureHandle> {
        self.ensure_upload_recording()?;
        let mut ctx = UploadContext {
            backend: &*self.backend,
            frame_number: self.frame_number,
            upload_generation: self.upload_generation,
            command_list: &mut self.upload_list,
            release_queue: &mut self.release_queue,
        };
        let texture = Texture::new(&mut ctx, desc, data)?;
        Ok(self.textures.insert(texture))
    }

    /// Unregisters a texture and defers destruction of its resource and descriptors.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> RhiResult<()> {
        let texture = self
            .textures
            .remove(handle)
            .ok_or_else(|| unregistered("texture", handle))?;
        texture.retire(self.frame_number, &mut self.release_queue);
        Ok(())
    }

    /// Registered texture.
    pub fn texture(&self, handle: TextureHandle) -> RhiResult<&Texture<B>> {
        self.textures
            .get(handle)
            .ok_or_else(|| unregistered("texture", handle))
    }

    /// Shader resource view of one mip level of a texture.
    pub fn texture_srv(&mut self, handle: TextureHandle, mip: u32) -> RhiResult<Descriptor> {
        let texture = self
            .textures
            .get_mut(handle)
            .ok_or_else(|| unregistered("texture", handle))?;
        texture.srv(&mut self.descriptor_pool, mip)
    }

    /// Unordered access view of one mip level of a texture.
    pub fn texture_uav(&mut self, handle: TextureHandle, mip: u32) -> RhiResult<Descriptor> {
        let texture = self
            .textures
            .get_mut(handle)
            .ok_or_else(|| unregistered("texture", handle))?;
        texture.uav(&mut self.descriptor_pool, mip)
    }

    /// Render target view of a texture.
    pub fn texture_rtv(&mut self, handle: TextureHandle) -> RhiResult<Descriptor> {
        let texture = self
            .textures
            .get_mut(handle)
            .ok_or_else(|| unregistered("texture", handle))?;
        texture.rtv(&mut self.descriptor_pool)
    }

    /// Depth-stencil view of a texture.
    pub fn texture_dsv(&mut self, handle: TextureHandle) -> RhiResult<Descriptor> {
        let texture = self
            .textures
            .get_mut(handle)
            .ok_or_else(|| unregistered("texture", handle))?;
        texture.dsv(&mut self.descriptor_pool)
    }

    // ===== Descriptors =====

    /// Allocates a sampler descriptor.
    pub fn create_sampler_descriptor(&mut self, desc: &SamplerDesc) -> RhiResult<Descriptor> {
        self.descriptor_pool.allocate_sampler_descriptor(desc)
    }

    /// Descriptor of `sampler`, allocated on first use.
    pub fn sampler_descriptor(&mut self, sampler: &mut Sampler) -> RhiResult<Descriptor> {
        sampler.descriptor(&mut self.descriptor_pool)
    }

    /// Defers a sampler's descriptor until the current frame completes.
    pub fn destroy_sampler(&mut self, sampler: Sampler) {
        sampler.retire(self.frame_number, &mut self.release_queue);
    }

    /// Returns a descriptor to its table immediately.
    ///
    /// Only safe when no submitted work references it.
    pub fn free_descriptor(&mut self, descriptor: Descriptor) -> RhiResult<()> {
        self.descriptor_pool.free(descriptor)
    }

    /// Returns a descriptor to its table once the current frame completes.
    pub fn safe_release_descriptor(&mut self, descriptor: Descriptor) {
        if descriptor.valid() {
            self.release_queue
                .push(self.frame_number, Retired::Descriptor(descriptor));
        }
    }

    /// Destroys `resource` once `frame` (default: the current frame) completes.
    pub fn safe_release(&mut self, resource: B::Resource, frame: Option<u64>) {
        let frame = frame.unwrap_or(self.frame_number);
        self.release_queue.push(frame, Retired::Resource(resource));
    }

    // ===== Frame Lifecycle =====

    /// Retires everything the GPU finished up to `completed_frame` and opens
    /// the next frame.
    ///
    /// An upload list that recorded copies but was never submitted is
    /// submitted first so its copies are not lost.
    ///
    /// # Errors
    ///
    /// - [`RhiError::DeviceLost`] if the backend is gone
    /// - [`RhiError::PoolExhausted`] if no upload list is free for the new frame
    /// - the first error from returning a deferred descriptor (after the
    ///   frame has still been advanced)
    pub fn finish_frame(&mut self, completed_frame: u64) -> RhiResult<FrameReport> {
        self.backend.check_device()?;

        let mut report = FrameReport {
            completed_frame,
            ..FrameReport::default()
        };

        if self.upload_list.state() == CommandListState::Recording && !self.upload_list.is_empty()
        {
            warn!(
                "Upload list for frame {} recorded {} commands but was never submitted; submitting",
                self.frame_number,
                self.upload_list.command_count()
            );
            self.execute_uploading()?;
            report.auto_submitted_uploads = true;
        }

        // 1. Deferred releases.
        let pool = &mut self.descriptor_pool;
        let mut descriptor_error = None;
        report.released = self
            .release_queue
            .finish_frame_with(completed_frame, |item| match item {
                Retired::Resource(resource) => drop(resource),
                Retired::Descriptor(descriptor) => {
                    if let Err(e) = pool.free(descriptor) {
                        error!("Failed to return deferred descriptor: {}", e);
                        descriptor_error.get_or_insert(e);
                    }
                }
            });

        // 2. Command lists. This frame's submitted list is queued before the
        // second recycle pass.
        report.command_lists_recycled = self.upload_lists.finish_frame(completed_frame);
        if self.upload_list.state() == CommandListState::Closed {
            self.rotate_upload_list(self.frame_number)?;
            report.command_lists_recycled += self.upload_lists.finish_frame(completed_frame);
        }

        // 3. Buffer upload resources.
        report.upload_resources_reclaimed = self
            .buffers
            .values_mut()
            .map(|buffer| buffer.finish_frame(completed_frame))
            .sum();

        // 4. Advance.
        let finished_frame = self.frame_number;
        self.frame_number += 1;
        self.copy_fence.increment_expected_value();

        // 5. Stage the new frame.
        for buffer in self.buffers.values_mut() {
            buffer.begin_frame(&*self.backend, self.frame_number)?;
        }

        report.frame_number = self.frame_number;
        debug!(
            "Finished frame {} (completed {}): {} released, {} lists recycled, {} uploads reclaimed",
            finished_frame,
            completed_frame,
            report.released,
            report.command_lists_recycled,
            report.upload_resources_reclaimed
        );

        match descriptor_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Submits pending uploads, waits for the copy queue and releases
    /// everything deferred.
    ///
    /// Work on other queues must already be complete.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] or [`RhiError::DeviceLost`] if the copy
    /// queue does not drain.
    pub fn flush(&mut self) -> RhiResult<()> {
        self.execute_uploading()?.wait_for_gpu()?;

        let pool = &mut self.descriptor_pool;
        let mut descriptor_error = None;
        let released = self.release_queue.drain_all_with(|item| {
            if let Retired::Descriptor(descriptor) = item
                && let Err(e) = pool.free(descriptor)
            {
                descriptor_error.get_or_insert(e);
            }
        });
        self.upload_lists.finish_frame(u64::MAX);
        for buffer in self.buffers.values_mut() {
            buffer.finish_frame(u64::MAX);
        }
        if self.upload_list.state() == CommandListState::Closed {
            self.upload_list.reset()?;
        }

        debug!("Flushed render device at frame {} ({} released)", self.frame_number, released);
        descriptor_error.map_or(Ok(()), Err)
    }

    // ===== Factories =====

    /// Creates a fence bounded by the device's wait timeout.
    pub fn create_fence(&self, initial_expected: u64) -> RhiResult<Fence<B>> {
        Fence::new(&*self.backend, initial_expected, self.config.gpu_wait_timeout)
    }

    /// Opens a queue of the given type.
    pub fn create_queue(&self, kind: QueueKind) -> RhiResult<CommandQueue<B>> {
        CommandQueue::new(&*self.backend, kind)
    }

    /// Creates a standalone command list in the recording state.
    pub fn create_command_list(&self, kind: QueueKind) -> RhiResult<CommandList<B>> {
        CommandList::new(&*self.backend, kind)
    }

    /// Creates a descriptor pool separate from the device's own.
    pub fn create_descriptor_pool(
        &self,
        capacities: DescriptorCapacities,
    ) -> RhiResult<DescriptorHeapPool<B>> {
        DescriptorHeapPool::new(&*self.backend, capacities)
    }

    // ===== Accessors =====

    /// Backend the device drives.
    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Construction parameters.
    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current frame number.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Fence signaled by upload submissions.
    #[inline]
    pub fn copy_fence(&self) -> &Fence<B> {
        &self.copy_fence
    }

    /// Queue upload lists execute on.
    #[inline]
    pub fn copy_queue(&self) -> &CommandQueue<B> {
        &self.copy_queue
    }

    /// The device's descriptor tables.
    #[inline]
    pub fn descriptor_pool(&self) -> &DescriptorHeapPool<B> {
        &self.descriptor_pool
    }

    /// Recycler of upload command lists.
    #[inline]
    pub fn upload_lists(&self) -> &CommandListRecycler<B> {
        &self.upload_lists
    }

    /// Entries waiting in the release queue.
    #[inline]
    pub fn pending_releases(&self) -> usize {
        self.release_queue.len()
    }

    /// Registered buffers.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Registered textures.
    #[inline]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }
}

impl<B: RenderBackend> Drop for RenderDevice<B> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Render device flush on drop failed: {}", e);
        }
        for (_, buffer) in self.buffers.drain() {
            drop(buffer);
        }
        for (_, texture) in self.textures.drain() {
            texture.retire(self.frame_number, &mut self.release_queue);
        }
        self.release_queue.drain_all_with(drop);
        debug!("Destroyed render device at frame {}", self.frame_number);
    }
}

fn unregistered(what: &str, handle: impl slotmap::Key) -> RhiError {
    RhiError::UnregisteredResource(format!(
        "{} {:?} is not registered",
        what,
        handle.data()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureFormat;
    use crate::buffer::BufferUsage;
    use crate::software::SoftwareBackend;

    fn assert_send<T: Send>() {}

    fn device() -> RenderDevice<SoftwareBackend> {
        RenderDevice::new(Arc::new(SoftwareBackend::new()), DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_render_device_is_send() {
        assert_send::<RenderDevice<SoftwareBackend>>();
    }

    #[test]
    fn test_initial_state() {
        let device = device();
        assert_eq!(device.frame_number(), 1);
        assert_eq!(device.copy_fence().expected_value(), 1);
        assert_eq!(device.upload_lists().created_count(), 1);
        assert_eq!(device.pending_releases(), 0);
    }

    #[test]
    fn test_finish_frame_advances_in_lockstep() {
        let mut device = device();
        let report = device.finish_frame(0).unwrap();
        assert_eq!(report.frame_number, 2);
        assert_eq!(device.frame_number(), 2);
        assert_eq!(device.copy_fence().expected_value(), 2);
    }

    #[test]
    fn test_stale_buffer_handle_is_unregistered() {
        let mut device = device();
        let handle = device
            .create_buffer(BufferDesc::new("b", 4, 4, BufferUsage::Default), None)
            .unwrap();
        device.destroy_buffer(handle).unwrap();

        assert!(matches!(
            device.buffer(handle),
            Err(RhiError::UnregisteredResource(_))
        ));
        assert!(matches!(
            device.write_buffer(handle, &[0; 4], 0),
            Err(RhiError::UnregisteredResource(_))
        ));
        assert!(matches!(
            device.destroy_buffer(handle),
            Err(RhiError::UnregisteredResource(_))
        ));
    }

    #[test]
    fn test_recycled_slot_rejects_old_handle() {
        let mut device = device();
        let first = device
            .create_texture(TextureDesc::new_2d("a", 4, 4, TextureFormat::Rgba8Unorm), None)
            .unwrap();
        device.destroy_texture(first).unwrap();
        let second = device
            .create_texture(TextureDesc::new_2d("b", 4, 4, TextureFormat::Rgba8Unorm), None)
            .unwrap();

        assert_ne!(first, second);
        assert!(matches!(
            device.texture(first),
            Err(RhiError::UnregisteredResource(_))
        ));
        assert_eq!(device.texture(second).unwrap().desc().name, "b");
        assert_eq!(device.texture_count(), 1);
    }

    #[test]
    fn test_unsubmitted_uploads_are_auto_submitted() {
        let mut device = device();
        let handle = device
            .create_buffer(BufferDesc::new("b", 1, 8, BufferUsage::Default), None)
            .unwrap();
        device.write_buffer(handle, &[5; 8], 0).unwrap();

        let report = device.finish_frame(0).unwrap();
        assert!(report.auto_submitted_uploads);
        assert_eq!(device.upload_lists().in_flight_count(), 1);

        let contents = device
            .buffer(handle)
            .unwrap()
            .default_resource()
            .unwrap()
            .contents();
        assert_eq!(contents, vec![5; 8]);
    }

    #[test]
    fn test_unused_upload_list_is_kept() {
        let mut device = device();
        device.finish_frame(0).unwrap();
        device.finish_frame(1).unwrap();
        assert_eq!(device.upload_lists().created_count(), 1);
        assert_eq!(device.upload_lists().in_flight_count(), 0);
    }

    #[test]
    fn test_uploads_after_submission_use_a_fresh_list() {
        let mut device = device();
        let handle = device
            .create_buffer(BufferDesc::new("b", 1, 8, BufferUsage::Default), None)
            .unwrap();
        device.write_buffer(handle, &[1; 8], 0).unwrap();
        device.execute_uploading().unwrap();

        device.request_write(handle).unwrap();
        assert_eq!(device.upload_lists().created_count(), 2);
        assert_eq!(device.upload_lists().in_flight_count(), 1);
        assert_eq!(device.upload_command_list().unwrap().command_count(), 1);
    }

    #[test]
    fn test_safe_release_descriptor_waits_for_frame() {
        let mut device = device();
        let sampler = device
            .create_sampler_descriptor(&SamplerDesc::default())
            .unwrap();
        device.safe_release_descriptor(sampler);

        device.finish_frame(0).unwrap();
        assert_eq!(device.descriptor_pool().allocated_count(), 1);

        let report = device.finish_frame(1).unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(device.descriptor_pool().allocated_count(), 0);
    }

    #[test]
    fn test_deferred_double_free_is_reported() {
        let mut device = device();
        let sampler = device
            .create_sampler_descriptor(&SamplerDesc::default())
            .unwrap();
        device.free_descriptor(sampler).unwrap();
        device.safe_release_descriptor(sampler);

        assert!(matches!(
            device.finish_frame(1),
            Err(RhiError::DoubleFree { .. })
        ));
        assert_eq!(device.frame_number(), 2);
    }

    #[test]
    fn test_buffer_descriptor_views_current_resource() {
        let mut device = device();
        let handle = device
            .create_buffer(BufferDesc::new("cb", 256, 1, BufferUsage::Upload), None)
            .unwrap();
        let descriptor = device
            .allocate_buffer_descriptor(handle, BufferViewKind::Constant)
            .unwrap();
        assert!(descriptor.valid());
        device.free_descriptor(descriptor).unwrap();
    }

    #[test]
    fn test_factories() {
        let device = device();
        let fence = device.create_fence(3).unwrap();
        assert_eq!(fence.expected_value(), 3);
        assert_eq!(fence.wait_timeout(), device.config().gpu_wait_timeout);
        assert_eq!(
            device.create_queue(QueueKind::Compute).unwrap().kind(),
            QueueKind::Compute
        );
        assert_eq!(
            device.create_command_list(QueueKind::Graphics).unwrap().state(),
            CommandListState::Recording
        );
        let pool = device
            .create_descriptor_pool(DescriptorCapacities::uniform(2))
            .unwrap();
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_sampler_descriptor_is_cached_and_deferred() {
        let mut device = device();
        let mut sampler = Sampler::new(SamplerDesc::default());
        let first = device.sampler_descriptor(&mut sampler).unwrap();
        assert_eq!(device.sampler_descriptor(&mut sampler).unwrap(), first);
        assert_eq!(device.descriptor_pool().allocated_count(), 1);

        device.destroy_sampler(sampler);
        assert_eq!(device.pending_releases(), 1);
        device.finish_frame(1).unwrap();
        assert_eq!(device.descriptor_pool().allocated_count(), 0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let backend = SoftwareBackend::new();
        {
            let mut device =
                RenderDevice::new(Arc::new(backend.clone()), DeviceConfig::default()).unwrap();
            let buffer = device
                .create_buffer(BufferDesc::new("b", 4, 4, BufferUsage::Default), Some(&[1; 16]))
                .unwrap();
            device
                .create_texture(
                    TextureDesc::new_2d("t", 2, 2, crate::backend::TextureFormat::Rgba8Unorm),
                    Some(&[0; 16]),
                )
                .unwrap();
            device.destroy_buffer(buffer).unwrap();
        }
        assert_eq!(backend.stats().resources_alive, 0);
        assert_eq!(backend.stats().use_after_free, 0);
    }
}
