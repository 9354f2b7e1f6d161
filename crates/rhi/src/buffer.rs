//! Frame-pipelined buffers.
//!
//! A [`Buffer`] lets the CPU feed data to the GPU without either side
//! stalling on the other. Two usages are supported:
//!
//! - [`BufferUsage::Default`]: one GPU-resident resource that shaders read.
//!   CPU data goes into a freshly allocated upload resource and reaches the
//!   default resource through a copy recorded on the shared upload list. The
//!   upload resource is destroyed once its frame completes.
//! - [`BufferUsage::Upload`]: only upload resources, one per frame in flight,
//!   read by the GPU directly. Completed ones go back to a reuse pool, so a
//!   steady frame loop stops allocating after `frames_in_flight + 1` frames.
//!
//! # Overview
//!
//! Every upload resource is stamped with the frame it was staged for and
//! queued in order. [`Buffer::finish_frame`] pops the stamps the GPU has
//! completed; nothing stamped later than the completed frame is destroyed or
//! reused.
//!
//! Buffers never talk to the device directly. Operations that record copies
//! take an [`UploadContext`] carrying the backend, the current frame number
//! and the upload command list.
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
//! let vertices = device.create_buffer(BufferDesc::new("vertices", 4, 16, BufferUsage::Default), None)?;
//! device.write_buffer(vertices, &[7u8; 64], 0)?;
//! assert_eq!(device.buffer(vertices)?.in_flight_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use tracing::debug;

use crate::backend::{GpuResource, MemoryKind, RenderBackend, ResourceDesc, align_up};
use crate::command::CommandList;
use crate::error::{RhiError, RhiResult};
use crate::release::{ReleaseQueue, Retired};

/// How a buffer's memory is laid out across frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// GPU-resident resource fed by copies from per-write upload resources
    Default,
    /// Upload resources rotated frame to frame, read by the GPU directly
    Upload,
}

impl BufferUsage {
    /// Returns a human-readable name for the usage.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Default => "default",
            BufferUsage::Upload => "upload",
        }
    }
}

/// How a descriptor views a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferViewKind {
    /// Constant buffer
    Constant,
    /// Read-only structured view
    ShaderResource,
    /// Read-write structured view
    UnorderedAccess,
}

/// Creation parameters for a [`Buffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    /// Debug name
    pub name: String,
    /// Bytes per element
    pub stride: u32,
    /// Number of elements
    pub count: u32,
    /// Memory layout
    pub usage: BufferUsage,
}

impl BufferDesc {
    /// Describes a buffer of `count` elements of `stride` bytes.
    pub fn new(name: impl Into<String>, stride: u32, count: u32, usage: BufferUsage) -> Self {
        Self {
            name: name.into(),
            stride,
            count,
            usage,
        }
    }

    /// Describes a buffer sized for `count` values of `T`.
    pub fn for_type<T>(name: impl Into<String>, count: u32, usage: BufferUsage) -> Self {
        Self::new(name, std::mem::size_of::<T>() as u32, count, usage)
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.stride as u64 * self.count as u64
    }
}

/// What a buffer needs from the device to record uploads.
pub struct UploadContext<'a, B: RenderBackend> {
    /// Device that allocates upload resources
    pub backend: &'a B,
    /// Frame new upload resources are stamped with
    pub frame_number: u64,
    /// Number of upload lists submitted so far; identifies `command_list`
    pub upload_generation: u64,
    /// Shared upload list; must be recording
    pub command_list: &'a mut CommandList<B>,
    /// Destination for resources retired during the upload
    pub release_queue: &'a mut ReleaseQueue<Retired<B>>,
}

/// A buffer whose CPU writes are staged per frame.
pub struct Buffer<B: RenderBackend> {
    desc: BufferDesc,
    default_resource: Option<B::Resource>,
    in_flight: VecDeque<(u64, B::Resource)>,
    completed: Vec<B::Resource>,
    upload_allocations: usize,
    /// Upload list generation the newest default copy was recorded on
    copy_generation: Option<u64>,
}

impl<B: RenderBackend> Buffer<B> {
    /// Creates a buffer and optionally uploads initial data.
    ///
    /// Upload-usage buffers stage their first upload resource for the
    /// context's frame immediately.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidUsage`] for a zero-sized description
    /// - [`RhiError::WriteOutOfBounds`] if `data` is larger than the buffer
    pub fn new(
        ctx: &mut UploadContext<'_, B>,
        desc: BufferDesc,
        data: Option<&[u8]>,
    ) -> RhiResult<Self> {
        if desc.size() == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' has zero size (stride {}, count {})",
                desc.name, desc.stride, desc.count
            )));
        }

        let default_resource = match desc.usage {
            BufferUsage::Default => Some(ctx.backend.create_resource(&ResourceDesc::buffer(
                desc.name.clone(),
                desc.size(),
                MemoryKind::Default,
            ))?),
            BufferUsage::Upload => None,
        };

        let mut buffer = Self {
            desc,
            default_resource,
            in_flight: VecDeque::new(),
            completed: Vec::new(),
            upload_allocations: 0,
            copy_generation: None,
        };

        if buffer.desc.usage == BufferUsage::Upload {
            buffer.stage(ctx.backend, ctx.frame_number)?;
        }
        if let Some(data) = data {
            buffer.write(ctx, data, 0)?;
        }

        debug!(
            "Created {} buffer '{}' ({} bytes)",
            buffer.desc.usage.name(),
            buffer.desc.name,
            buffer.desc.size()
        );

        Ok(buffer)
    }

    // ===== Frame Lifecycle =====

    /// Stages an upload resource for `frame_number`.
    ///
    /// Only applies to upload-usage buffers; calling it twice for the same
    /// frame stages once.
    pub fn begin_frame(&mut self, backend: &B, frame_number: u64) -> RhiResult<()> {
        if self.desc.usage != BufferUsage::Upload || self.current_upload(frame_number).is_some() {
            return Ok(());
        }
        self.stage(backend, frame_number)
    }

    /// Reclaims upload resources stamped at or before `completed_frame`.
    ///
    /// Default usage destroys them; upload usage keeps them for reuse.
    /// Returns the number of resources reclaimed.
    pub fn finish_frame(&mut self, completed_frame: u64) -> usize {
        let mut reclaimed = 0;
        while self
            .in_flight
            .front()
            .is_some_and(|(frame, _)| *frame <= completed_frame)
        {
            let Some((_, resource)) = self.in_flight.pop_front() else {
                break;
            };
            match self.desc.usage {
                BufferUsage::Default => drop(resource),
                BufferUsage::Upload => self.completed.push(resource),
            }
            reclaimed += 1;
        }
        reclaimed
    }

    fn stage(&mut self, backend: &B, frame_number: u64) -> RhiResult<()> {
        let resource = match self.completed.pop() {
            Some(resource) => resource,
            None => self.allocate_upload(backend)?,
        };
        self.in_flight.push_back((frame_number, resource));
        Ok(())
    }

    fn allocate_upload(&mut self, backend: &B) -> RhiResult<B::Resource> {
        let resource = backend.create_resource(&ResourceDesc::buffer(
            format!("{} (upload)", self.desc.name),
            self.desc.size(),
            MemoryKind::Upload,
        ))?;
        self.upload_allocations += 1;
        Ok(resource)
    }

    // ===== Writes =====

    /// Allocates a fresh upload resource for the context's frame and records
    /// the copy into the default resource.
    ///
    /// The upload resource starts zeroed, so bytes past a partial write
    /// reach the default resource as zeros.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidUsage`] for upload-usage buffers.
    pub fn request_write(&mut self, ctx: &mut UploadContext<'_, B>) -> RhiResult<()> {
        let Some(default_resource) = &self.default_resource else {
            return Err(RhiError::InvalidUsage(format!(
                "request_write on upload buffer '{}'",
                self.desc.name
            )));
        };

        let mut upload = ctx.backend.create_resource(&ResourceDesc::buffer(
            format!("{} (upload)", self.desc.name),
            self.desc.size(),
            MemoryKind::Upload,
        ))?;
        upload.write_bytes(0, &vec![0; self.desc.size() as usize])?;
        ctx.command_list
            .copy_buffer(default_resource, &upload, self.desc.size())?;

        self.upload_allocations += 1;
        self.copy_generation = Some(ctx.upload_generation);
        self.in_flight.push_back((ctx.frame_number, upload));
        Ok(())
    }

    /// Copies `data` into the current frame's upload resource.
    ///
    /// With a non-zero `alignment` the written span is rounded up to a
    /// multiple of it and the tail is zero-filled. Default-usage buffers
    /// record the copy into the default resource on the first write in a
    /// frame, and again on the first write after that copy was submitted;
    /// a submitted upload resource is never written.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::WriteOutOfBounds`] if the (aligned) size exceeds
    /// the buffer.
    pub fn write(
        &mut self,
        ctx: &mut UploadContext<'_, B>,
        data: &[u8],
        alignment: u64,
    ) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;
        let size = if alignment > 0 {
            align_up(len, alignment)
        } else {
            len
        };
        if size > self.desc.size() {
            return Err(RhiError::WriteOutOfBounds {
                size,
                capacity: self.desc.size(),
            });
        }

        let staged = self.current_upload(ctx.frame_number).is_some();
        match self.desc.usage {
            BufferUsage::Default
                if !staged || self.copy_generation != Some(ctx.upload_generation) =>
            {
                self.request_write(ctx)?
            }
            BufferUsage::Upload if !staged => self.stage(ctx.backend, ctx.frame_number)?,
            _ => {}
        }

        let Some((_, upload)) = self.in_flight.back_mut() else {
            return Err(RhiError::InvalidUsage(format!(
                "buffer '{}' has no staged upload resource",
                self.desc.name
            )));
        };
        upload.write_bytes(0, data)?;
        if size > len {
            upload.write_bytes(len, &vec![0; (size - len) as usize])?;
        }
        Ok(())
    }

    /// Writes a slice of plain-old-data values.
    pub fn write_pod<T: bytemuck::Pod>(
        &mut self,
        ctx: &mut UploadContext<'_, B>,
        data: &[T],
    ) -> RhiResult<()> {
        self.write(ctx, bytemuck::cast_slice(data), 0)
    }

    // ===== Retirement =====

    /// Hands every resource the GPU may still use to `queue`.
    ///
    /// The default resource is stamped with `frame_number`; in-flight upload
    /// resources keep their own stamps. Pooled upload resources are idle and
    /// destroyed immediately.
    pub fn retire(self, frame_number: u64, queue: &mut ReleaseQueue<Retired<B>>) {
        debug!("Retiring buffer '{}' at frame {}", self.desc.name, frame_number);
        for (frame, resource) in self.in_flight {
            queue.push(frame, Retired::Resource(resource));
        }
        if let Some(resource) = self.default_resource {
            queue.push(frame_number, Retired::Resource(resource));
        }
    }

    // ===== Accessors =====

    /// Upload resource staged for `frame_number`, if any.
    pub fn current_upload(&self, frame_number: u64) -> Option<&B::Resource> {
        match self.in_flight.back() {
            Some((frame, resource)) if *frame == frame_number => Some(resource),
            _ => None,
        }
    }

    /// Resource shaders should read: the default resource, or the newest
    /// upload resource for upload usage.
    pub fn current_resource(&self) -> Option<&B::Resource> {
        match self.desc.usage {
            BufferUsage::Default => self.default_resource.as_ref(),
            BufferUsage::Upload => self.in_flight.back().map(|(_, resource)| resource),
        }
    }

    /// GPU-resident resource (default usage only).
    #[inline]
    pub fn default_resource(&self) -> Option<&B::Resource> {
        self.default_resource.as_ref()
    }

    /// Creation parameters.
    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.desc.size()
    }

    /// Memory layout.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    /// Upload resources awaiting frame completion.
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Upload resources ready for reuse.
    #[inline]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Upload resources allocated over the buffer's lifetime.
    #[inline]
    pub fn upload_allocations(&self) -> usize {
        self.upload_allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueKind;
    use crate::software::SoftwareBackend;

    struct Harness {
        backend: SoftwareBackend,
        list: CommandList<SoftwareBackend>,
        releases: ReleaseQueue<Retired<SoftwareBackend>>,
        generation: u64,
    }

    impl Harness {
        fn new() -> Self {
            let backend = SoftwareBackend::new();
            let list = CommandList::new(&backend, QueueKind::Copy).unwrap();
            Self {
                backend,
                list,
                releases: ReleaseQueue::new(),
                generation: 0,
            }
        }

        fn ctx(&mut self, frame_number: u64) -> UploadContext<'_, SoftwareBackend> {
            UploadContext {
                backend: &self.backend,
                frame_number,
                upload_generation: self.generation,
                command_list: &mut self.list,
                release_queue: &mut self.releases,
            }
        }
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let mut h = Harness::new();
        let result = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("empty", 4, 0, BufferUsage::Default),
            None,
        );
        assert!(matches!(result, Err(RhiError::InvalidUsage(_))));
    }

    #[test]
    fn test_default_write_records_one_copy_per_frame() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 4, 4, BufferUsage::Default),
            None,
        )
        .unwrap();
        assert_eq!(buffer.in_flight_count(), 0);

        buffer.write(&mut h.ctx(1), &[1; 16], 0).unwrap();
        buffer.write(&mut h.ctx(1), &[2; 8], 0).unwrap();
        assert_eq!(buffer.in_flight_count(), 1);
        assert_eq!(h.list.command_count(), 1);

        buffer.write(&mut h.ctx(2), &[3; 16], 0).unwrap();
        assert_eq!(buffer.in_flight_count(), 2);
        assert_eq!(h.list.command_count(), 2);
    }

    #[test]
    fn test_write_after_submission_records_new_copy() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 1, 8, BufferUsage::Default),
            Some(&[1; 8]),
        )
        .unwrap();

        // The first upload list went to the GPU; its upload resource is frozen.
        h.generation += 1;
        buffer.write(&mut h.ctx(1), &[2; 8], 0).unwrap();
        buffer.write(&mut h.ctx(1), &[3; 4], 0).unwrap();

        assert_eq!(buffer.in_flight_count(), 2);
        assert_eq!(buffer.upload_allocations(), 2);
        assert_eq!(h.list.command_count(), 2);
        assert_eq!(buffer.in_flight[0].1.contents(), vec![1; 8]);
        assert_eq!(buffer.in_flight[1].1.contents(), vec![3, 3, 3, 3, 2, 2, 2, 2]);
        assert_eq!(buffer.finish_frame(1), 2);
    }

    #[test]
    fn test_partial_write_leaves_zeroed_tail() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 1, 16, BufferUsage::Default),
            Some(&[9; 16]),
        )
        .unwrap();
        buffer.write(&mut h.ctx(2), &[1; 4], 0).unwrap();

        let mut expected = vec![1u8; 4];
        expected.extend_from_slice(&[0; 12]);
        assert_eq!(buffer.current_upload(2).unwrap().contents(), expected);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("small", 1, 64, BufferUsage::Default),
            None,
        )
        .unwrap();
        assert!(matches!(
            buffer.write(&mut h.ctx(1), &[0; 65], 0),
            Err(RhiError::WriteOutOfBounds {
                size: 65,
                capacity: 64
            })
        ));
        // Alignment counts against capacity.
        assert!(matches!(
            buffer.write(&mut h.ctx(1), &[0; 60], 128),
            Err(RhiError::WriteOutOfBounds {
                size: 128,
                capacity: 64
            })
        ));
        assert_eq!(buffer.in_flight_count(), 0);
    }

    #[test]
    fn test_aligned_write_zero_pads() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("cb", 1, 16, BufferUsage::Upload),
            Some(&[9; 16]),
        )
        .unwrap();
        buffer.write(&mut h.ctx(1), &[1, 2, 3], 8).unwrap();

        let contents = buffer.current_upload(1).unwrap().contents();
        assert_eq!(&contents[..8], &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(&contents[8..], &[9; 8]);
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 4, 4, BufferUsage::Default),
            None,
        )
        .unwrap();
        buffer.write(&mut h.ctx(1), &[], 0).unwrap();
        assert_eq!(buffer.in_flight_count(), 0);
        assert!(h.list.is_empty());
    }

    #[test]
    fn test_request_write_requires_default_usage() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("ub", 4, 4, BufferUsage::Upload),
            None,
        )
        .unwrap();
        assert!(matches!(
            buffer.request_write(&mut h.ctx(1)),
            Err(RhiError::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_upload_buffer_stages_at_creation() {
        let mut h = Harness::new();
        let buffer = Buffer::new(
            &mut h.ctx(3),
            BufferDesc::new("ub", 4, 4, BufferUsage::Upload),
            None,
        )
        .unwrap();
        assert_eq!(buffer.in_flight_count(), 1);
        assert!(buffer.current_upload(3).is_some());
        assert!(buffer.current_upload(4).is_none());
    }

    #[test]
    fn test_begin_frame_is_idempotent() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("ub", 4, 4, BufferUsage::Upload),
            None,
        )
        .unwrap();
        buffer.begin_frame(&h.backend, 2).unwrap();
        buffer.begin_frame(&h.backend, 2).unwrap();
        assert_eq!(buffer.in_flight_count(), 2);
    }

    #[test]
    fn test_default_uploads_are_destroyed_on_completion() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 4, 4, BufferUsage::Default),
            Some(&[1; 16]),
        )
        .unwrap();
        let alive = h.backend.stats().resources_alive;

        assert_eq!(buffer.finish_frame(0), 0);
        assert_eq!(buffer.finish_frame(1), 1);
        assert_eq!(buffer.completed_count(), 0);
        assert_eq!(h.backend.stats().resources_alive, alive - 1);
    }

    #[test]
    fn test_upload_resources_are_reused() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("ub", 4, 4, BufferUsage::Upload),
            None,
        )
        .unwrap();

        let frames_in_flight = 2u64;
        for frame in 2..=40u64 {
            buffer.finish_frame(frame.saturating_sub(frames_in_flight + 1));
            buffer.begin_frame(&h.backend, frame).unwrap();
            buffer.write(&mut h.ctx(frame), &[frame as u8; 16], 0).unwrap();
        }

        assert_eq!(buffer.upload_allocations(), frames_in_flight as usize + 1);
    }

    #[test]
    fn test_finish_frame_is_idempotent() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("ub", 4, 4, BufferUsage::Upload),
            None,
        )
        .unwrap();
        buffer.begin_frame(&h.backend, 2).unwrap();
        assert_eq!(buffer.finish_frame(1), 1);
        assert_eq!(buffer.finish_frame(1), 0);
        assert_eq!(buffer.in_flight_count(), 1);
        assert_eq!(buffer.completed_count(), 1);
    }

    #[test]
    fn test_retire_defers_live_resources() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::new("vb", 4, 4, BufferUsage::Default),
            Some(&[1; 16]),
        )
        .unwrap();
        buffer.write(&mut h.ctx(2), &[2; 16], 0).unwrap();

        let mut queue = ReleaseQueue::new();
        buffer.retire(3, &mut queue);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.oldest_frame(), Some(1));
        assert_eq!(queue.finish_frame(2), 2);
        assert_eq!(queue.finish_frame(3), 1);
    }

    #[test]
    fn test_write_pod() {
        let mut h = Harness::new();
        let mut buffer = Buffer::new(
            &mut h.ctx(1),
            BufferDesc::for_type::<u32>("indices", 3, BufferUsage::Upload),
            None,
        )
        .unwrap();
        buffer.write_pod(&mut h.ctx(1), &[1u32, 2, 3]).unwrap();
        let contents = buffer.current_upload(1).unwrap().contents();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, u32>(&contents), vec![1, 2, 3]);
    }
}
