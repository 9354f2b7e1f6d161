//! Frame pacing and graphics submission.
//!
//! This module provides the [`FrameManager`] struct that drives a render loop
//! on top of a [`RenderDevice`]. It handles:
//!
//! - Bounding how far the CPU runs ahead of the GPU
//! - Per-frame graphics command lists
//! - Ordering graphics work after the frame's uploads
//! - Feeding the GPU's progress back into [`RenderDevice::finish_frame`]
//!
//! # Overview
//!
//! The frame manager implements a "frames in flight" pattern where multiple
//! frames can be processed concurrently:
//!
//! 1. While the GPU renders frame N, the CPU prepares frame N+1
//! 2. Every frame's graphics submission signals the frame fence with its
//!    frame number
//! 3. [`FrameManager::begin_frame`] blocks until frame N - frames_in_flight
//!    has completed, so at most `frames_in_flight` frames are outstanding
//!
//! ```text
//! begin_frame(N)   wait frame fence >= N - frames_in_flight
//!                  recycle graphics lists <= completed
//! ...record...
//! end_frame(N)     execute_uploading   (copy queue signals the copy fence)
//!                  graphics waits for the copy fence
//!                  execute graphics list, signal frame fence = N
//!                  device.finish_frame(completed)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameflight_rhi::software::SoftwareBackend;
//! use frameflight_rhi::{DeviceConfig, RenderDevice};
//! use frameflight_renderer::FrameManager;
//!
//! # fn example() -> Result<(), frameflight_rhi::RhiError> {
//! let backend = Arc::new(SoftwareBackend::new());
//! let mut device = RenderDevice::new(backend, DeviceConfig::default())?;
//! let mut frames = FrameManager::new(&device, 2)?;
//!
//! for _ in 0..3 {
//!     let _list = frames.begin_frame(&device)?;
//!     // Record graphics commands...
//!     frames.end_frame(&mut device)?;
//! }
//!
//! frames.flush(&mut device)?;
//! # Ok(())
//! # }
//! ```

use tracing::{debug, info, warn};

use frameflight_rhi::backend::{QueueKind, RenderBackend};
use frameflight_rhi::{
    CommandList, CommandListRecycler, CommandListState, CommandQueue, Fence, FrameReport,
    RenderDevice, RhiError, RhiResult,
};

/// Paces the render loop against the GPU.
///
/// # Frames in Flight
///
/// The manager keeps at most `frames_in_flight` frames outstanding on the
/// GPU. Graphics command lists come from a recycler bounded at
/// `frames_in_flight + 1`, which is exactly what a steady loop needs: one
/// list per outstanding frame plus the one being recorded.
///
/// # Thread Safety
///
/// The frame manager is not thread-safe. It should only be accessed
/// from a single thread (typically the main/render thread).
pub struct FrameManager<B: RenderBackend> {
    /// Queue graphics lists are executed on.
    graphics_queue: CommandQueue<B>,
    /// Signaled with each frame number once that frame's graphics work is done.
    frame_fence: Fence<B>,
    /// Graphics lists, recycled by frame.
    command_lists: CommandListRecycler<B>,
    /// List handed out by the last `begin_frame`.
    current: Option<CommandList<B>>,
    frames_in_flight: usize,
}

impl<B: RenderBackend> FrameManager<B> {
    /// Creates a frame manager for `device`.
    ///
    /// # Arguments
    ///
    /// * `device` - The render device whose frames are paced
    /// * `frames_in_flight` - How many frames may be outstanding on the GPU
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidUsage`] when `frames_in_flight` is zero,
    /// or a backend error if the queue or fence cannot be created.
    pub fn new(device: &RenderDevice<B>, frames_in_flight: usize) -> RhiResult<Self> {
        if frames_in_flight == 0 {
            return Err(RhiError::InvalidUsage(
                "at least one frame must be allowed in flight".to_string(),
            ));
        }

        let graphics_queue = device.create_queue(QueueKind::Graphics)?;
        let frame_fence = device.create_fence(device.frame_number())?;
        let command_lists = CommandListRecycler::new(QueueKind::Graphics, frames_in_flight + 1);

        info!(
            "Frame manager created with {} frames in flight (first frame {})",
            frames_in_flight,
            device.frame_number()
        );

        Ok(Self {
            graphics_queue,
            frame_fence,
            command_lists,
            current: None,
            frames_in_flight,
        })
    }

    /// Begins the device's current frame and returns its graphics list.
    ///
    /// Blocks until the GPU has finished frame
    /// `frame - frames_in_flight`, then recycles every graphics list the
    /// GPU is done with.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidUsage`] if a frame is already begun
    /// - [`RhiError::Timeout`] if the GPU does not catch up within the
    ///   device's wait timeout
    /// - [`RhiError::DeviceLost`] if the device is gone
    pub fn begin_frame(&mut self, device: &RenderDevice<B>) -> RhiResult<&mut CommandList<B>> {
        if self.current.is_some() {
            return Err(RhiError::InvalidUsage(format!(
                "frame {} was already begun",
                device.frame_number()
            )));
        }

        let frame = device.frame_number();
        let in_flight = self.frames_in_flight as u64;
        if frame > in_flight {
            self.frame_fence.wait_for_value(frame - in_flight)?;
        }

        let completed = self.frame_fence.completed_value()?;
        self.command_lists.finish_frame(completed);

        let list = self.command_lists.acquire(&**device.backend())?;
        Ok(self.current.insert(list))
    }

    /// Submits the current frame and advances the device.
    ///
    /// Uploads recorded this frame are executed on the copy queue first; the
    /// graphics queue waits for them before running the frame's list. The
    /// frame fence is then signaled with the frame number and the device is
    /// told how far the GPU has progressed.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidUsage`] if no frame was begun, or the device was
    ///   advanced outside this manager
    /// - any error from submission or [`RenderDevice::finish_frame`]
    pub fn end_frame(&mut self, device: &mut RenderDevice<B>) -> RhiResult<FrameReport> {
        let Some(mut list) = self.current.take() else {
            return Err(RhiError::InvalidUsage(
                "end_frame called without begin_frame".to_string(),
            ));
        };

        if list.state() == CommandListState::Recording {
            list.close()?;
        }

        let frame = device.frame_number();
        if self.frame_fence.expected_value() != frame {
            self.command_lists.give_back(list)?;
            return Err(RhiError::InvalidUsage(format!(
                "device is at frame {} but the frame fence expects {}",
                frame,
                self.frame_fence.expected_value()
            )));
        }

        let copy_fence = device.execute_uploading()?;
        self.graphics_queue.wait(copy_fence)?;
        self.graphics_queue.execute(&[&list])?;
        self.frame_fence.signal(&self.graphics_queue)?;
        self.command_lists.submit(frame, list)?;

        let completed = self.frame_fence.completed_value()?;
        let result = device.finish_frame(completed);
        self.command_lists.finish_frame(completed);

        // A deferred descriptor error is reported after the device advanced.
        if device.frame_number() > frame {
            self.frame_fence.increment_expected_value();
        }

        result
    }

    /// Waits for every submitted frame and releases everything deferred.
    ///
    /// A frame that was begun but not ended is abandoned and its list
    /// returned to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] or [`RhiError::DeviceLost`] if the GPU
    /// does not drain.
    pub fn flush(&mut self, device: &mut RenderDevice<B>) -> RhiResult<()> {
        if let Some(list) = self.current.take() {
            warn!(
                "Abandoning frame {} that was begun but never ended",
                device.frame_number()
            );
            self.command_lists.give_back(list)?;
        }

        let last_submitted = self.frame_fence.expected_value().saturating_sub(1);
        self.frame_fence.wait_for_value(last_submitted)?;
        self.command_lists.finish_frame(u64::MAX);
        device.flush()?;

        debug!("Flushed frame manager through frame {}", last_submitted);
        Ok(())
    }

    /// Returns the fence signaled with each completed frame number.
    #[inline]
    pub fn frame_fence(&self) -> &Fence<B> {
        &self.frame_fence
    }

    /// Returns the graphics queue.
    #[inline]
    pub fn graphics_queue(&self) -> &CommandQueue<B> {
        &self.graphics_queue
    }

    /// Returns the graphics command list recycler.
    #[inline]
    pub fn command_lists(&self) -> &CommandListRecycler<B> {
        &self.command_lists
    }

    /// Returns the number of frames in flight.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Returns true between `begin_frame` and `end_frame`.
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// Highest frame the GPU has finished.
    pub fn completed_frame(&self) -> RhiResult<u64> {
        self.frame_fence.completed_value()
    }
}

impl<B: RenderBackend> Drop for FrameManager<B> {
    fn drop(&mut self) {
        debug!(
            "Frame manager dropped ({} graphics lists created, {} in flight)",
            self.command_lists.created_count(),
            self.command_lists.in_flight_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use frameflight_rhi::software::SoftwareBackend;
    use frameflight_rhi::{BufferDesc, BufferUsage, DeviceConfig};

    fn config() -> DeviceConfig {
        DeviceConfig {
            gpu_wait_timeout: Duration::from_millis(50),
            ..DeviceConfig::default()
        }
    }

    fn device(backend: &SoftwareBackend) -> RenderDevice<SoftwareBackend> {
        let _ = frameflight_core::try_init_logging();
        RenderDevice::new(Arc::new(backend.clone()), config()).unwrap()
    }

    fn run_frame(
        frames: &mut FrameManager<SoftwareBackend>,
        device: &mut RenderDevice<SoftwareBackend>,
    ) -> RhiResult<FrameReport> {
        frames.begin_frame(device)?;
        frames.end_frame(device)
    }

    #[test]
    fn test_frame_manager_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameManager<SoftwareBackend>>();
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let backend = SoftwareBackend::new();
        let device = device(&backend);
        assert!(matches!(
            FrameManager::new(&device, 0),
            Err(RhiError::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_frame_fence_tracks_device_frame() {
        let backend = SoftwareBackend::new();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        for _ in 0..5 {
            assert_eq!(frames.frame_fence().expected_value(), device.frame_number());
            let frame = device.frame_number();
            let report = run_frame(&mut frames, &mut device).unwrap();
            assert_eq!(report.frame_number, frame + 1);
            assert_eq!(frames.completed_frame().unwrap(), frame);
        }
        assert_eq!(device.copy_fence().expected_value(), device.frame_number());
    }

    #[test]
    fn test_cpu_stays_within_frames_in_flight() {
        let backend = SoftwareBackend::deferred();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        // Frames 1 and 2 may be outstanding with no GPU progress at all.
        run_frame(&mut frames, &mut device).unwrap();
        run_frame(&mut frames, &mut device).unwrap();
        assert_eq!(device.frame_number(), 3);

        let result = frames.begin_frame(&device);
        assert!(matches!(
            result,
            Err(RhiError::Timeout {
                target: 1,
                completed: 0,
                ..
            })
        ));
        assert!(!frames.is_recording());

        backend.run_pending();
        assert_eq!(frames.completed_frame().unwrap(), 2);
        run_frame(&mut frames, &mut device).unwrap();
        backend.run_pending();
        assert_eq!(frames.completed_frame().unwrap(), 3);
    }

    #[test]
    fn test_uploads_visible_before_graphics_work() {
        let backend = SoftwareBackend::deferred();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        let data: [u32; 4] = [7, 11, 13, 17];
        let buffer = device
            .create_buffer(BufferDesc::for_type::<u32>("constants", 4, BufferUsage::Default), None)
            .unwrap();

        frames.begin_frame(&device).unwrap();
        device.write_buffer_pod(buffer, &data).unwrap();
        frames.end_frame(&mut device).unwrap();

        backend.run_pending();
        assert_eq!(frames.completed_frame().unwrap(), 1);
        let contents = device.buffer(buffer).unwrap().default_resource().unwrap().contents();
        assert_eq!(contents, bytemuck::bytes_of(&data).to_vec());

        // Frame 2 learns that frame 1 completed and reclaims its staging copy.
        run_frame(&mut frames, &mut device).unwrap();
        assert_eq!(device.buffer(buffer).unwrap().in_flight_count(), 0);
        backend.run_pending();
    }

    #[test]
    fn test_graphics_lists_plateau() {
        let backend = SoftwareBackend::deferred();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        for _ in 0..12 {
            run_frame(&mut frames, &mut device).unwrap();
            // Each frame queues five items: upload batch, copy signal,
            // graphics wait, graphics batch and frame signal. Leave the
            // newest frame pending so the GPU trails by one.
            backend.run_pending_steps(backend.pending_work().saturating_sub(5));
            assert_eq!(
                frames.completed_frame().unwrap(),
                device.frame_number() - 2
            );
        }
        assert_eq!(frames.command_lists().created_count(), 2);
        assert_eq!(frames.command_lists().max_lists(), 3);

        backend.run_pending();
        assert_eq!(backend.stats().use_after_free, 0);
    }

    #[test]
    fn test_end_without_begin() {
        let backend = SoftwareBackend::new();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        assert!(matches!(
            frames.end_frame(&mut device),
            Err(RhiError::InvalidUsage(_))
        ));
        assert_eq!(device.frame_number(), 1);
    }

    #[test]
    fn test_begin_twice_rejected() {
        let backend = SoftwareBackend::new();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        frames.begin_frame(&device).unwrap();
        assert!(matches!(
            frames.begin_frame(&device),
            Err(RhiError::InvalidUsage(_))
        ));
        frames.end_frame(&mut device).unwrap();
    }

    #[test]
    fn test_device_advanced_elsewhere_is_detected() {
        let backend = SoftwareBackend::new();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        device.finish_frame(0).unwrap();
        frames.begin_frame(&device).unwrap();
        assert!(matches!(
            frames.end_frame(&mut device),
            Err(RhiError::InvalidUsage(_))
        ));
        assert!(!frames.is_recording());
        assert_eq!(frames.command_lists().completed_count(), 1);
    }

    #[test]
    fn test_flush_releases_everything() {
        let backend = SoftwareBackend::new();
        let mut device = device(&backend);
        let mut frames = FrameManager::new(&device, 2).unwrap();

        let buffer = device
            .create_buffer(BufferDesc::new("transient", 4, 16, BufferUsage::Upload), None)
            .unwrap();
        run_frame(&mut frames, &mut device).unwrap();
        device.destroy_buffer(buffer).unwrap();
        frames.begin_frame(&device).unwrap();

        frames.flush(&mut device).unwrap();
        assert!(!frames.is_recording());
        assert_eq!(device.pending_releases(), 0);
        assert_eq!(frames.command_lists().in_flight_count(), 0);
    }
}
