//! Counter-based CPU/GPU synchronization.
//!
//! A [`Fence`] pairs the backend's GPU counter with a CPU-side
//! *expected value*: the value the most recent (or next) submission will
//! signal. Work is known complete once the GPU counter reaches the value it
//! was submitted under.
//!
//! # Overview
//!
//! The GPU counter is created at 0 while the expected value starts at a
//! caller-chosen initial value, so nothing counts as complete until the first
//! signal lands. Each frame the owner:
//!
//! 1. signals the fence on a queue with the current expected value
//! 2. calls [`Fence::increment_expected_value`] to open the next value
//!
//! Waits are always bounded. A wait that expires returns
//! [`RhiError::Timeout`] carrying the target and the last completed value,
//! which callers treat as a hung device.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use frameflight_rhi::backend::QueueKind;
//! use frameflight_rhi::command::CommandQueue;
//! use frameflight_rhi::fence::Fence;
//! use frameflight_rhi::software::SoftwareBackend;
//!
//! # fn main() -> Result<(), frameflight_rhi::RhiError> {
//! let backend = SoftwareBackend::new();
//! let queue = CommandQueue::new(&backend, QueueKind::Graphics)?;
//! let mut fence = Fence::new(&backend, 1, Duration::from_secs(1))?;
//!
//! fence.signal(&queue)?;
//! fence.wait_for_gpu()?;
//! assert_eq!(fence.increment_expected_value(), 2);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tracing::{debug, error};

use crate::backend::{GpuFence, RenderBackend};
use crate::command::CommandQueue;
use crate::error::{RhiError, RhiResult};

/// A GPU counter with its CPU-side expected value.
///
/// # Thread Safety
///
/// Reading and waiting only need `&self`; advancing the expected value needs
/// `&mut self`, so a single owner drives the fence while others may wait.
pub struct Fence<B: RenderBackend> {
    raw: B::Fence,
    expected_value: u64,
    wait_timeout: Duration,
}

impl<B: RenderBackend> Fence<B> {
    /// Creates a fence.
    ///
    /// # Arguments
    ///
    /// * `backend` - Device to create the counter on
    /// * `initial_expected` - Value the first signal will carry
    /// * `wait_timeout` - Upper bound for every wait on this fence
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot create the counter.
    pub fn new(backend: &B, initial_expected: u64, wait_timeout: Duration) -> RhiResult<Self> {
        let raw = backend.create_fence(0)?;
        debug!(
            "Created fence (expected value {}, timeout {:?})",
            initial_expected, wait_timeout
        );
        Ok(Self {
            raw,
            expected_value: initial_expected,
            wait_timeout,
        })
    }

    /// Advances the expected value and returns the new value.
    pub fn increment_expected_value(&mut self) -> u64 {
        self.expected_value += 1;
        self.expected_value
    }

    /// Value the next signal carries.
    #[inline]
    pub fn expected_value(&self) -> u64 {
        self.expected_value
    }

    /// Highest value the GPU has reached.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the device is gone.
    pub fn completed_value(&self) -> RhiResult<u64> {
        self.raw.completed_value()
    }

    /// Returns true if the GPU has reached `value`.
    pub fn is_complete(&self, value: u64) -> RhiResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// Signals the fence on `queue` with the current expected value.
    pub fn signal(&self, queue: &CommandQueue<B>) -> RhiResult<()> {
        queue.signal(self)
    }

    /// Blocks until the GPU reaches the current expected value.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if the wait expires.
    pub fn wait_for_gpu(&self) -> RhiResult<()> {
        self.wait_for_value(self.expected_value)
    }

    /// Blocks until the GPU reaches `target`.
    ///
    /// Returns immediately when the value is already reached.
    ///
    /// # Errors
    ///
    /// - [`RhiError::Timeout`] if the wait expires
    /// - [`RhiError::DeviceLost`] if the device is gone
    pub fn wait_for_value(&self, target: u64) -> RhiResult<()> {
        if self.raw.completed_value()? >= target {
            return Ok(());
        }

        if self.raw.wait(target, self.wait_timeout)? {
            return Ok(());
        }

        let completed = self.raw.completed_value()?;
        error!(
            "GPU did not reach fence value {} within {:?} (completed {})",
            target, self.wait_timeout, completed
        );
        Err(RhiError::Timeout {
            target,
            completed,
            timeout: self.wait_timeout,
        })
    }

    /// Upper bound for waits on this fence.
    #[inline]
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Backend counter.
    #[inline]
    pub fn raw(&self) -> &B::Fence {
        &self.raw
    }
}
