//! Timeline semaphores as counter fences.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use super::DeviceShared;
use crate::backend::GpuFence;
use crate::error::RhiResult;

/// A timeline semaphore.
pub struct VulkanFence {
    shared: Arc<DeviceShared>,
    semaphore: vk::Semaphore,
}

impl VulkanFence {
    pub(crate) fn new(shared: Arc<DeviceShared>, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { shared.device().create_semaphore(&create_info, None) }
            .map_err(|e| shared.vk_error(e))?;

        debug!("Created timeline semaphore at {}", initial_value);
        Ok(Self { shared, semaphore })
    }

    /// Returns the semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl GpuFence for VulkanFence {
    fn completed_value(&self) -> RhiResult<u64> {
        self.shared.check_device()?;
        unsafe { self.shared.device().get_semaphore_counter_value(self.semaphore) }
            .map_err(|e| self.shared.vk_error(e))
    }

    fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.shared.check_device()?;
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe { self.shared.device().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(self.shared.vk_error(e)),
        }
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.shared.device().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline semaphore");
    }
}
