//! Vulkan backend.
//!
//! # Overview
//!
//! [`VulkanBackend`] implements [`RenderBackend`] on a headless Vulkan 1.3
//! device:
//!
//! - fences are timeline semaphores
//! - shader-visible descriptor heaps are update-after-bind descriptor sets
//! - render target and depth-stencil heaps are tables of image views
//! - memory comes from `gpu-allocator`
//!
//! Every queue kind maps to the same graphics-capable hardware queue, so
//! submissions are serialized through one lock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use frameflight_rhi::{DeviceConfig, RenderDevice};
//! use frameflight_rhi::vulkan::VulkanBackend;
//!
//! let backend = VulkanBackend::new(cfg!(debug_assertions)).expect("no Vulkan device");
//! let device = RenderDevice::new(Arc::new(backend), DeviceConfig::default()).expect("device");
//! ```

mod command;
mod descriptor;
mod instance;
mod physical_device;
mod resource;
mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::backend::{QueueKind, RenderBackend, ResourceDesc};
use crate::descriptor::DescriptorHeapKind;
use crate::error::{RhiError, RhiResult};

pub use command::{VulkanCommandList, VulkanQueue};
pub use descriptor::VulkanDescriptorHeap;
pub use instance::Instance;
pub use physical_device::{PhysicalDeviceInfo, select_physical_device};
pub use resource::VulkanResource;
pub use sync::VulkanFence;

/// Logical device state shared by every object the backend creates.
///
/// Fields drop in declaration order after [`Drop::drop`] has destroyed the
/// allocator and the device, so the instance goes last.
pub(crate) struct DeviceShared {
    allocator: Mutex<Option<Allocator>>,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    physical: PhysicalDeviceInfo,
    lost: AtomicBool,
    instance: Instance,
}

impl DeviceShared {
    #[inline]
    pub(crate) fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub(crate) fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Runs `f` with the allocator locked.
    pub(crate) fn with_allocator<T>(
        &self,
        f: impl FnOnce(&mut Allocator) -> RhiResult<T>,
    ) -> RhiResult<T> {
        let mut guard = self
            .allocator
            .lock()
            .map_err(|_| RhiError::Backend("allocator lock poisoned".to_string()))?;
        let allocator = guard
            .as_mut()
            .ok_or_else(|| RhiError::Backend("allocator already destroyed".to_string()))?;
        f(allocator)
    }

    pub(crate) fn queue(&self) -> RhiResult<MutexGuard<'_, vk::Queue>> {
        self.queue
            .lock()
            .map_err(|_| RhiError::Backend("queue lock poisoned".to_string()))
    }

    /// Converts a Vulkan result code, latching device loss.
    pub(crate) fn vk_error(&self, result: vk::Result) -> RhiError {
        if result == vk::Result::ERROR_DEVICE_LOST {
            if !self.lost.swap(true, Ordering::AcqRel) {
                error!("Vulkan device lost");
            }
            RhiError::DeviceLost("VK_ERROR_DEVICE_LOST".to_string())
        } else {
            RhiError::Vulkan(result)
        }
    }

    pub(crate) fn check_device(&self) -> RhiResult<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(RhiError::DeviceLost(
                "device was lost earlier".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        match self.allocator.get_mut() {
            Ok(allocator) => drop(allocator.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        unsafe {
            self.device.destroy_device(None);
        }
        info!("Vulkan device destroyed");
    }
}

/// A headless Vulkan device.
///
/// Cloning is cheap; every clone drives the same device.
#[derive(Clone)]
pub struct VulkanBackend {
    shared: Arc<DeviceShared>,
}

impl VulkanBackend {
    /// Creates an instance, picks a GPU and opens a logical device on it.
    ///
    /// # Errors
    ///
    /// - [`RhiError::Loading`] when no Vulkan loader is installed
    /// - [`RhiError::NoSuitableGpu`] when no GPU has the required features
    /// - [`RhiError::Vulkan`] / [`RhiError::Allocator`] on creation failures
    pub fn new(enable_validation: bool) -> RhiResult<Self> {
        let instance = Instance::new(enable_validation)?;
        let physical = select_physical_device(instance.handle())?;

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical.queue_family)
            .queue_priorities(&priorities)];

        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features)
            .push_next(&mut features12);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical.device, &create_info, None)?
        };
        let queue = unsafe { device.get_device_queue(physical.queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!(
            "Vulkan device created on '{}' (queue family {})",
            physical.device_name(),
            physical.queue_family
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                allocator: Mutex::new(Some(allocator)),
                device,
                queue: Mutex::new(queue),
                physical,
                lost: AtomicBool::new(false),
                instance,
            }),
        })
    }

    /// Name of the selected GPU.
    pub fn device_name(&self) -> &str {
        self.shared.physical.device_name()
    }

    /// Returns whether validation layers are active.
    pub fn has_validation(&self) -> bool {
        self.shared.instance.has_validation()
    }

    /// Blocks until the device has finished all submitted work.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the device was lost.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.shared.device.device_wait_idle() }.map_err(|e| self.shared.vk_error(e))
    }
}

impl RenderBackend for VulkanBackend {
    type Resource = VulkanResource;
    type CommandList = VulkanCommandList;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type DescriptorHeap = VulkanDescriptorHeap;

    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_resource(&self, desc: &ResourceDesc) -> RhiResult<VulkanResource> {
        self.shared.check_device()?;
        VulkanResource::new(self.shared.clone(), desc)
    }

    fn create_command_list(&self, kind: QueueKind) -> RhiResult<VulkanCommandList> {
        self.shared.check_device()?;
        VulkanCommandList::new(self.shared.clone(), kind)
    }

    fn create_queue(&self, kind: QueueKind) -> RhiResult<VulkanQueue> {
        self.shared.check_device()?;
        debug!("Created {} queue view", kind.name());
        Ok(VulkanQueue::new(self.shared.clone(), kind))
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<VulkanFence> {
        self.shared.check_device()?;
        VulkanFence::new(self.shared.clone(), initial_value)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> RhiResult<VulkanDescriptorHeap> {
        self.shared.check_device()?;
        VulkanDescriptorHeap::new(self.shared.clone(), kind, capacity)
    }

    fn check_device(&self) -> RhiResult<()> {
        self.shared.check_device()
    }
}
