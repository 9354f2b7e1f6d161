//! Physical device (GPU) selection.
//!
//! A device qualifies when it exposes a graphics queue family, Vulkan 1.3,
//! timeline semaphores, buffer device addresses and update-after-bind
//! descriptor indexing. Among qualifying devices, discrete GPUs win.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;

/// Information about the selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version)
    pub properties: vk::PhysicalDeviceProperties,
    /// Queue family used for every queue kind
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Largest sampler anisotropy the device supports.
    #[inline]
    pub fn max_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device meets the requirements.
pub fn select_physical_device(instance: &ash::Instance) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device))
        .map(|info| {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - Score: {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            (info, score)
        })
        .max_by_key(|(_, score)| *score);

    let Some((info, score)) = selected else {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    };

    info!(
        "Selected GPU: '{}' ({}) - Score: {}",
        info.device_name(),
        info.device_type_name(),
        score
    );
    Ok(info)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let device_name = unsafe {
        CStr::from_ptr(properties.device_name.as_ptr())
            .to_str()
            .unwrap_or("Unknown")
    };

    let major = vk::api_version_major(properties.api_version);
    let minor = vk::api_version_minor(properties.api_version);
    if major < 1 || (major == 1 && minor < 3) {
        debug!(
            "GPU '{}' skipped: Vulkan 1.3 not supported (version: {}.{})",
            device_name, major, minor
        );
        return None;
    }

    let Some(queue_family) = find_graphics_family(instance, device) else {
        debug!("GPU '{}' skipped: no graphics queue family", device_name);
        return None;
    };

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let sampler_anisotropy = features.features.sampler_anisotropy;

    let required = [
        ("timeline semaphores", features12.timeline_semaphore),
        ("buffer device address", features12.buffer_device_address),
        ("partially bound descriptors", features12.descriptor_binding_partially_bound),
        (
            "update-after-bind sampled images",
            features12.descriptor_binding_sampled_image_update_after_bind,
        ),
        (
            "update-after-bind storage images",
            features12.descriptor_binding_storage_image_update_after_bind,
        ),
        (
            "update-after-bind storage buffers",
            features12.descriptor_binding_storage_buffer_update_after_bind,
        ),
        (
            "update-after-bind uniform buffers",
            features12.descriptor_binding_uniform_buffer_update_after_bind,
        ),
        ("sampler anisotropy", sampler_anisotropy),
    ];
    if let Some((missing, _)) = required.iter().find(|(_, supported)| *supported == vk::FALSE) {
        debug!("GPU '{}' skipped: {} not supported", device_name, missing);
        return None;
    }

    Some(PhysicalDeviceInfo {
        device,
        properties,
        queue_family,
    })
}

fn find_graphics_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families
        .iter()
        .position(|family| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map(|index| index as u32)
}

fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let mut score = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        _ => 10,
    };
    score += info.properties.limits.max_image_dimension2_d / 1024;
    score
}
