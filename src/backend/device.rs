// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (must present to the surface, prefer discrete GPU)
// - Logical device + graphics/present queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

use super::queue::{Queue, QueueFamilyIndices};
use super::swapchain::SwapchainSupport;
use super::{Instance, Surface};

/// Vulkan device wrapper with automatic cleanup
pub struct Device {
    // Released before the device is destroyed (see Drop)
    allocator: Option<Mutex<Allocator>>,
    pub handle: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles
    pub graphics_queue: Queue,
    pub present_queue: Queue,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,

    instance: Arc<Instance>,
}

impl Device {
    /// Pick a GPU able to render to `surface` and create the logical device
    ///
    /// # Arguments
    /// * `instance` - Kept alive for as long as the device exists
    /// * `surface` - Presentation target the GPU must support
    /// * `required_extensions` - Device extensions that must all be present
    pub fn new(
        instance: Arc<Instance>,
        surface: &Surface,
        required_extensions: &[&CStr],
    ) -> Result<Arc<Self>> {
        let (physical_device, families) =
            Self::pick_physical_device(&instance, surface, required_extensions)?;

        let properties = unsafe { instance.handle.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let (handle, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, families, required_extensions)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle.clone(),
            device: handle.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(Arc::new(Self {
            allocator: Some(Mutex::new(allocator)),
            handle,
            physical_device,
            graphics_queue,
            present_queue,
            properties,
            instance,
        }))
    }

    fn pick_physical_device(
        instance: &Instance,
        surface: &Surface,
        required_extensions: &[&CStr],
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.handle.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("Failed to find a graphics card that supports vulkan");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let Some(families) =
                Self::check_suitability(instance, surface, device, required_extensions)?
            else {
                continue;
            };

            let props = unsafe { instance.handle.get_physical_device_properties(device) };
            let score = device_type_score(props.device_type);

            if score > best_score {
                best_score = score;
                best_device = Some((device, families));
            }
        }

        best_device.context("Failed to pick a suitable physical device")
    }

    /// Queue families of `device` if it can do everything we need
    fn check_suitability(
        instance: &Instance,
        surface: &Surface,
        device: vk::PhysicalDevice,
        required_extensions: &[&CStr],
    ) -> Result<Option<QueueFamilyIndices>> {
        let queue_families =
            unsafe { instance.handle.get_physical_device_queue_family_properties(device) };
        let families = QueueFamilyIndices::find(&queue_families, |i| surface.supports_present(device, i))?;
        if !families.is_complete() {
            return Ok(None);
        }

        let available = unsafe { instance.handle.enumerate_device_extension_properties(device) }?;
        let missing = missing_extensions(required_extensions, &available);
        if !missing.is_empty() {
            log::debug!("Skipping GPU missing extensions: {}", missing.join(", "));
            return Ok(None);
        }

        let support = SwapchainSupport::query(surface, device)?;
        if !support.is_adequate() {
            return Ok(None);
        }

        // Most hardware has anisotropic filtering, but samplers rely on it
        let features = unsafe { instance.handle.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return Ok(None);
        }

        Ok(Some(families))
    }

    fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilyIndices,
        required_extensions: &[&CStr],
    ) -> Result<(ash::Device, Queue, Queue)> {
        let graphics_family = families.graphics.context("No graphics queue family")?;
        let present_family = families.present.context("No presentation queue family")?;

        // One queue per unique family; priority is required even for a single queue
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let extensions: Vec<_> = required_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.handle.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = Queue {
            handle: unsafe { device.get_device_queue(graphics_family, 0) },
            family: graphics_family,
        };
        let present_queue = Queue {
            handle: unsafe { device.get_device_queue(present_family, 0) },
            family: present_family,
        };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Highest MSAA sample count usable by both color and depth attachments
    pub fn max_usable_sample_count(&self) -> vk::SampleCountFlags {
        let limits = &self.properties.limits;
        highest_sample_count(
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
        )
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .handle
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate format supporting `features` with the given tiling
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| format_supports(&self.format_properties(format), tiling, features))
            .context("Failed to find a supported format")
    }

    /// Allocate device memory for a resource
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let allocator = self.allocator.as_ref().context("Allocator already released")?;
        let allocation = allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(allocation)
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        let allocator = self.allocator.as_ref().context("Allocator already released")?;
        allocator.lock().free(allocation)?;
        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.handle.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // The allocator frees its memory blocks through the device
        self.allocator = None;
        unsafe {
            self.handle.destroy_device(None);
        }
    }
}

/// Device type preference: discrete > integrated > anything else
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Names of required extensions not in `available`
pub fn missing_extensions(required: &[&CStr], available: &[vk::ExtensionProperties]) -> Vec<String> {
    required
        .iter()
        .filter(|&&name| {
            !available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
        })
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

pub fn highest_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| counts.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Requested MSAA samples (as a plain count) clamped to `max`
pub fn clamp_sample_count(requested: u32, max: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let requested = requested.clamp(1, 64).next_power_of_two();
    let requested = vk::SampleCountFlags::from_raw(requested);
    if requested.as_raw() > max.as_raw() {
        max
    } else {
        requested
    }
}

pub fn format_supports(
    props: &vk::FormatProperties,
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> bool {
    match tiling {
        vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
        vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &str) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::os::raw::c_char;
        }
        props
    }

    #[test]
    fn discrete_beats_integrated_beats_cpu() {
        let discrete = device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU);
        let cpu = device_type_score(vk::PhysicalDeviceType::CPU);
        assert!(discrete > integrated);
        assert!(integrated > cpu);
        assert!(cpu > 0);
    }

    #[test]
    fn reports_missing_extensions() {
        let available = [extension("VK_KHR_maintenance1")];
        let missing = missing_extensions(&[c"VK_KHR_swapchain", c"VK_KHR_maintenance1"], &available);
        assert_eq!(missing, vec!["VK_KHR_swapchain".to_string()]);

        let available = [extension("VK_KHR_swapchain")];
        assert!(missing_extensions(&[c"VK_KHR_swapchain"], &available).is_empty());
    }

    #[test]
    fn highest_common_sample_count() {
        let color = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        let depth = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(highest_sample_count(color & depth), vk::SampleCountFlags::TYPE_4);
        assert_eq!(highest_sample_count(vk::SampleCountFlags::empty()), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn sample_count_is_clamped_to_device_max() {
        let max = vk::SampleCountFlags::TYPE_8;
        assert_eq!(clamp_sample_count(4, max), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(16, max), vk::SampleCountFlags::TYPE_8);
        assert_eq!(clamp_sample_count(0, max), vk::SampleCountFlags::TYPE_1);
        // Non powers of two round up before clamping
        assert_eq!(clamp_sample_count(3, max), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn huge_sample_request_falls_back_to_device_max() {
        let max = vk::SampleCountFlags::TYPE_8;
        assert_eq!(clamp_sample_count(3_000_000_000, max), max);
        assert_eq!(clamp_sample_count(u32::MAX, vk::SampleCountFlags::TYPE_64), vk::SampleCountFlags::TYPE_64);
    }

    #[test]
    fn format_support_checks_matching_tiling() {
        let props = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::FormatFeatureFlags::SAMPLED_IMAGE,
            buffer_features: vk::FormatFeatureFlags::empty(),
        };
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert!(format_supports(&props, vk::ImageTiling::OPTIMAL, depth));
        assert!(!format_supports(&props, vk::ImageTiling::LINEAR, depth));
    }
}
