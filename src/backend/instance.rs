// Vulkan Instance - Entry point to the API
//
// Responsibilities:
// - Load the Vulkan library
// - Instance creation with window-system extensions
// - Validation layers + debug messenger routed into `log`

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

/// Validation layers we try to enable, in order of preference
const VALIDATION_LAYER_CANDIDATES: [&CStr; 2] = [
    c"VK_LAYER_KHRONOS_validation",
    c"VK_LAYER_LUNARG_standard_validation",
];

pub struct Instance {
    pub handle: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub entry: Entry,
}

impl Instance {
    /// Create a Vulkan instance able to present to windows on `display_handle`
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable validation layers and the debug messenger
    /// * `display_handle` - Used to pick the platform surface extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let app_name_cstr = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"vkdev")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query window-system instance extensions")?
            .to_vec();

        let layer_names: Vec<*const std::os::raw::c_char> = if enable_validation {
            let available = entry
                .enumerate_instance_layer_properties()
                .context("Failed to enumerate instance layers")?;
            let supported = supported_validation_layers(&available);
            if supported.is_empty() {
                anyhow::bail!("No supported validation layers found");
            }
            for layer in &supported {
                log::info!("Enabling validation layer {}", layer.to_string_lossy());
            }

            extensions.push(DebugUtils::name().as_ptr());
            supported.iter().map(|layer| layer.as_ptr()).collect()
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let handle = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &handle)?)
        } else {
            None
        };

        Ok(Self {
            handle,
            debug_utils,
            entry,
        })
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.handle.destroy_instance(None);
        }
    }
}

/// Filter the validation candidates down to the ones the loader reports
pub fn supported_validation_layers(available: &[vk::LayerProperties]) -> Vec<&'static CStr> {
    VALIDATION_LAYER_CANDIDATES
        .iter()
        .copied()
        .filter(|candidate| {
            available.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == *candidate
            })
        })
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    // Returning true would abort the call that triggered the message
    vk::FALSE
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.bytes()) {
            *dst = src as std::os::raw::c_char;
        }
        props
    }

    #[test]
    fn keeps_only_available_candidates() {
        let available = [
            layer("VK_LAYER_MESA_device_select"),
            layer("VK_LAYER_LUNARG_standard_validation"),
        ];
        let supported = supported_validation_layers(&available);
        assert_eq!(supported, vec![c"VK_LAYER_LUNARG_standard_validation"]);
    }

    #[test]
    fn candidate_order_is_preserved() {
        let available = [
            layer("VK_LAYER_LUNARG_standard_validation"),
            layer("VK_LAYER_KHRONOS_validation"),
        ];
        let supported = supported_validation_layers(&available);
        assert_eq!(supported, VALIDATION_LAYER_CANDIDATES.to_vec());
    }

    #[test]
    fn prefix_match_is_not_enough() {
        let available = [layer("VK_LAYER_KHRONOS_validation_extra")];
        assert!(supported_validation_layers(&available).is_empty());
    }
}
