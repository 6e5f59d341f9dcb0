// Surface - connection between Vulkan and the OS window
//
// Created after the instance and before device selection, since
// presentation support is a per-queue-family property of the surface.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;

use super::Instance;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    instance: Arc<Instance>,
}

impl Surface {
    pub fn new<W>(instance: Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.handle,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failure creating window surface")?;

        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.handle);

        Ok(Self {
            handle,
            loader,
            instance,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Whether `queue_family` of `physical_device` can present to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }?;
        Ok(supported)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}
