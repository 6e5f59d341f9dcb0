// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::Device;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<Device>,
}

impl FrameSync {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on this slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .handle
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create synchronization objects for a frame")?;
            let render_finished = match device.handle.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.handle.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create synchronization objects for a frame");
                }
            };
            let in_flight_fence = match device.handle.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.handle.destroy_semaphore(image_available, None);
                    device.handle.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create synchronization objects for a frame");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                device,
            })
        }
    }

    pub fn wait(&self) -> Result<()> {
        wait_for_fence(&self.device, self.in_flight_fence)
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.handle.reset_fences(&[self.in_flight_fence]) }?;
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.handle.destroy_semaphore(self.image_available, None);
            self.device.handle.destroy_semaphore(self.render_finished, None);
            self.device.handle.destroy_fence(self.in_flight_fence, None);
        }
    }
}

pub fn wait_for_fence(device: &Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.handle.wait_for_fences(&[fence], true, u64::MAX) }?;
    Ok(())
}

/// Index of the current frame slot, cycling through `count` slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCycle {
    current: usize,
    count: usize,
}

impl FrameCycle {
    pub fn new(count: usize) -> Self {
        Self {
            current: 0,
            count: count.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.count;
    }
}

/// Fence of the frame last rendering to each swapchain image
#[derive(Debug, Clone, Default)]
pub struct ImagesInFlight {
    fences: Vec<vk::Fence>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![vk::Fence::null(); image_count],
        }
    }

    /// Record `fence` as the user of `image`
    ///
    /// Returns the fence previously using the image, which must be waited on
    /// before the image is rendered to again.
    pub fn claim(&mut self, image: usize, fence: vk::Fence) -> Option<vk::Fence> {
        let slot = self.fences.get_mut(image)?;
        let previous = std::mem::replace(slot, fence);
        (previous != vk::Fence::null()).then_some(previous)
    }

    /// Forget all fences; called after the swapchain is recreated
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, vk::Fence::null());
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn frame_cycle_wraps() {
        let mut cycle = FrameCycle::new(2);
        assert_eq!(cycle.current(), 0);
        cycle.advance();
        assert_eq!(cycle.current(), 1);
        cycle.advance();
        assert_eq!(cycle.current(), 0);
    }

    #[test]
    fn frame_cycle_has_at_least_one_slot() {
        let mut cycle = FrameCycle::new(0);
        cycle.advance();
        assert_eq!(cycle.current(), 0);
        assert_eq!(cycle.count(), 1);
    }

    #[test]
    fn claim_returns_previous_fence() {
        let a = vk::Fence::from_raw(1);
        let b = vk::Fence::from_raw(2);
        let mut images = ImagesInFlight::new(3);

        assert_eq!(images.claim(1, a), None);
        assert_eq!(images.claim(1, b), Some(a));
        assert_eq!(images.claim(0, b), None);
        assert_eq!(images.claim(1, a), Some(b));
    }

    #[test]
    fn claim_out_of_range_is_ignored() {
        let mut images = ImagesInFlight::new(2);
        assert_eq!(images.claim(5, vk::Fence::from_raw(1)), None);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn reset_forgets_fences() {
        let mut images = ImagesInFlight::new(2);
        images.claim(0, vk::Fence::from_raw(7));
        images.reset(3);
        assert_eq!(images.len(), 3);
        assert_eq!(images.claim(0, vk::Fence::from_raw(8)), None);
    }
}
