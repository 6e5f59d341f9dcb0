// Command pools and one-shot command buffers

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::queue::Queue;
use super::Device;

/// Command pool tied to a single queue family
pub struct CommandPool {
    pub handle: vk::CommandPool,
    pub queue: Queue,
    device: Arc<Device>,
}

impl CommandPool {
    pub fn new(device: Arc<Device>, queue: Queue) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue.family);

        let handle = unsafe { device.handle.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            handle,
            queue,
            device,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn allocate_primary(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.handle.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe {
            self.device.handle.free_command_buffers(self.handle, buffers);
        }
    }

    /// Allocate a buffer and begin recording for a one-off submission
    pub fn single_use(&self) -> Result<SingleUseCommandBuffer<'_>> {
        SingleUseCommandBuffer::begin(self)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle.destroy_command_pool(self.handle, None);
        }
    }
}

/// Command buffer recorded once, submitted, then waited on and freed
pub struct SingleUseCommandBuffer<'a> {
    pub handle: vk::CommandBuffer,
    pool: &'a CommandPool,
}

impl<'a> SingleUseCommandBuffer<'a> {
    fn begin(pool: &'a CommandPool) -> Result<Self> {
        let handle = pool
            .allocate_primary(1)?
            .into_iter()
            .next()
            .context("Failed to allocate command buffers")?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe { pool.device.handle.begin_command_buffer(handle, &begin_info) } {
            pool.free(&[handle]);
            return Err(e).context("Failed to begin recording command buffer");
        }

        Ok(Self { handle, pool })
    }

    /// Finish recording, submit to the pool's queue and block until done
    pub fn submit(self) -> Result<()> {
        let device = &self.pool.device.handle;
        let queue = self.pool.queue.handle;

        unsafe {
            device
                .end_command_buffer(self.handle)
                .context("Failed to record command buffer")?;

            let command_buffers = [self.handle];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

            device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit command buffer")?;
            device.queue_wait_idle(queue)?;
        }

        Ok(())
    }
}

impl Drop for SingleUseCommandBuffer<'_> {
    fn drop(&mut self) {
        self.pool.free(&[self.handle]);
    }
}
