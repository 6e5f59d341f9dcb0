// GPU buffers for vertex, index, uniform and staging data
//
// Memory comes from the device allocator. Host-visible buffers stay
// persistently mapped so uniform updates are a plain memcpy.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::CommandPool;
use super::Device;

pub struct Buffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory to it
    ///
    /// `CpuToGpu` memory is host visible and mapped, `GpuOnly` is device local.
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer size must be non-zero");
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.handle.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.handle.get_buffer_memory_requirements(handle) };

        let allocation = match device.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle.destroy_buffer(handle, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        let bound = unsafe {
            device
                .handle
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.handle.destroy_buffer(handle, None) };
            device.free(allocation)?;
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(Self {
            handle,
            size,
            allocation: Some(allocation),
            device,
        })
    }

    /// Host-visible buffer initialised with `data`
    pub fn with_data<T: Pod>(
        device: Arc<Device>,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new(
            device,
            bytes.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
            name,
        )?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a temporary staging buffer
    pub fn device_local_with_data<T: Pod>(
        pool: &CommandPool,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let device = pool.device().clone();
        let staging = Self::with_data(
            device.clone(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
            &format!("{name} (staging)"),
        )?;

        let buffer = Self::new(
            device,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;

        Self::copy(pool, &staging, &buffer, 0, 0, None)?;
        Ok(buffer)
    }

    /// Copy `data` into the mapped memory at byte `offset`
    pub fn write<T: Pod>(&mut self, offset: usize, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let end = offset + bytes.len();
        if end as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes at offset {} overflows buffer of {} bytes",
                bytes.len(),
                offset,
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        mapped[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Record and submit a one-off copy between two buffers
    ///
    /// A `size` of `None` copies the rest of `src` from `src_offset`.
    pub fn copy(
        pool: &CommandPool,
        src: &Buffer,
        dst: &Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: Option<vk::DeviceSize>,
    ) -> Result<()> {
        let region = copy_region(src.size, dst.size, src_offset, dst_offset, size)?;

        let command_buffer = pool.single_use()?;
        unsafe {
            pool.device().handle.cmd_copy_buffer(
                command_buffer.handle,
                src.handle,
                dst.handle,
                &[region],
            );
        }
        command_buffer.submit()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.handle.destroy_buffer(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.free(allocation) {
                log::error!("Failed to free buffer memory: {e:#}");
            }
        }
    }
}

/// Validate a copy range and build the region for it
pub fn copy_region(
    src_size: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
    size: Option<vk::DeviceSize>,
) -> Result<vk::BufferCopy> {
    let size = size.unwrap_or_else(|| src_size.saturating_sub(src_offset));

    if size == 0 {
        anyhow::bail!("Nothing to copy");
    }
    if src_offset.checked_add(size).map_or(true, |end| end > src_size) {
        anyhow::bail!("Copy reads past the end of the source buffer");
    }
    if dst_offset.checked_add(size).map_or(true, |end| end > dst_size) {
        anyhow::bail!("Copy writes past the end of the destination buffer");
    }

    Ok(vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_source_copy_by_default() {
        let region = copy_region(256, 512, 0, 128, None).unwrap();
        assert_eq!(region.size, 256);
        assert_eq!(region.dst_offset, 128);
    }

    #[test]
    fn default_size_starts_at_source_offset() {
        let region = copy_region(256, 256, 64, 0, None).unwrap();
        assert_eq!(region.src_offset, 64);
        assert_eq!(region.size, 192);
    }

    #[test]
    fn out_of_range_copies_are_rejected() {
        assert!(copy_region(256, 128, 0, 0, None).is_err());
        assert!(copy_region(256, 256, 200, 0, Some(100)).is_err());
        assert!(copy_region(256, 256, 256, 0, None).is_err());
    }

    #[test]
    fn overflowing_ranges_are_rejected() {
        assert!(copy_region(256, 256, 1, 0, Some(u64::MAX)).is_err());
        assert!(copy_region(256, 256, 0, u64::MAX, Some(16)).is_err());
    }
}
