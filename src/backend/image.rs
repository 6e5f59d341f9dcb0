// Images - textures, depth and multisample targets
//
// Covers creation with allocator-backed memory, views, layout
// transitions, buffer uploads and mipmap generation by blitting.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::Buffer;
use super::command::CommandPool;
use super::Device;

/// Parameters for a 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub location: MemoryLocation,
}

impl ImageDesc {
    /// Single-sampled, single-level, device-local, optimal tiling
    pub fn new(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            location: MemoryLocation::GpuOnly,
        }
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

pub struct Image {
    pub handle: vk::Image,
    /// Null until `create_view` is called
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl Image {
    pub fn new(device: Arc<Device>, desc: ImageDesc, name: &str) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.handle.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.handle.get_image_memory_requirements(handle) };
        let linear = desc.tiling == vk::ImageTiling::LINEAR;

        let allocation = match device.allocate(name, requirements, desc.location, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle.destroy_image(handle, None) };
                return Err(e).context("Failed to allocate image memory");
            }
        };

        let bound = unsafe {
            device
                .handle
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.handle.destroy_image(handle, None) };
            device.free(allocation)?;
            return Err(e).context("Failed to bind image memory");
        }

        Ok(Self {
            handle,
            view: vk::ImageView::null(),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            allocation: Some(allocation),
            device,
        })
    }

    /// Create the image's view over all mip levels, replacing any previous one
    pub fn create_view(&mut self, aspect: vk::ImageAspectFlags) -> Result<()> {
        let view = Self::view_for(&self.device, self.handle, self.format, aspect, self.mip_levels)?;
        if self.view != vk::ImageView::null() {
            unsafe { self.device.handle.destroy_image_view(self.view, None) };
        }
        self.view = view;
        Ok(())
    }

    /// 2D view of an image we don't own (e.g. a swapchain image)
    pub fn view_for(
        device: &Device,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { device.handle.create_image_view(&view_info, None) }
            .context("Failed to create texture image view")
    }

    /// Move all mip levels from `old` to `new` layout
    pub fn transition_layout(
        &self,
        pool: &CommandPool,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let transition = layout_transition(old, new)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: transition_aspect(self.format, new),
                base_mip_level: 0,
                level_count: self.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .build();

        let command_buffer = pool.single_use()?;
        unsafe {
            self.device.handle.cmd_pipeline_barrier(
                command_buffer.handle,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        command_buffer.submit()
    }

    /// Copy tightly packed pixels from `buffer` into mip level 0
    ///
    /// The image must be in TRANSFER_DST_OPTIMAL.
    pub fn load_buffer_data(&self, pool: &CommandPool, buffer: &Buffer) -> Result<()> {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .build();

        let command_buffer = pool.single_use()?;
        unsafe {
            self.device.handle.cmd_copy_buffer_to_image(
                command_buffer.handle,
                buffer.handle,
                self.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        command_buffer.submit()
    }

    /// Fill mip levels 1.. by blitting down from level 0
    ///
    /// Expects every level in TRANSFER_DST_OPTIMAL and leaves every level
    /// in SHADER_READ_ONLY_OPTIMAL.
    pub fn generate_mipmaps(&self, pool: &CommandPool) -> Result<()> {
        let props = self.device.format_properties(self.format);
        if !props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            anyhow::bail!("Texture image format does not support linear blitting");
        }

        let device = &self.device.handle;
        let command_buffer = pool.single_use()?;

        let barrier = |level: u32,
                       old: vk::ImageLayout,
                       new: vk::ImageLayout,
                       src_access: vk::AccessFlags,
                       dst_access: vk::AccessFlags| {
            vk::ImageMemoryBarrier::builder()
                .image(self.handle)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .old_layout(old)
                .new_layout(new)
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .build()
        };

        let regions = mip_blit_regions(self.extent, self.mip_levels);

        unsafe {
            for (i, (src_extent, dst_extent)) in regions.iter().enumerate() {
                let src_level = i as u32;
                let dst_level = src_level + 1;

                device.cmd_pipeline_barrier(
                    command_buffer.handle,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier(
                        src_level,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                    )],
                );

                let blit = vk::ImageBlit::builder()
                    .src_offsets([vk::Offset3D::default(), corner(*src_extent)])
                    .src_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: src_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .dst_offsets([vk::Offset3D::default(), corner(*dst_extent)])
                    .dst_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: dst_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .build();

                device.cmd_blit_image(
                    command_buffer.handle,
                    self.handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );

                device.cmd_pipeline_barrier(
                    command_buffer.handle,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier(
                        src_level,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_READ,
                    )],
                );
            }

            // The last level was only ever written to
            device.cmd_pipeline_barrier(
                command_buffer.handle,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier(
                    self.mip_levels.saturating_sub(1),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                )],
            );
        }

        command_buffer.submit()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle.destroy_image_view(self.view, None);
            }
            self.device.handle.destroy_image(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.free(allocation) {
                log::error!("Failed to free image memory: {e:#}");
            }
        }
    }
}

/// Access masks and pipeline stages for a layout transition barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    use vk::ImageLayout as L;

    let transition = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => LayoutTransition {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => LayoutTransition {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => LayoutTransition {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        },
        _ => anyhow::bail!("Unsupported layout transition: {:?} -> {:?}", old, new),
    };

    Ok(transition)
}

/// Aspect a barrier into `new` must cover for an image of `format`
pub fn transition_aspect(format: vk::Format, new: vk::ImageLayout) -> vk::ImageAspectFlags {
    if new == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if format_has_stencil(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn format_has_stencil(format: vk::Format) -> bool {
    format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT
}

/// Number of levels in a full mip chain down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

/// (source, destination) extent of each blit in a mip chain
///
/// Entry `i` blits level `i` into level `i + 1`.
pub fn mip_blit_regions(extent: vk::Extent2D, mip_levels: u32) -> Vec<(vk::Extent2D, vk::Extent2D)> {
    let mut current = extent;
    (1..mip_levels)
        .map(|_| {
            let next = vk::Extent2D {
                width: (current.width / 2).max(1),
                height: (current.height / 2).max(1),
            };
            let region = (current, next);
            current = next;
            region
        })
        .collect()
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(region: &(vk::Extent2D, vk::Extent2D)) -> ((u32, u32), (u32, u32)) {
        (
            (region.0.width, region.0.height),
            (region.1.width, region.1.height),
        )
    }

    #[test]
    fn supported_transitions() {
        let upload =
            layout_transition(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(upload.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let sample = layout_transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(sample.dst_access, vk::AccessFlags::SHADER_READ);

        let depth = layout_transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
    }

    #[test]
    fn other_transitions_fail() {
        let err = layout_transition(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Unsupported layout transition"));
    }

    #[test]
    fn depth_aspect_includes_stencil_when_present() {
        let depth = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        assert_eq!(
            transition_aspect(vk::Format::D32_SFLOAT, depth),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            transition_aspect(vk::Format::D24_UNORM_S8_UINT, depth),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            transition_aspect(vk::Format::R8G8B8A8_UNORM, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn stencil_formats() {
        assert!(format_has_stencil(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(format_has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!format_has_stencil(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn mip_counts() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(512, 512), 10);
        assert_eq!(mip_level_count(512, 100), 10);
        assert_eq!(mip_level_count(300, 200), 9);
    }

    #[test]
    fn blit_regions_halve_and_stop_at_one() {
        let extent = vk::Extent2D {
            width: 8,
            height: 2,
        };
        let regions = mip_blit_regions(extent, mip_level_count(8, 2));
        let regions: Vec<_> = regions.iter().map(dims).collect();
        assert_eq!(
            regions,
            vec![((8, 2), (4, 1)), ((4, 1), (2, 1)), ((2, 1), (1, 1))]
        );
        assert!(mip_blit_regions(extent, 1).is_empty());
    }
}
