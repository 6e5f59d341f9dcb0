// Render target for the swapchain
//
// Owns the depth buffer, the optional multisampled color buffer, the
// render pass and one framebuffer per swapchain image. Rebuilt along
// with the swapchain.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::image::{Image, ImageDesc};
use super::{Device, Swapchain};

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub struct SwapchainRenderTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
    pub depth_format: vk::Format,
    depth: Image,
    color: Option<Image>,
    device: Arc<Device>,
}

impl SwapchainRenderTarget {
    pub fn new(
        device: Arc<Device>,
        swapchain: &Swapchain,
        pool: &CommandPool,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let extent = swapchain.extent;

        let depth_format = device
            .find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            )
            .context("Failed to find a depth format")?;

        let mut depth = Image::new(
            device.clone(),
            ImageDesc::new(extent, depth_format, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .samples(samples),
            "depth buffer",
        )?;
        depth.create_view(vk::ImageAspectFlags::DEPTH)?;
        depth.transition_layout(
            pool,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;

        // Multisampled color buffer, resolved into the swapchain image
        let color = if samples != vk::SampleCountFlags::TYPE_1 {
            let mut color = Image::new(
                device.clone(),
                ImageDesc::new(
                    extent,
                    swapchain.format,
                    vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                )
                .samples(samples),
                "msaa color buffer",
            )?;
            color.create_view(vk::ImageAspectFlags::COLOR)?;
            Some(color)
        } else {
            None
        };

        let render_pass = create_render_pass(&device, swapchain.format, depth_format, samples)?;

        let mut target = Self {
            render_pass,
            framebuffers: Vec::with_capacity(swapchain.image_views.len()),
            extent,
            samples,
            depth_format,
            depth,
            color,
            device,
        };

        for &view in &swapchain.image_views {
            let attachments = target.framebuffer_attachments(view);
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { target.device.handle.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")?;
            target.framebuffers.push(framebuffer);
        }

        log::info!(
            "Created render target: {} framebuffers, depth {:?}, {:?}",
            target.framebuffers.len(),
            depth_format,
            samples
        );

        Ok(target)
    }

    /// Attachment views in render pass order for a swapchain image
    fn framebuffer_attachments(&self, swapchain_view: vk::ImageView) -> Vec<vk::ImageView> {
        match &self.color {
            Some(color) => vec![color.view, self.depth.view, swapchain_view],
            None => vec![swapchain_view, self.depth.view],
        }
    }
}

impl Drop for SwapchainRenderTarget {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.handle.destroy_framebuffer(framebuffer, None);
            }
            self.device.handle.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Attachment descriptions: color, depth and, when multisampling, the resolve target
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Vec<vk::AttachmentDescription> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let color = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        })
        .build();

    let depth = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let mut attachments = vec![color, depth];

    if multisampled {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .build(),
        );
    }

    attachments
}

fn create_render_pass(
    device: &Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(color_format, depth_format, samples);

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_refs = [vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref);
    if attachments.len() > 2 {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }

    let stages =
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let subpasses = [subpass.build()];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.handle.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_has_no_resolve_attachment() {
        let attachments = attachment_descriptions(
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            vk::SampleCountFlags::TYPE_1,
        );
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachments[1].format, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn multisampling_resolves_into_presentable_image() {
        let attachments = attachment_descriptions(
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D24_UNORM_S8_UINT,
            vk::SampleCountFlags::TYPE_4,
        );
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn depth_candidates_prefer_pure_depth() {
        assert_eq!(DEPTH_FORMAT_CANDIDATES[0], vk::Format::D32_SFLOAT);
    }
}
