// Pre-recorded draw commands, one primary buffer per framebuffer

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::descriptor::Descriptor;
use super::mesh::Mesh;
use super::pipeline::Pipeline;
use super::render_target::SwapchainRenderTarget;
use super::Device;

pub struct RenderCommand {
    pub buffers: Vec<vk::CommandBuffer>,
    pool: vk::CommandPool,
    device: Arc<Device>,
}

impl RenderCommand {
    /// Record a draw of `mesh` into every framebuffer of `target`
    ///
    /// Buffer `i` uses framebuffer `i` and descriptor set `i`.
    pub fn new(
        pool: &CommandPool,
        target: &SwapchainRenderTarget,
        pipeline: &Pipeline,
        mesh: &Mesh,
        descriptor: &Descriptor,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let device = pool.device().clone();

        if descriptor.sets.len() < target.framebuffers.len() {
            anyhow::bail!(
                "{} descriptor sets for {} framebuffers",
                descriptor.sets.len(),
                target.framebuffers.len()
            );
        }

        let buffers = pool.allocate_primary(target.framebuffers.len() as u32)?;
        let command = Self {
            buffers,
            pool: pool.handle,
            device,
        };

        let index_type = mesh.index_type()?;
        let clear_values = clear_values(clear_color);

        for (i, &command_buffer) in command.buffers.iter().enumerate() {
            let begin_info = vk::CommandBufferBeginInfo::builder();

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(target.render_pass)
                .framebuffer(target.framebuffers[i])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: target.extent,
                })
                .clear_values(&clear_values);

            let device = &command.device.handle;
            unsafe {
                device
                    .begin_command_buffer(command_buffer, &begin_info)
                    .context("Failed to begin recording command buffer")?;

                device.cmd_begin_render_pass(
                    command_buffer,
                    &render_pass_info,
                    vk::SubpassContents::INLINE,
                );

                device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.handle,
                );
                device.cmd_bind_vertex_buffers(command_buffer, 0, &[mesh.vertex_buffer.handle], &[0]);
                device.cmd_bind_index_buffer(command_buffer, mesh.index_buffer.handle, 0, index_type);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[descriptor.sets[i]],
                    &[],
                );

                device.cmd_draw_indexed(command_buffer, mesh.element_count, 1, 0, 0, 0);

                device.cmd_end_render_pass(command_buffer);

                device
                    .end_command_buffer(command_buffer)
                    .context("Failed to record command buffer")?;
            }
        }

        Ok(command)
    }
}

impl Drop for RenderCommand {
    fn drop(&mut self) {
        unsafe {
            self.device.handle.free_command_buffers(self.pool, &self.buffers);
        }
    }
}

/// Color then depth/stencil clear values, in attachment order
pub fn clear_values(color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_color_then_far_depth() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
        }
    }
}
