// Descriptor sets for a material
//
// One set per swapchain image. Every uniform buffer in the shader gets its
// own host-visible buffer per set; every sampler uniform gets one sampler
// bound to the material's texture of the same name.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use std::sync::Arc;

use super::assets::{Assets, Material};
use super::buffer::Buffer;
use super::shader::{Uniform, UniformKind};
use super::Device;

const MAX_ANISOTROPY: f32 = 16.0;

pub struct Descriptor {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    uniform_buffers: HashMap<String, Vec<Buffer>>,
    samplers: HashMap<String, vk::Sampler>,
    device: Arc<Device>,
}

impl Descriptor {
    /// Allocate and fill `count` descriptor sets for `material`
    pub fn new(device: Arc<Device>, material: &Material, assets: &Assets, count: u32) -> Result<Self> {
        let shader = assets.shader(&material.shader)?;
        let uniforms = &shader.info.uniforms;

        let pool_sizes = pool_sizes(uniforms, count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count);

        let pool = unsafe { device.handle.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        // From here on Drop releases whatever has been created
        let mut descriptor = Self {
            pool,
            sets: Vec::new(),
            uniform_buffers: HashMap::new(),
            samplers: HashMap::new(),
            device: device.clone(),
        };

        let layouts = vec![shader.descriptor_set_layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        descriptor.sets = unsafe { device.handle.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        for (binding, uniform) in uniforms.iter().enumerate() {
            let binding = binding as u32;
            match uniform.kind {
                UniformKind::UniformBuffer => {
                    let buffers = (0..count)
                        .map(|i| {
                            Buffer::new(
                                device.clone(),
                                uniform.size,
                                vk::BufferUsageFlags::UNIFORM_BUFFER,
                                MemoryLocation::CpuToGpu,
                                &format!("{} #{}", uniform.name, i),
                            )
                        })
                        .collect::<Result<Vec<_>>>()?;

                    for (&set, buffer) in descriptor.sets.iter().zip(&buffers) {
                        let buffer_info = [vk::DescriptorBufferInfo {
                            buffer: buffer.handle,
                            offset: 0,
                            range: uniform.size,
                        }];
                        let write = vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(binding)
                            .dst_array_element(0)
                            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                            .buffer_info(&buffer_info);
                        unsafe { device.handle.update_descriptor_sets(&[write.build()], &[]) };
                    }

                    descriptor.uniform_buffers.insert(uniform.name.clone(), buffers);
                }
                UniformKind::CombinedImageSampler => {
                    let texture = assets.material_texture(material, &uniform.name)?;

                    let sampler = create_sampler(&device, texture.mip_levels)?;
                    descriptor.samplers.insert(uniform.name.clone(), sampler);

                    for &set in &descriptor.sets {
                        let image_info = [vk::DescriptorImageInfo {
                            sampler,
                            image_view: texture.view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        }];
                        let write = vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(binding)
                            .dst_array_element(0)
                            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                            .image_info(&image_info);
                        unsafe { device.handle.update_descriptor_sets(&[write.build()], &[]) };
                    }
                }
            }
        }

        Ok(descriptor)
    }

    /// Copy `data` into the buffer behind uniform `name` for set `index`
    pub fn write_uniform<T: Pod>(&mut self, name: &str, index: usize, data: &T) -> Result<()> {
        let buffer = self
            .uniform_buffers
            .get_mut(name)
            .and_then(|buffers| buffers.get_mut(index))
            .with_context(|| format!("No uniform buffer {name} for set {index}"))?;
        buffer.write(0, std::slice::from_ref(data))
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        unsafe {
            // Frees the sets with it
            self.device.handle.destroy_descriptor_pool(self.pool, None);
            for (_, sampler) in self.samplers.drain() {
                self.device.handle.destroy_sampler(sampler, None);
            }
        }
    }
}

/// One pool size per uniform kind, `count` descriptors per uniform
pub fn pool_sizes(uniforms: &[Uniform], count: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for uniform in uniforms {
        let ty = uniform.kind.descriptor_type();
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

fn create_sampler(device: &Device, mip_levels: u32) -> Result<vk::Sampler> {
    let max_anisotropy = MAX_ANISOTROPY.min(device.properties.limits.max_sampler_anisotropy);

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(mip_levels as f32);

    unsafe { device.handle.create_sampler(&sampler_info, None) }
        .context("Failed to create texture sampler")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shader::ShaderStage;

    fn uniform(name: &str, kind: UniformKind) -> Uniform {
        Uniform {
            name: name.to_string(),
            kind,
            size: if kind == UniformKind::UniformBuffer { 64 } else { 0 },
            stages: vec![ShaderStage::Fragment],
        }
    }

    #[test]
    fn pool_sizes_group_by_kind() {
        let uniforms = [
            uniform("ubo", UniformKind::UniformBuffer),
            uniform("albedo", UniformKind::CombinedImageSampler),
            uniform("lights", UniformKind::UniformBuffer),
        ];
        let sizes = pool_sizes(&uniforms, 3);

        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 6);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 3);
    }

    #[test]
    fn no_uniforms_no_pool_sizes() {
        assert!(pool_sizes(&[], 2).is_empty());
    }
}
