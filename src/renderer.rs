// =============================================================================
// RENDERER - the textured, spinning mesh demo
// =============================================================================
//
// Owns every Vulkan object the demo needs and drives the frame loop.
//
// FRAME FLOW:
// 1. Wait for this frame slot's fence
// 2. Acquire a swapchain image (recreate and skip if out of date)
// 3. Write the transform uniform for that image
// 4. Wait for whichever frame last rendered to the image
// 5. Submit the pre-recorded commands
// 6. Present (recreate if out of date, suboptimal or resized)
// 7. Advance to the next frame slot
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::device::clamp_sample_count;
use crate::backend::mesh::VertexAttributes;
use crate::backend::shader::UniformKind;
use crate::backend::sync::wait_for_fence;
use crate::backend::texture::create_texture;
use crate::backend::{
    Assets, CommandPool, Descriptor, Device, FrameCycle, FrameSync, ImagesInFlight, Instance,
    Material, Mesh, MeshData, Pipeline, RenderCommand, Shader, Surface, Swapchain,
    SwapchainRenderTarget, TextureData,
};
use crate::config::Config;

/// Vertex inputs the demo vertex shader reads at locations 0, 1 and 2
pub const MESH_ATTRIBUTES: VertexAttributes = VertexAttributes::all();

/// Uniform buffer the transforms are written to
pub const TRANSFORM_UNIFORM: &str = "ubo";

const MESH_ASSET: &str = "mesh";
const TEXTURE_ASSET: &str = "texture";

/// Model/view/projection block matching the vertex shader's binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Transforms `seconds` into the animation for a viewport of `aspect` ratio
    pub fn at_time(seconds: f32, aspect: f32) -> Self {
        let model = Mat4::from_rotation_z(seconds * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

/// Everything that has to be rebuilt along with the swapchain
///
/// Field order is drop order.
struct SwapchainResources {
    render_command: RenderCommand,
    descriptor: Descriptor,
    pipeline: Pipeline,
    target: SwapchainRenderTarget,
    swapchain: Swapchain,
}

/// Main renderer holding all Vulkan resources.
///
/// IMPORTANT: Field order matters for Drop! Resources are released in
/// declaration order, which is the reverse of creation order.
pub struct Renderer {
    frames: Vec<FrameSync>,
    cycle: FrameCycle,
    images_in_flight: ImagesInFlight,

    resources: Option<SwapchainResources>,

    assets: Assets,
    material: Material,
    pool: CommandPool,
    device: Arc<Device>,
    surface: Surface,

    samples: vk::SampleCountFlags,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    shader_manifest: std::path::PathBuf,
    start_time: Instant,
}

impl Renderer {
    /// Create the whole Vulkan stack for `window` and load the configured assets
    pub fn new<W>(window: &W, width: u32, height: u32, config: &Config) -> Result<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Initializing Vulkan...");

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let instance = Arc::new(Instance::new(
            &config.window.title,
            enable_validation,
            window.raw_display_handle(),
        )?);

        let surface = Surface::new(instance.clone(), window)?;

        let device = Device::new(
            instance,
            &surface,
            &[ash::extensions::khr::Swapchain::name()],
        )?;

        let pool = CommandPool::new(device.clone(), device.graphics_queue)?;

        let shader_manifest = config.shader_manifest_path();
        let mut assets = Assets::default();
        let material = load_assets(&mut assets, &pool, config, &shader_manifest)?;

        let samples = clamp_sample_count(config.graphics.msaa_samples, device.max_usable_sample_count());
        log::info!("MSAA samples: {:?}", samples);

        let frames = (0..config.frames_in_flight())
            .map(|_| FrameSync::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut renderer = Self {
            cycle: FrameCycle::new(frames.len()),
            frames,
            images_in_flight: ImagesInFlight::default(),
            resources: None,
            assets,
            material,
            pool,
            device,
            surface,
            samples,
            present_mode: config.present_mode(),
            clear_color: config.graphics.clear_color,
            shader_manifest,
            start_time: Instant::now(),
        };

        renderer.recreate_swapchain(width, height)?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Rebuild the swapchain and everything derived from it
    ///
    /// A zero-sized extent (minimized window) releases the old swapchain
    /// and defers creation until the window has a size again.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.device.wait_idle()?;

        // The surface can only have one swapchain at a time
        self.resources = None;

        if width == 0 || height == 0 {
            log::debug!("Window minimized, deferring swapchain creation");
            return Ok(());
        }

        let device = &self.device;
        let swapchain = Swapchain::new(device.clone(), &self.surface, width, height, self.present_mode)?;
        let target = SwapchainRenderTarget::new(device.clone(), &swapchain, &self.pool, self.samples)?;

        let shader = self.assets.shader(&self.material.shader)?;
        let mesh = self.assets.mesh(MESH_ASSET)?;
        let pipeline = Pipeline::default_pipeline(device.clone(), shader, &mesh.description(), &target)?;

        let descriptor = Descriptor::new(
            device.clone(),
            &self.material,
            &self.assets,
            swapchain.image_count() as u32,
        )?;

        let render_command = RenderCommand::new(
            &self.pool,
            &target,
            &pipeline,
            mesh,
            &descriptor,
            self.clear_color,
        )?;

        log::info!("Created {} pre-recorded command buffers", render_command.buffers.len());

        self.images_in_flight.reset(swapchain.image_count());
        self.resources = Some(SwapchainResources {
            render_command,
            descriptor,
            pipeline,
            target,
            swapchain,
        });

        Ok(())
    }

    /// Reload the shader manifest and SPIR-V from disk, then rebuild the pipeline
    ///
    /// On failure the previous shader and a pipeline built from it stay in use.
    pub fn reload_shaders(&mut self, width: u32, height: u32) -> Result<()> {
        let shader = Shader::from_manifest(self.device.clone(), &self.material.shader, &self.shader_manifest)
            .context("Failed to reload shaders")?;
        check_transform_uniform(&shader)?;

        apply_or_restore(
            self,
            |renderer| {
                let material = renderer.material.clone();
                bind_sampler_uniforms(&mut renderer.material, &shader);
                let previous = renderer
                    .assets
                    .shaders
                    .insert(renderer.material.shader.clone(), shader);
                (material, previous)
            },
            |renderer, (material, previous)| {
                log::warn!("Restoring previous shader {}", material.shader);
                match previous {
                    Some(previous) => {
                        renderer.assets.shaders.insert(material.shader.clone(), previous);
                    }
                    None => {
                        renderer.assets.shaders.remove(&material.shader);
                    }
                }
                renderer.material = material;
            },
            |renderer| renderer.recreate_swapchain(width, height),
        )
        .context("Failed to rebuild pipeline for reloaded shader")?;

        log::info!("Reloaded shader {}", self.material.shader);
        Ok(())
    }

    /// Render and present one frame
    ///
    /// Returns whether a frame was presented. `resized` forces swapchain
    /// recreation after presenting.
    pub fn draw_frame(&mut self, width: u32, height: u32, resized: bool) -> Result<bool> {
        if width == 0 || height == 0 {
            return Ok(false);
        }
        if self.resources.is_none() {
            self.recreate_swapchain(width, height)?;
        }
        let Some(resources) = self.resources.as_mut() else {
            return Ok(false);
        };

        let frame = &self.frames[self.cycle.current()];

        // STEP 1: Wait for the frame that last used this slot
        frame.wait()?;

        // STEP 2: Acquire; suboptimal is still usable, so only out of date recreates
        let acquired = resources
            .swapchain
            .acquire_next_image(u64::MAX, frame.image_available)?;
        let Some((image_index, _suboptimal)) = acquired else {
            self.recreate_swapchain(width, height)?;
            return Ok(false);
        };
        let image = image_index as usize;

        // STEP 3: Update transforms for this image
        let extent = resources.swapchain.extent;
        let ubo = UniformBufferObject::at_time(
            self.start_time.elapsed().as_secs_f32(),
            extent.width as f32 / extent.height as f32,
        );
        resources.descriptor.write_uniform(TRANSFORM_UNIFORM, image, &ubo)?;

        // STEP 4: Don't render into an image an earlier frame is still using
        if let Some(previous) = self.images_in_flight.claim(image, frame.in_flight_fence) {
            if previous != frame.in_flight_fence {
                wait_for_fence(&self.device, previous)?;
            }
        }

        // STEP 5: Submit
        frame.reset()?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [resources.render_command.buffers[image]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.handle.queue_submit(
                self.device.graphics_queue.handle,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")?;

        // STEP 6: Present
        let needs_recreate = resources.swapchain.present(
            self.device.present_queue.handle,
            image_index,
            &signal_semaphores,
        )?;

        // STEP 7: Next frame slot
        self.cycle.advance();

        if needs_recreate || resized {
            self.recreate_swapchain(width, height)?;
        }

        Ok(true)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Wait for GPU to finish before anything is destroyed
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {e:#}");
        }
    }
}

/// Load the shader, mesh and texture named by `config` into `assets`
fn load_assets(
    assets: &mut Assets,
    pool: &CommandPool,
    config: &Config,
    shader_manifest: &std::path::Path,
) -> Result<Material> {
    let device = pool.device().clone();

    let shader = Shader::from_manifest(device, &config.assets.shader, shader_manifest)
        .with_context(|| format!("Failed to load shader {}", config.assets.shader))?;
    check_transform_uniform(&shader)?;

    let mesh_data = match &config.assets.mesh {
        Some(path) => MeshData::load_from_file(path)?,
        None => MeshData::quad(),
    };
    check_mesh_attributes(mesh_data.attributes)?;
    let mesh = Mesh::new(pool, &mesh_data, MESH_ASSET)?;

    let texture_data = match &config.assets.texture {
        Some(path) => TextureData::load(path)?,
        None => TextureData::checkerboard(256, 32),
    };
    let texture = create_texture(pool, &texture_data, TEXTURE_ASSET)?;

    let mut material = Material::new(config.assets.shader.clone());
    bind_sampler_uniforms(&mut material, &shader);

    assets.shaders.insert(config.assets.shader.clone(), shader);
    assets.meshes.insert(MESH_ASSET.to_string(), mesh);
    assets.textures.insert(TEXTURE_ASSET.to_string(), texture);

    Ok(material)
}

/// Point every sampler uniform of `shader` at the demo texture
fn bind_sampler_uniforms(material: &mut Material, shader: &Shader) {
    for uniform in &shader.info.uniforms {
        if uniform.kind == UniformKind::CombinedImageSampler {
            material
                .textures
                .insert(uniform.name.clone(), TEXTURE_ASSET.to_string());
        }
    }
}

/// Run `rebuild` after `apply`
///
/// If the rebuild fails, `restore` undoes `apply` and the rebuild runs again
/// so the previous state is live. The first error is returned either way.
fn apply_or_restore<S, U>(
    state: &mut S,
    apply: impl FnOnce(&mut S) -> U,
    restore: impl FnOnce(&mut S, U),
    mut rebuild: impl FnMut(&mut S) -> Result<()>,
) -> Result<()> {
    let undo = apply(state);
    match rebuild(state) {
        Ok(()) => Ok(()),
        Err(e) => {
            restore(state, undo);
            rebuild(state).context("Failed to restore previous state")?;
            Err(e)
        }
    }
}

fn check_mesh_attributes(attributes: VertexAttributes) -> Result<()> {
    if attributes != MESH_ATTRIBUTES {
        anyhow::bail!(
            "Mesh has vertex attributes {:?}, the demo shader needs {:?}",
            attributes,
            MESH_ATTRIBUTES
        );
    }
    Ok(())
}

fn check_transform_uniform(shader: &Shader) -> Result<()> {
    let (_, uniform) = shader
        .info
        .uniform(TRANSFORM_UNIFORM)
        .with_context(|| format!("Shader {} has no {} uniform", shader.name, TRANSFORM_UNIFORM))?;

    let size = std::mem::size_of::<UniformBufferObject>() as u64;
    if uniform.kind != UniformKind::UniformBuffer || uniform.size < size {
        anyhow::bail!(
            "Uniform {} must be a uniform buffer of at least {} bytes",
            TRANSFORM_UNIFORM,
            size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EPSILON: f32 = 1e-5;

    #[derive(Default)]
    struct Pipelines {
        shaders: std::collections::HashMap<String, &'static str>,
        built_from: Vec<&'static str>,
    }

    fn build(pipelines: &mut Pipelines) -> Result<()> {
        let shader = pipelines.shaders["mesh"];
        if shader == "truncated" {
            anyhow::bail!("Failed to create graphics pipeline");
        }
        pipelines.built_from.push(shader);
        Ok(())
    }

    fn swap_shader(pipelines: &mut Pipelines, shader: &'static str) -> Result<()> {
        apply_or_restore(
            pipelines,
            |p| p.shaders.insert("mesh".to_string(), shader),
            |p, previous| {
                if let Some(previous) = previous {
                    p.shaders.insert("mesh".to_string(), previous);
                }
            },
            build,
        )
    }

    #[test]
    fn broken_shader_rebuilds_with_previous_one() {
        let mut pipelines = Pipelines::default();
        pipelines.shaders.insert("mesh".to_string(), "v1");

        let err = swap_shader(&mut pipelines, "truncated").unwrap_err();
        assert_eq!(err.to_string(), "Failed to create graphics pipeline");
        assert_eq!(pipelines.shaders["mesh"], "v1");
        assert_eq!(pipelines.built_from, vec!["v1"]);
    }

    #[test]
    fn working_shader_is_kept() {
        let mut pipelines = Pipelines::default();
        pipelines.shaders.insert("mesh".to_string(), "v1");

        swap_shader(&mut pipelines, "v2").unwrap();
        assert_eq!(pipelines.shaders["mesh"], "v2");
        assert_eq!(pipelines.built_from, vec!["v2"]);
    }

    #[test]
    fn mesh_must_carry_every_attribute_the_shader_reads() {
        assert!(check_mesh_attributes(MeshData::quad().attributes).is_ok());

        let no_normals = VertexAttributes::POSITIONS | VertexAttributes::TEX_COORDS;
        let err = check_mesh_attributes(no_normals).unwrap_err();
        assert!(err.to_string().contains("the demo shader needs"));
        assert!(check_mesh_attributes(VertexAttributes::POSITIONS).is_err());
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 192);
    }

    #[test]
    fn model_rotates_ninety_degrees_per_second() {
        let ubo = UniformBufferObject::at_time(1.0, 1.0);
        let x = ubo.model.transform_vector3(Vec3::X);
        assert!((x - Vec3::Y).length() < EPSILON);

        let still = UniformBufferObject::at_time(0.0, 1.0);
        assert!(still.model.abs_diff_eq(Mat4::IDENTITY, EPSILON));
    }

    #[test]
    fn view_looks_at_origin_from_corner() {
        let ubo = UniformBufferObject::at_time(0.0, 1.0);
        let eye = ubo.view.transform_point3(Vec3::new(2.0, 2.0, 2.0));
        assert!(eye.length() < EPSILON);

        // Origin ends up straight ahead, down -Z in view space
        let origin = ubo.view.transform_point3(Vec3::ZERO);
        assert!(origin.x.abs() < EPSILON && origin.y.abs() < EPSILON);
        assert!((origin.z + 12f32.sqrt()).abs() < EPSILON);
    }

    #[test]
    fn projection_flips_y() {
        let ubo = UniformBufferObject::at_time(0.0, 4.0 / 3.0);
        let unflipped = Mat4::perspective_rh(45f32.to_radians(), 4.0 / 3.0, 0.1, 10.0);
        assert_eq!(ubo.proj.y_axis.y, -unflipped.y_axis.y);
        assert_eq!(ubo.proj.x_axis, unflipped.x_axis);

        // A point above the axis lands in the upper half of clip space (negative Y)
        let clip = ubo.proj * Vec4::new(0.0, 1.0, -5.0, 1.0);
        assert!(clip.y < 0.0);
    }
}
