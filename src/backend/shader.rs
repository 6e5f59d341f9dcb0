// Shaders - SPIR-V modules plus the descriptor layout they expect
//
// Each shader pair ships with a TOML manifest naming the compiled SPIR-V
// files and listing its uniforms in binding order.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Device;

/// Entry point shared by every stage
pub const ENTRY_POINT: &std::ffi::CStr = c"main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniformKind {
    UniformBuffer,
    CombinedImageSampler,
}

impl UniformKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            UniformKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            UniformKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Uniform {
    pub name: String,
    pub kind: UniformKind,
    /// Byte size, only meaningful for uniform buffers
    #[serde(default)]
    pub size: u64,
    pub stages: Vec<ShaderStage>,
}

impl Uniform {
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stages
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |flags, stage| flags | stage.flags())
    }
}

/// Shader manifest
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShaderInfo {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
    #[serde(default)]
    pub uniforms: Vec<Uniform>,
}

impl ShaderInfo {
    /// Load a manifest; SPIR-V paths are resolved against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read file: {}", path.display()))?;
        let mut info = Self::parse(&contents)
            .with_context(|| format!("Invalid shader manifest: {}", path.display()))?;

        if let Some(dir) = path.parent() {
            info.vertex = dir.join(&info.vertex);
            info.fragment = dir.join(&info.fragment);
        }
        Ok(info)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let info: Self = toml::from_str(contents)?;
        for uniform in &info.uniforms {
            if uniform.stages.is_empty() {
                anyhow::bail!("Uniform {} is not used by any stage", uniform.name);
            }
            if uniform.kind == UniformKind::UniformBuffer && uniform.size == 0 {
                anyhow::bail!("Uniform buffer {} has no size", uniform.name);
            }
        }
        Ok(info)
    }

    /// Descriptor set layout bindings, binding `i` for uniform `i`
    pub fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        self.uniforms
            .iter()
            .enumerate()
            .map(|(i, uniform)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(uniform.kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(uniform.stage_flags())
                    .build()
            })
            .collect()
    }

    pub fn uniform(&self, name: &str) -> Option<(u32, &Uniform)> {
        self.uniforms
            .iter()
            .enumerate()
            .find(|(_, uniform)| uniform.name == name)
            .map(|(i, uniform)| (i as u32, uniform))
    }
}

/// SPIR-V words for a vertex/fragment pair
pub struct ShaderData {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderData {
    pub fn load_files(vertex: impl AsRef<Path>, fragment: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            vertex: read_spirv(vertex.as_ref())?,
            fragment: read_spirv(fragment.as_ref())?,
        })
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("Unable to read file: {}", path.display()))?;
    ash::util::read_spv(&mut file).with_context(|| format!("Unable to read file: {}", path.display()))
}

pub struct Shader {
    pub name: String,
    pub info: ShaderInfo,
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    device: Arc<Device>,
}

impl Shader {
    pub fn new(device: Arc<Device>, name: &str, data: &ShaderData, info: ShaderInfo) -> Result<Self> {
        let vertex = create_module(&device, &data.vertex)?;
        let fragment = match create_module(&device, &data.fragment) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.handle.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };

        let bindings = info.layout_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let descriptor_set_layout =
            match unsafe { device.handle.create_descriptor_set_layout(&layout_info, None) } {
                Ok(layout) => layout,
                Err(e) => {
                    unsafe {
                        device.handle.destroy_shader_module(vertex, None);
                        device.handle.destroy_shader_module(fragment, None);
                    }
                    return Err(e).context("Failed to create descriptor set layout");
                }
            };

        Ok(Self {
            name: name.to_string(),
            info,
            vertex,
            fragment,
            descriptor_set_layout,
            device,
        })
    }

    /// Read the manifest at `path`, then the SPIR-V it names
    pub fn from_manifest(device: Arc<Device>, name: &str, path: impl AsRef<Path>) -> Result<Self> {
        let info = ShaderInfo::load(path)?;
        let data = ShaderData::load_files(&info.vertex, &info.fragment)?;
        Self::new(device, name, &data, info)
    }

    pub fn stages(&self) -> [vk::PipelineShaderStageCreateInfo; 2] {
        [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.vertex)
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.fragment)
                .name(ENTRY_POINT)
                .build(),
        ]
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.handle.destroy_shader_module(self.vertex, None);
            self.device.handle.destroy_shader_module(self.fragment, None);
        }
    }
}

fn create_module(device: &Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.handle.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        vertex = "mesh.vert.spv"
        fragment = "mesh.frag.spv"

        [[uniforms]]
        name = "ubo"
        kind = "uniform_buffer"
        size = 192
        stages = ["vertex"]

        [[uniforms]]
        name = "texSampler"
        kind = "combined_image_sampler"
        stages = ["fragment", "vertex"]
    "#;

    #[test]
    fn parses_manifest() {
        let info = ShaderInfo::parse(MANIFEST).unwrap();
        assert_eq!(info.vertex, PathBuf::from("mesh.vert.spv"));
        assert_eq!(info.uniforms.len(), 2);
        assert_eq!(info.uniforms[0].kind, UniformKind::UniformBuffer);
        assert_eq!(info.uniforms[0].size, 192);
        assert_eq!(info.uniforms[1].size, 0);
        assert_eq!(info.uniform("texSampler").map(|(binding, _)| binding), Some(1));
        assert!(info.uniform("missing").is_none());
    }

    #[test]
    fn bindings_follow_uniform_order() {
        let info = ShaderInfo::parse(MANIFEST).unwrap();
        let bindings = info.layout_bindings();

        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(
            bindings[1].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert!(bindings.iter().all(|b| b.descriptor_count == 1));
    }

    #[test]
    fn rejects_unsized_uniform_buffers() {
        let manifest = r#"
            vertex = "a.spv"
            fragment = "b.spv"
            [[uniforms]]
            name = "ubo"
            kind = "uniform_buffer"
            stages = ["vertex"]
        "#;
        assert!(ShaderInfo::parse(manifest).is_err());
    }

    #[test]
    fn rejects_unknown_kinds() {
        let manifest = r#"
            vertex = "a.spv"
            fragment = "b.spv"
            [[uniforms]]
            name = "img"
            kind = "storage_image"
            stages = ["fragment"]
        "#;
        assert!(ShaderInfo::parse(manifest).is_err());
    }

    #[test]
    fn manifest_paths_resolve_next_to_manifest() {
        let dir = std::env::temp_dir().join(format!("vkdev-shader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mesh.toml");
        std::fs::write(&path, MANIFEST).unwrap();

        let info = ShaderInfo::load(&path).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(info.vertex, dir.join("mesh.vert.spv"));
        assert_eq!(info.fragment, dir.join("mesh.frag.spv"));
    }

    #[test]
    fn missing_spirv_names_the_file() {
        let err = ShaderData::load_files("nowhere.vert.spv", "nowhere.frag.spv")
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unable to read file: nowhere.vert.spv");
    }
}
