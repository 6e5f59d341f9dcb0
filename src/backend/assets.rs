// Loaded GPU assets, looked up by name

use anyhow::{Context, Result};
use std::collections::HashMap;

use super::image::Image;
use super::mesh::Mesh;
use super::shader::Shader;

/// Shader plus the textures bound to its sampler uniforms
///
/// `textures` maps a sampler uniform name to a texture asset key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Material {
    pub shader: String,
    pub textures: HashMap<String, String>,
}

impl Material {
    pub fn new(shader: impl Into<String>) -> Self {
        Self {
            shader: shader.into(),
            textures: HashMap::new(),
        }
    }

    pub fn with_texture(mut self, uniform: impl Into<String>, texture: impl Into<String>) -> Self {
        self.textures.insert(uniform.into(), texture.into());
        self
    }
}

#[derive(Default)]
pub struct Assets {
    pub meshes: HashMap<String, Mesh>,
    pub textures: HashMap<String, Image>,
    pub shaders: HashMap<String, Shader>,
}

impl Assets {
    pub fn mesh(&self, name: &str) -> Result<&Mesh> {
        self.meshes
            .get(name)
            .with_context(|| format!("Unknown mesh: {name}"))
    }

    pub fn texture(&self, name: &str) -> Result<&Image> {
        self.textures
            .get(name)
            .with_context(|| format!("Unknown texture: {name}"))
    }

    pub fn shader(&self, name: &str) -> Result<&Shader> {
        self.shaders
            .get(name)
            .with_context(|| format!("Unknown shader: {name}"))
    }

    /// Texture bound to `uniform` by `material`
    pub fn material_texture(&self, material: &Material, uniform: &str) -> Result<&Image> {
        let key = material
            .textures
            .get(uniform)
            .with_context(|| format!("Material has no texture bound to {uniform}"))?;
        self.texture(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_name_the_missing_asset() {
        let assets = Assets::default();
        assert_eq!(assets.shader("mesh").err().unwrap().to_string(), "Unknown shader: mesh");
        assert_eq!(assets.mesh("quad").err().unwrap().to_string(), "Unknown mesh: quad");
    }

    #[test]
    fn material_texture_requires_binding() {
        let assets = Assets::default();
        let material = Material::new("mesh").with_texture("texSampler", "checker");

        let unbound = assets.material_texture(&material, "normalMap").err().unwrap();
        assert_eq!(unbound.to_string(), "Material has no texture bound to normalMap");

        let unloaded = assets.material_texture(&material, "texSampler").err().unwrap();
        assert_eq!(unloaded.to_string(), "Unknown texture: checker");
    }
}
