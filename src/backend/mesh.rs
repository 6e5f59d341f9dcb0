// Meshes - vertex layout, binary mesh files and GPU upload
//
// Binary layout (little endian):
//   u32 attributes, u32 vertex count, u32 vertex bytes, [vertex bytes]
//   u32 element count, u32 element size, u32 element bytes, [element bytes]
//   optional bounds: 3 x f32 min, 3 x f32 max

use anyhow::{Context, Result};
use ash::vk;
use bitflags::bitflags;
use glam::Vec3;
use std::path::Path;

use super::buffer::Buffer;
use super::command::CommandPool;

bitflags! {
    /// Which attributes each interleaved vertex carries, in this order
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VertexAttributes: u32 {
        const POSITIONS = 1;
        const NORMALS = 2;
        const TEX_COORDS = 4;
    }
}

impl VertexAttributes {
    /// (flag, component count, format) in vertex order
    const LAYOUT: [(VertexAttributes, u32, vk::Format); 3] = [
        (VertexAttributes::POSITIONS, 3, vk::Format::R32G32B32_SFLOAT),
        (VertexAttributes::NORMALS, 3, vk::Format::R32G32B32_SFLOAT),
        (VertexAttributes::TEX_COORDS, 2, vk::Format::R32G32_SFLOAT),
    ];

    /// Bytes per vertex
    pub fn stride(self) -> u32 {
        Self::LAYOUT
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .map(|(_, components, _)| components * 4)
            .sum()
    }

    /// Binding 0 plus one attribute per flag at sequential locations
    pub fn description(self) -> MeshDescription {
        let binding = vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        };

        let mut offset = 0;
        let attributes = Self::LAYOUT
            .iter()
            .filter(|(flag, _, _)| self.contains(*flag))
            .enumerate()
            .map(|(location, &(_, components, format))| {
                let attribute = vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format,
                    offset,
                };
                offset += components * 4;
                attribute
            })
            .collect();

        MeshDescription {
            bindings: vec![binding],
            attributes,
        }
    }
}

/// Vertex input state for a pipeline drawing a mesh
#[derive(Debug, Clone)]
pub struct MeshDescription {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

/// CPU-side mesh as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub attributes: VertexAttributes,
    pub vertex_count: u32,
    pub vertices: Vec<u8>,
    pub element_count: u32,
    pub element_size: u32,
    pub elements: Vec<u8>,
    pub bounds: Option<Bounds>,
}

impl MeshData {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Unable to read file: {}", path.display()))?;
        Self::parse(&bytes).with_context(|| format!("Invalid mesh file: {}", path.display()))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes };

        let raw_attributes = reader.u32().context("Missing vertex attributes")?;
        let attributes = VertexAttributes::from_bits(raw_attributes)
            .with_context(|| format!("Unknown vertex attributes: {raw_attributes:#x}"))?;
        if attributes.is_empty() {
            anyhow::bail!("Mesh has no vertex attributes");
        }

        let vertex_count = reader.u32().context("Missing vertex count")?;
        let vertex_bytes = reader.u32().context("Missing vertex buffer size")?;
        let vertices = reader.take(vertex_bytes as usize).context("Truncated vertex buffer")?;

        let element_count = reader.u32().context("Missing element count")?;
        let element_size = reader.u32().context("Missing element size")?;
        index_type(element_size)?;
        let element_bytes = reader.u32().context("Missing element buffer size")?;
        let elements = reader.take(element_bytes as usize).context("Truncated element buffer")?;

        if (vertex_count as u64) * (attributes.stride() as u64) > vertex_bytes as u64 {
            anyhow::bail!("Vertex buffer too small for {vertex_count} vertices");
        }
        if (element_count as u64) * (element_size as u64) > element_bytes as u64 {
            anyhow::bail!("Element buffer too small for {element_count} elements");
        }

        let bounds = if reader.bytes.is_empty() {
            None
        } else {
            let mut v = [0.0f32; 6];
            for value in &mut v {
                *value = reader.f32().context("Truncated bounds")?;
            }
            Some(Bounds {
                min: Vec3::new(v[0], v[1], v[2]),
                max: Vec3::new(v[3], v[4], v[5]),
            })
        };

        Ok(Self {
            attributes,
            vertex_count,
            vertices: vertices.to_vec(),
            element_count,
            element_size,
            elements: elements.to_vec(),
            bounds,
        })
    }

    /// Unit quad in the XY plane facing +Z, with normals and texture coordinates
    pub fn quad() -> Self {
        #[rustfmt::skip]
        let vertices: [f32; 32] = [
            // position          normal           uv
            -0.5, -0.5, 0.0,     0.0, 0.0, 1.0,   1.0, 0.0,
             0.5, -0.5, 0.0,     0.0, 0.0, 1.0,   0.0, 0.0,
             0.5,  0.5, 0.0,     0.0, 0.0, 1.0,   0.0, 1.0,
            -0.5,  0.5, 0.0,     0.0, 0.0, 1.0,   1.0, 1.0,
        ];
        let indices: [u16; 6] = [0, 1, 2, 2, 3, 0];

        Self {
            attributes: VertexAttributes::all(),
            vertex_count: 4,
            vertices: bytemuck::cast_slice(&vertices).to_vec(),
            element_count: indices.len() as u32,
            element_size: 2,
            elements: bytemuck::cast_slice(&indices).to_vec(),
            bounds: Some(Bounds {
                min: Vec3::new(-0.5, -0.5, 0.0),
                max: Vec3::new(0.5, 0.5, 0.0),
            }),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn f32(&mut self) -> Option<f32> {
        self.take(4)?.try_into().ok().map(f32::from_le_bytes)
    }
}

/// Index type matching an element size in bytes
pub fn index_type(element_size: u32) -> Result<vk::IndexType> {
    match element_size {
        2 => Ok(vk::IndexType::UINT16),
        4 => Ok(vk::IndexType::UINT32),
        _ => anyhow::bail!("Unsupported element size: {element_size}"),
    }
}

/// Mesh uploaded into device-local vertex and index buffers
pub struct Mesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub attributes: VertexAttributes,
    pub vertex_count: u32,
    pub element_count: u32,
    pub element_size: u32,
    pub bounds: Option<Bounds>,
}

impl Mesh {
    pub fn new(pool: &CommandPool, data: &MeshData, name: &str) -> Result<Self> {
        let vertex_buffer = Buffer::device_local_with_data(
            pool,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &data.vertices,
            &format!("{name} vertices"),
        )?;
        let index_buffer = Buffer::device_local_with_data(
            pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &data.elements,
            &format!("{name} indices"),
        )?;

        log::info!(
            "Loaded mesh {}: {} vertices, {} elements",
            name,
            data.vertex_count,
            data.element_count
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            attributes: data.attributes,
            vertex_count: data.vertex_count,
            element_count: data.element_count,
            element_size: data.element_size,
            bounds: data.bounds,
        })
    }

    pub fn vertex_size(&self) -> u32 {
        self.attributes.stride()
    }

    pub fn description(&self) -> MeshDescription {
        self.attributes.description()
    }

    pub fn index_type(&self) -> Result<vk::IndexType> {
        index_type(self.element_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(data: &MeshData) -> Vec<u8> {
        let mut out = Vec::new();
        let mut put = |value: u32| out.extend_from_slice(&value.to_le_bytes());
        put(data.attributes.bits());
        put(data.vertex_count);
        put(data.vertices.len() as u32);
        out.extend_from_slice(&data.vertices);
        out.extend_from_slice(&data.element_count.to_le_bytes());
        out.extend_from_slice(&data.element_size.to_le_bytes());
        out.extend_from_slice(&(data.elements.len() as u32).to_le_bytes());
        out.extend_from_slice(&data.elements);
        if let Some(bounds) = data.bounds {
            for v in bounds.min.to_array().into_iter().chain(bounds.max.to_array()) {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    #[test]
    fn stride_counts_enabled_attributes() {
        assert_eq!(VertexAttributes::POSITIONS.stride(), 12);
        assert_eq!((VertexAttributes::POSITIONS | VertexAttributes::TEX_COORDS).stride(), 20);
        assert_eq!(VertexAttributes::all().stride(), 32);
    }

    #[test]
    fn description_uses_sequential_locations() {
        let desc = (VertexAttributes::POSITIONS | VertexAttributes::TEX_COORDS).description();
        assert_eq!(desc.bindings[0].stride, 20);
        assert_eq!(desc.attributes.len(), 2);
        assert_eq!(desc.attributes[0].location, 0);
        assert_eq!(desc.attributes[0].offset, 0);
        assert_eq!(desc.attributes[1].location, 1);
        assert_eq!(desc.attributes[1].offset, 12);
        assert_eq!(desc.attributes[1].format, vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn parses_quad_with_bounds() {
        let quad = MeshData::quad();
        let parsed = MeshData::parse(&encode(&quad)).unwrap();
        assert_eq!(parsed, quad);
        assert_eq!(parsed.bounds.map(|b| b.max), Some(Vec3::new(0.5, 0.5, 0.0)));
    }

    #[test]
    fn bounds_are_optional() {
        let mut quad = MeshData::quad();
        quad.bounds = None;
        let parsed = MeshData::parse(&encode(&quad)).unwrap();
        assert!(parsed.bounds.is_none());
        assert_eq!(parsed.element_count, 6);
    }

    #[test]
    fn truncated_files_fail() {
        let bytes = encode(&MeshData::quad());
        assert!(MeshData::parse(&bytes[..10]).is_err());
        assert!(MeshData::parse(&bytes[..bytes.len() - 3]).is_err());
        assert!(MeshData::parse(&[]).is_err());
    }

    #[test]
    fn rejects_bad_element_sizes_and_counts() {
        let mut quad = MeshData::quad();
        quad.element_size = 3;
        assert!(MeshData::parse(&encode(&quad)).is_err());

        let mut quad = MeshData::quad();
        quad.vertex_count = 5;
        assert!(MeshData::parse(&encode(&quad)).is_err());
    }

    #[test]
    fn index_type_from_element_size() {
        assert_eq!(index_type(2).unwrap(), vk::IndexType::UINT16);
        assert_eq!(index_type(4).unwrap(), vk::IndexType::UINT32);
        assert!(index_type(1).is_err());
    }
}
