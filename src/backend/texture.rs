// Textures - decoded pixels and their upload into sampled images

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::buffer::Buffer;
use super::command::CommandPool;
use super::image::{mip_level_count, Image, ImageDesc};

/// Tightly packed RGBA8 pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// Decode any supported image file into RGBA8
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = ::image::open(path)
            .with_context(|| format!("Failed to load texture image: {}", path.display()))?
            .into_rgba8();

        Ok(Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }

    /// Two-tone checkerboard, `cell` pixels per square
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        const LIGHT: [u8; 4] = [230, 230, 230, 255];
        const DARK: [u8; 4] = [60, 60, 60, 255];

        let cell = cell.max(1);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x, y)))
            .flat_map(|(x, y)| if (x / cell + y / cell) % 2 == 0 { LIGHT } else { DARK })
            .collect();

        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        mip_level_count(self.width, self.height)
    }
}

/// Upload `data` into a sampled, mipmapped R8G8B8A8_UNORM image with a view
pub fn create_texture(pool: &CommandPool, data: &TextureData, name: &str) -> Result<Image> {
    let expected = data.width as usize * data.height as usize * 4;
    if data.pixels.len() != expected {
        anyhow::bail!(
            "Texture {name} has {} bytes of pixels, expected {expected}",
            data.pixels.len()
        );
    }

    let device = pool.device().clone();

    let staging = Buffer::with_data(
        device.clone(),
        vk::BufferUsageFlags::TRANSFER_SRC,
        &data.pixels,
        &format!("{name} (staging)"),
    )?;

    let mip_levels = data.mip_levels();
    let desc = ImageDesc::new(
        vk::Extent2D {
            width: data.width,
            height: data.height,
        },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED,
    )
    .mip_levels(mip_levels);

    let mut image = Image::new(device, desc, name)?;

    image.transition_layout(
        pool,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )?;
    image.load_buffer_data(pool, &staging)?;

    if mip_levels > 1 {
        image.generate_mipmaps(pool)?;
    } else {
        image.transition_layout(
            pool,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
    }

    image.create_view(vk::ImageAspectFlags::COLOR)?;

    log::info!(
        "Loaded texture {}: {}x{}, {} mip levels",
        name,
        data.width,
        data.height,
        mip_levels
    );

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates_cells() {
        let data = TextureData::checkerboard(4, 2);
        assert_eq!(data.pixels.len(), 4 * 4 * 4);

        let pixel = |x: usize, y: usize| &data.pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(pixel(0, 0), pixel(1, 1));
        assert_ne!(pixel(0, 0), pixel(2, 0));
        assert_ne!(pixel(0, 0), pixel(0, 2));
        assert_eq!(pixel(0, 0), pixel(3, 3));
        assert_eq!(data.mip_levels(), 3);
    }

    #[test]
    fn loads_png_as_rgba() {
        let path = std::env::temp_dir().join(format!("vkdev-texture-{}.png", std::process::id()));
        let mut rgb = ::image::RgbImage::new(3, 2);
        rgb.put_pixel(2, 1, ::image::Rgb([10, 20, 30]));
        rgb.save(&path).unwrap();

        let data = TextureData::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((data.width, data.height), (3, 2));
        assert_eq!(data.pixels.len(), 3 * 2 * 4);
        // Last pixel, alpha filled in
        assert_eq!(&data.pixels[5 * 4..], &[10, 20, 30, 255]);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TextureData::load("does/not/exist.png").unwrap_err();
        assert!(format!("{err}").contains("does/not/exist.png"));
    }
}
