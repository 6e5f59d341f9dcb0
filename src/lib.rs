//! vkdev - thin RAII layer over Vulkan and a textured mesh demo built on it

pub mod backend;
pub mod config;
pub mod hot_reload;
pub mod renderer;

pub use config::Config;
pub use renderer::Renderer;
