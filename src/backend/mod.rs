// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash: each type owns one native object and
// destroys it on drop. Objects hold an `Arc` to what they were created
// from, so teardown order follows the dependency graph.

pub mod assets;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod mesh;
pub mod pipeline;
pub mod queue;
pub mod render_command;
pub mod render_target;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use assets::{Assets, Material};
pub use buffer::Buffer;
pub use command::CommandPool;
pub use descriptor::Descriptor;
pub use device::Device;
pub use image::Image;
pub use instance::Instance;
pub use mesh::{Mesh, MeshData};
pub use pipeline::Pipeline;
pub use render_command::RenderCommand;
pub use render_target::SwapchainRenderTarget;
pub use shader::Shader;
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use sync::{FrameCycle, FrameSync, ImagesInFlight};
pub use texture::TextureData;
