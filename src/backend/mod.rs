// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every object keeps an Arc to the device so
// it can destroy itself, and the device outlives all of them.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use device::VulkanDevice;
pub use renderer::VulkanRenderer;
