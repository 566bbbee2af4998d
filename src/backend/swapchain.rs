// Swapchain - Window presentation
//
// Owns the chain of back buffers and one render-target view per buffer.
// The chain is built lazily: `new` creates nothing, and the first `resize`
// builds it from scratch. Every later `resize` drops all views before the
// chain is replaced, since the chain must not be rebuilt while views still
// reference its images.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::vk_error;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    back_buffer_count: u32,
    present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

/// Result of asking the chain for the next back buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Image(u32),
    OutOfDate,
}

impl Swapchain {
    /// Pick format and present mode; no images exist until the first resize.
    pub fn new(
        device: Arc<VulkanDevice>,
        back_buffer_count: u32,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        // Query supported formats
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        let surface_format = choose_surface_format(&formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);

        log::info!("Swapchain format: {:?}", surface_format.format);
        log::info!("Present mode: {:?}", present_mode);

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        Ok(Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent: vk::Extent2D::default(),
            back_buffer_count,
            present_mode,
            device,
        })
    }

    /// Rebuild the chain at a new size. Returns the extent the chain
    /// actually got, which the surface may dictate. A surface reporting a
    /// zero size keeps the current chain and its extent.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<vk::Extent2D> {
        let device = self.device.clone();

        let surface_caps = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
        }?;

        let extent = choose_extent(&surface_caps, width, height);
        if is_zero_extent(extent) {
            log::debug!("Surface is {}x{}, keeping current swapchain", extent.width, extent.height);
            return Ok(self.extent);
        }

        // Nothing may still reference the old images
        device.wait_idle()?;
        self.destroy_views();

        let image_count = choose_image_count(&surface_caps, self.back_buffer_count);

        log::info!(
            "Resizing swapchain: {}x{} with {} buffers",
            extent.width,
            extent.height,
            image_count
        );

        let old_swapchain = self.swapchain;

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(self.format)
            .image_color_space(self.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(choose_composite_alpha(surface_caps.supported_composite_alpha))
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(vk_error)
            .context("Failed to create swapchain")?;

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.extent = extent;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }?;

        // One render-target view per back buffer
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .context("Failed to create render target view")?;
            self.image_views.push(view);
        }

        log::info!("Created swapchain with {} images", self.images.len());

        Ok(extent)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireResult> {
        // No chain yet because the surface had no area; ask for another resize
        if self.swapchain == vk::SwapchainKHR::null() {
            return Ok(AcquireResult::OutOfDate);
        }

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            // Suboptimal still hands out an image; present will report it
            Ok((index, _suboptimal)) => Ok(AcquireResult::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(vk_error(e)).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen. Returns true if the chain should
    /// be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(vk_error(e)).context("Failed to present"),
        }
    }

    fn destroy_views(&mut self) {
        for view in self.image_views.drain(..) {
            unsafe { self.device.device.destroy_image_view(view, None) };
        }
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy_views();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        }
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Plain UNORM RGBA/BGRA, the same encoding the checkerboard uses.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            matches!(f.format, vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// FIFO is always supported, so it is the fallback.
fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Opaque if the surface allows it, else the first mode it does support.
fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// The configured count, within what the surface allows.
/// `max_image_count == 0` means no upper limit.
fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}
