// Synchronization primitives
//
// GpuFence: a timeline semaphore, i.e. a 64-bit counter the queue bumps when
// work completes and the CPU can read or block on.
// PresentSync: binary semaphores ordering acquire -> render -> present.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::vk_error;

pub struct GpuFence {
    pub semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl GpuFence {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None) }
            .context("Failed to create fence")?;

        Ok(Self { semaphore, device })
    }

    /// Have the queue set the counter to `value` once all prior work is done.
    pub fn signal(&self, queue: vk::Queue, value: u64) -> Result<()> {
        let values = [value];
        let semaphores = [self.semaphore];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
        }
        .map_err(vk_error)
        .context("Failed to signal fence")
    }

    pub fn completed_value(&self) -> Result<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(self.semaphore) }
            .map_err(vk_error)
            .context("Failed to read fence value")
    }

    /// Block the calling thread until the counter reaches `value`.
    pub fn wait(&self, value: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX) }
            .map_err(vk_error)
            .context("Failed to wait for fence")
    }
}

impl Drop for GpuFence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Acquire/present ordering. `render_finished` has one semaphore per back
/// buffer so a semaphore is never re-signaled while a present may still be
/// waiting on it.
pub struct PresentSync {
    pub image_available: vk::Semaphore,
    pub render_finished: Vec<vk::Semaphore>,
    device: Arc<VulkanDevice>,
}

impl PresentSync {
    pub fn new(device: Arc<VulkanDevice>, back_buffers: usize) -> Result<Self> {
        let image_available = create_binary_semaphore(&device)?;
        let mut sync = Self {
            image_available,
            render_finished: Vec::with_capacity(back_buffers),
            device,
        };
        for _ in 0..back_buffers {
            let semaphore = create_binary_semaphore(&sync.device)?;
            sync.render_finished.push(semaphore);
        }
        Ok(sync)
    }
}

impl Drop for PresentSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            for &semaphore in &self.render_finished {
                self.device.device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

fn create_binary_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.device.create_semaphore(&create_info, None) }
        .context("Failed to create semaphore")
}
