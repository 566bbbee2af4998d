// Vulkan side of the frame loop
//
// VulkanRenderer owns every GPU object the triangle needs and implements
// `FrameBackend`, translating the loop's commands into a single primary
// command buffer. Resource states map onto barriers + image layouts:
//
//   Present              UNDEFINED as a source (contents are cleared anyway),
//                        PRESENT_SRC_KHR as a destination
//   CopyDest             TRANSFER_DST_OPTIMAL
//   VertexBuffer         vertex attribute reads
//   PixelShaderResource  SHADER_READ_ONLY_OPTIMAL, fragment sampling
//   RenderTarget         COLOR_ATTACHMENT_OPTIMAL

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline::{BindingLayout, GraphicsPipeline, PUSH_CONSTANT_STAGES};
use super::shader::{ShaderSource, ShaderStage};
use super::swapchain::{color_subresource_range, AcquireResult, Swapchain};
use super::sync::{GpuFence, PresentSync};
use super::upload::UploadResources;
use super::VulkanDevice;
use crate::config::{Config, ShaderConfig};
use crate::error::vk_error;
use crate::frame::{
    Acquired, CommandRecorder, FrameBackend, FrameConstants, PresentStatus, Resource,
    ResourceState, ScissorRect, Topology, Viewport, CONSTANTS_SLOT,
};

/// Stage, access and layout a resource is in for a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateAccess {
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
}

/// `as_source` picks the "before" half of a transition.
fn state_access(state: ResourceState, as_source: bool) -> StateAccess {
    match state {
        ResourceState::Present if as_source => StateAccess {
            // Chains with the acquire semaphore wait
            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        },
        ResourceState::Present => StateAccess {
            stage: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
        },
        ResourceState::CopyDest => StateAccess {
            stage: vk::PipelineStageFlags2::COPY,
            access: vk::AccessFlags2::TRANSFER_WRITE,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        },
        ResourceState::VertexBuffer => StateAccess {
            stage: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            layout: vk::ImageLayout::UNDEFINED,
        },
        ResourceState::PixelShaderResource => StateAccess {
            stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
        ResourceState::RenderTarget => StateAccess {
            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        },
    }
}

fn vk_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

/// Field order is drop order: everything below `device` holds a clone of it.
fn render_target_view(views: &[vk::ImageView], back_buffer: u32) -> Result<vk::ImageView> {
    views
        .get(back_buffer as usize)
        .copied()
        .with_context(|| format!("No render target view for back buffer {}", back_buffer))
}

/// Open render target while recording. A failed begin is kept so the matching
/// end is skipped and `end` returns the error.
#[derive(Debug, Default)]
struct RenderScope {
    active: bool,
    error: Option<anyhow::Error>,
}

impl RenderScope {
    fn open(&mut self, view: Result<vk::ImageView>) -> Option<vk::ImageView> {
        match view {
            Ok(view) => {
                self.active = true;
                Some(view)
            }
            Err(e) => {
                self.error.get_or_insert(e);
                None
            }
        }
    }

    /// True if a render target was opened and now has to be closed.
    fn close(&mut self) -> bool {
        std::mem::take(&mut self.active)
    }

    fn finish(&mut self) -> Result<()> {
        self.active = false;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct VulkanRenderer {
    present_sync: PresentSync,
    fence: GpuFence,
    pipeline: GraphicsPipeline,
    bindings: BindingLayout,
    upload: UploadResources,
    swapchain: Swapchain,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    /// Back buffer handed out by the last acquire, consumed by present.
    acquired: Option<u32>,
    render_scope: RenderScope,

    shaders: ShaderConfig,
    shader_path: std::path::PathBuf,
    device: Arc<VulkanDevice>,
}

impl VulkanRenderer {
    pub fn new(device: Arc<VulkanDevice>, config: &Config) -> Result<Self> {
        let back_buffers = config.back_buffer_count();
        let swapchain = Swapchain::new(device.clone(), back_buffers, config.get_present_mode())?;

        let bindings = BindingLayout::new(device.clone())?;

        let shader_path = config.shader_path();
        let pipeline = build_pipeline(&device, &bindings, swapchain.format, &shader_path, &config.shaders)?;

        let upload = UploadResources::new(&device)?;
        bindings.write_texture(upload.texture.view);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // TRANSIENT: the one buffer is re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to allocate command buffer");
            }
        };

        let fence = GpuFence::new(device.clone())?;
        let present_sync = PresentSync::new(device.clone(), back_buffers as usize)?;

        log::info!("Renderer ready ({} back buffers requested)", back_buffers);

        Ok(Self {
            present_sync,
            fence,
            pipeline,
            bindings,
            upload,
            swapchain,
            command_pool,
            command_buffer,
            acquired: None,
            render_scope: RenderScope::default(),
            shaders: config.shaders.clone(),
            shader_path,
            device,
        })
    }

    /// Recompile the shaders and swap the pipeline in. On failure the old
    /// pipeline stays bound.
    pub fn reload_shaders(&mut self) -> Result<()> {
        let pipeline = build_pipeline(
            &self.device,
            &self.bindings,
            self.swapchain.format,
            &self.shader_path,
            &self.shaders,
        )?;

        self.device.wait_idle()?;
        self.pipeline = pipeline;
        log::info!("Shaders reloaded from {:?}", self.shader_path);
        Ok(())
    }

    pub fn shader_path(&self) -> &std::path::Path {
        &self.shader_path
    }

    fn image_barrier(
        &self,
        image: vk::Image,
        before: StateAccess,
        after: StateAccess,
    ) -> vk::ImageMemoryBarrier2 {
        vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(before.stage)
            .src_access_mask(before.access)
            .dst_stage_mask(after.stage)
            .dst_access_mask(after.access)
            .old_layout(before.layout)
            .new_layout(after.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .build()
    }

    fn pipeline_image_barrier(&self, barrier: vk::ImageMemoryBarrier2) {
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        unsafe {
            self.device
                .device
                .cmd_pipeline_barrier2(self.command_buffer, &dependency)
        };
    }
}

fn build_pipeline(
    device: &Arc<VulkanDevice>,
    bindings: &BindingLayout,
    color_format: vk::Format,
    path: &std::path::Path,
    shaders: &ShaderConfig,
) -> Result<GraphicsPipeline> {
    let source = ShaderSource::load(path)?;
    let vertex = source.compile(&shaders.vertex_entry, ShaderStage::Vertex)?;
    let pixel = source.compile(&shaders.pixel_entry, ShaderStage::Pixel)?;
    GraphicsPipeline::new(device.clone(), bindings, color_format, &vertex, &pixel)
}

impl CommandRecorder for VulkanRenderer {
    fn begin(&mut self) -> Result<()> {
        self.render_scope = RenderScope::default();
        let device = &self.device.device;
        unsafe {
            // The previous frame has been waited on, so the pool is idle
            device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(vk_error)?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(vk_error)?;
        }
        Ok(())
    }

    fn copy_upload_data(&mut self) {
        let upload = &self.upload;
        let cmd = self.command_buffer;

        // Fresh image: nothing to preserve
        let undefined = StateAccess {
            stage: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        };
        let barrier = self.image_barrier(
            upload.texture.image,
            undefined,
            state_access(ResourceState::CopyDest, false),
        );
        self.pipeline_image_barrier(barrier);

        unsafe {
            self.device.device.cmd_copy_buffer(
                cmd,
                upload.staging.buffer,
                upload.vertex_buffer.buffer,
                &[upload.layout.vertex_copy_region()],
            );
            self.device.device.cmd_copy_buffer_to_image(
                cmd,
                upload.staging.buffer,
                upload.texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[upload.layout.texture_copy_region()],
            );
        }
    }

    fn transition(&mut self, resource: Resource, before: ResourceState, after: ResourceState) {
        let src = state_access(before, true);
        let dst = state_access(after, false);

        match resource {
            Resource::VertexBuffer => {
                let barriers = [vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(src.stage)
                    .src_access_mask(src.access)
                    .dst_stage_mask(dst.stage)
                    .dst_access_mask(dst.access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(self.upload.vertex_buffer.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()];
                let dependency = vk::DependencyInfo::builder().buffer_memory_barriers(&barriers);
                unsafe {
                    self.device
                        .device
                        .cmd_pipeline_barrier2(self.command_buffer, &dependency)
                };
            }
            Resource::Texture => {
                let barrier = self.image_barrier(self.upload.texture.image, src, dst);
                self.pipeline_image_barrier(barrier);
            }
            Resource::BackBuffer(index) => match self.swapchain.images.get(index as usize) {
                Some(&image) => {
                    let barrier = self.image_barrier(image, src, dst);
                    self.pipeline_image_barrier(barrier);
                }
                None => log::error!("Transition of unknown back buffer {}", index),
            },
        }
    }

    fn bind_pipeline(&mut self) {
        unsafe {
            self.device.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline,
            )
        };
    }

    fn bind_texture_table(&mut self, slot: u32) {
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.bindings.pipeline_layout,
                slot,
                &[self.bindings.texture_table],
                &[],
            )
        };
    }

    fn push_constants(&mut self, slot: u32, constants: &FrameConstants) {
        debug_assert_eq!(slot, CONSTANTS_SLOT);
        unsafe {
            self.device.device.cmd_push_constants(
                self.command_buffer,
                self.bindings.pipeline_layout,
                PUSH_CONSTANT_STAGES,
                0,
                bytemuck::bytes_of(constants),
            )
        };
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let viewports = [vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        }];
        unsafe {
            self.device
                .device
                .cmd_set_viewport(self.command_buffer, 0, &viewports)
        };
    }

    fn set_scissor(&mut self, rect: ScissorRect) {
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: rect.x, y: rect.y },
            extent: vk::Extent2D {
                width: rect.width,
                height: rect.height,
            },
        }];
        unsafe {
            self.device
                .device
                .cmd_set_scissor(self.command_buffer, 0, &scissors)
        };
    }

    fn begin_render_target(&mut self, back_buffer: u32, clear_color: [f32; 4]) {
        let view = render_target_view(&self.swapchain.image_views, back_buffer);
        let Some(view) = self.render_scope.open(view) else {
            return;
        };

        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            })
            .build()];

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.swapchain.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            self.device
                .device
                .cmd_begin_rendering(self.command_buffer, &rendering_info)
        };
    }

    fn end_render_target(&mut self) {
        if self.render_scope.close() {
            unsafe { self.device.device.cmd_end_rendering(self.command_buffer) };
        }
    }

    fn set_topology(&mut self, topology: Topology) {
        unsafe {
            self.device
                .device
                .cmd_set_primitive_topology(self.command_buffer, vk_topology(topology))
        };
    }

    fn bind_vertex_buffer(&mut self) {
        unsafe {
            self.device.device.cmd_bind_vertex_buffers(
                self.command_buffer,
                0,
                &[self.upload.vertex_buffer.buffer],
                &[0],
            )
        };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .device
                .cmd_draw(self.command_buffer, vertex_count, instance_count, 0, 0)
        };
    }

    fn end(&mut self) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(self.command_buffer) }.map_err(vk_error)?;
        self.render_scope.finish()
    }
}

impl FrameBackend for VulkanRenderer {
    fn resize(&mut self, width: u32, height: u32) -> Result<(u32, u32)> {
        let extent = self.swapchain.resize(width, height)?;

        // The surface may hand out more images than requested
        let image_count = self.swapchain.image_count();
        if self.present_sync.render_finished.len() != image_count {
            self.present_sync = PresentSync::new(self.device.clone(), image_count)?;
        }
        self.acquired = None;

        Ok((extent.width, extent.height))
    }

    fn acquire_back_buffer(&mut self) -> Result<Acquired> {
        match self
            .swapchain
            .acquire_next_image(self.present_sync.image_available)?
        {
            AcquireResult::Image(index) => {
                self.acquired = Some(index);
                Ok(Acquired::Ready(index))
            }
            AcquireResult::OutOfDate => Ok(Acquired::OutOfDate),
        }
    }

    fn submit(&mut self) -> Result<()> {
        let index = self.acquired.context("Submit without an acquired back buffer")?;
        let render_finished = *self
            .present_sync
            .render_finished
            .get(index as usize)
            .context("Back buffer index out of range")?;

        let wait_semaphores = [self.present_sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )
        }
        .map_err(vk_error)
        .context("Failed to submit command list")
    }

    fn present(&mut self) -> Result<PresentStatus> {
        let index = self
            .acquired
            .take()
            .context("Present without an acquired back buffer")?;
        let wait = [self.present_sync.render_finished[index as usize]];

        let needs_resize = self
            .swapchain
            .present(self.device.graphics_queue, index, &wait)?;

        Ok(if needs_resize {
            PresentStatus::NeedsResize
        } else {
            PresentStatus::Optimal
        })
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        self.fence.signal(self.device.graphics_queue, value)
    }

    fn completed_value(&self) -> Result<u64> {
        self.fence.completed_value()
    }

    fn wait_for(&mut self, value: u64) -> Result<()> {
        self.fence.wait(value)
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");
        let _ = self.device.wait_idle();
        unsafe {
            // Also frees the command buffer
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
