// Graphics pipeline creation and management
//
// BindingLayout is the resource-binding contract between the frame loop and
// the shaders (what D3D calls a root signature):
//   slot 0 - descriptor table: one sampled texture + one immutable point
//            sampler, both visible to the pixel stage
//   slot 1 - 16 bytes of push constants, visible to all graphics stages
//
// GraphicsPipeline bakes the shaders and fixed-function state against it.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::shader::{create_shader_module, CompiledShader};
use super::VulkanDevice;
use crate::frame::FrameConstants;
use crate::geometry::Vertex;

pub const TEXTURE_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

/// Push constants are visible to every stage.
pub const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::ALL_GRAPHICS;

pub struct BindingLayout {
    pub pipeline_layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub sampler: vk::Sampler,
    /// The one descriptor table, filled by `write_texture`.
    pub texture_table: vk::DescriptorSet,
    descriptor_pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl BindingLayout {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let sampler = unsafe { device.device.create_sampler(&point_sampler_info(), None) }
            .context("Failed to create static sampler")?;

        let mut layout = Self {
            pipeline_layout: vk::PipelineLayout::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            sampler,
            texture_table: vk::DescriptorSet::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            device,
        };

        let immutable_samplers = [sampler];
        let bindings = texture_table_bindings(&immutable_samplers);

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        layout.set_layout = unsafe {
            layout
                .device
                .device
                .create_descriptor_set_layout(&set_layout_info, None)
        }
        .context("Failed to create descriptor set layout")?;

        let set_layouts = [layout.set_layout];
        let push_constant_ranges = [push_constant_range()];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        layout.pipeline_layout = unsafe {
            layout.device.device.create_pipeline_layout(&layout_info, None)
        }
        .context("Failed to create pipeline layout")?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        layout.descriptor_pool = unsafe {
            layout.device.device.create_descriptor_pool(&pool_info, None)
        }
        .context("Failed to create descriptor pool")?;

        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(layout.descriptor_pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { layout.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate texture table")?;
        layout.texture_table = sets.into_iter().next().context("No descriptor set allocated")?;

        Ok(layout)
    }

    /// Point the texture table at `view`, which must be in shader-read layout
    /// whenever the table is used.
    pub fn write_texture(&self, view: vk::ImageView) {
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.texture_table)
            .dst_binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
    }
}

/// Nearest filtering, repeat on every axis.
fn point_sampler_info() -> vk::SamplerCreateInfo {
    vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(0.0)
        .build()
}

/// Slot 0 of the binding layout. The returned sampler binding points into
/// `immutable_samplers`, which has to outlive the set layout creation.
fn texture_table_bindings(
    immutable_samplers: &[vk::Sampler],
) -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .immutable_samplers(immutable_samplers)
            .build(),
    ]
}

fn push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: PUSH_CONSTANT_STAGES,
        offset: 0,
        size: size_of::<FrameConstants>() as u32,
    }
}

/// Vertex input description for `Vertex` (position + uv + color)
pub fn vertex_input_description() -> (
    vk::VertexInputBindingDescription,
    [vk::VertexInputAttributeDescription; 3],
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };

    let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };

    let attributes = [
        attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, position)),
        attribute(1, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
        attribute(2, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Vertex, color)),
    ];

    (binding, attributes)
}

/// Standard "over" blending on color and alpha alike.
fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Solid fill, no culling
fn rasterization_state() -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

fn multisample_state() -> vk::PipelineMultisampleStateCreateInfo {
    vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .build()
}

/// No depth buffer is bound, so every test is off.
fn depth_stencil_state() -> vk::PipelineDepthStencilStateCreateInfo {
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .build()
}

/// One render target: blend state and attachment format line up by index.
fn color_targets(
    color_format: vk::Format,
) -> ([vk::PipelineColorBlendAttachmentState; 1], [vk::Format; 1]) {
    ([alpha_blend_attachment()], [color_format])
}

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    device: Arc<VulkanDevice>,
}

impl GraphicsPipeline {
    /// Build the triangle pipeline. Viewport, scissor and topology are set
    /// while recording.
    pub fn new(
        device: Arc<VulkanDevice>,
        layout: &BindingLayout,
        color_format: vk::Format,
        vertex_shader: &CompiledShader,
        pixel_shader: &CompiledShader,
    ) -> Result<Self> {
        let vert_module = create_shader_module(&device, vertex_shader)?;
        let frag_module = match create_shader_module(&device, pixel_shader) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        let result = Self::build(&device, layout, color_format, [
            (vertex_shader, vert_module),
            (pixel_shader, frag_module),
        ]);

        // Modules are only needed during pipeline creation
        unsafe {
            device.device.destroy_shader_module(vert_module, None);
            device.device.destroy_shader_module(frag_module, None);
        }

        Ok(Self {
            pipeline: result?,
            device,
        })
    }

    fn build(
        device: &VulkanDevice,
        layout: &BindingLayout,
        color_format: vk::Format,
        shaders: [(&CompiledShader, vk::ShaderModule); 2],
    ) -> Result<vk::Pipeline> {
        // Shader stages
        let entry_points = shaders
            .iter()
            .map(|(shader, _)| CString::new(shader.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let shader_stages: Vec<_> = shaders
            .iter()
            .zip(&entry_points)
            .map(|((shader, module), name)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage.vk_flags())
                    .module(*module)
                    .name(name)
                    .build()
            })
            .collect();

        // Vertex input
        let (binding, attributes) = vertex_input_description();
        let bindings = [binding];
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Topology class is fixed here; the exact topology is dynamic
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = rasterization_state();
        let multisampling = multisample_state();
        let depth_stencil = depth_stencil_state();

        let (color_blend_attachments, color_formats) = color_targets(color_format);
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::PRIMITIVE_TOPOLOGY,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // No render pass; the attachment format goes in here
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.pipeline_layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };

        pipelines
            .into_iter()
            .next()
            .context("Driver returned no pipeline")
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_attributes_match_vertex_struct() {
        let (binding, attributes) = vertex_input_description();
        assert_eq!(binding.stride, 32);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);

        let summary: Vec<_> = attributes
            .iter()
            .map(|a| (a.location, a.format, a.offset))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, vk::Format::R32G32_SFLOAT, 0),
                (1, vk::Format::R32G32_SFLOAT, 8),
                (2, vk::Format::R32G32B32A32_SFLOAT, 16),
            ]
        );
    }

    #[test]
    fn blend_is_source_over_on_all_channels() {
        let blend = alpha_blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(blend.src_alpha_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_alpha_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn rasterizer_fills_solid_without_culling() {
        let raster = rasterization_state();
        assert_eq!(raster.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(raster.rasterizer_discard_enable, vk::FALSE);
        assert_eq!(raster.depth_bias_enable, vk::FALSE);
        assert_eq!(raster.line_width, 1.0);

        let multisample = multisample_state();
        assert_eq!(multisample.rasterization_samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn depth_and_stencil_are_off() {
        let depth = depth_stencil_state();
        assert_eq!(depth.depth_test_enable, vk::FALSE);
        assert_eq!(depth.depth_write_enable, vk::FALSE);
        assert_eq!(depth.depth_bounds_test_enable, vk::FALSE);
        assert_eq!(depth.stencil_test_enable, vk::FALSE);
    }

    #[test]
    fn exactly_one_color_target_in_the_back_buffer_format() {
        let (blends, formats) = color_targets(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(blends.len(), 1);
        assert_eq!(formats, [vk::Format::B8G8R8A8_UNORM]);
        assert_eq!(blends[0].blend_enable, vk::TRUE);
    }

    #[test]
    fn texture_table_is_one_texture_and_one_fixed_sampler() {
        let samplers = [vk::Sampler::null()];
        let [texture, sampler] = texture_table_bindings(&samplers);

        assert_eq!(texture.binding, TEXTURE_BINDING);
        assert_eq!(texture.descriptor_type, vk::DescriptorType::SAMPLED_IMAGE);
        assert_eq!(texture.descriptor_count, 1);
        assert_eq!(texture.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert!(texture.p_immutable_samplers.is_null());

        assert_eq!(sampler.binding, SAMPLER_BINDING);
        assert_eq!(sampler.descriptor_type, vk::DescriptorType::SAMPLER);
        assert_eq!(sampler.descriptor_count, 1);
        assert_eq!(sampler.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(sampler.p_immutable_samplers, samplers.as_ptr());
    }

    #[test]
    fn push_constants_hold_four_floats_for_every_stage() {
        let range = push_constant_range();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 16);
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::VERTEX));
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn sampler_is_point_and_wraps() {
        let info = point_sampler_info();
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.min_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::REPEAT);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::REPEAT);
    }
}
