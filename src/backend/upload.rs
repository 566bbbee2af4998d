// One-time upload of vertex and texture data
//
// Both payloads go into a single host-visible staging buffer:
//
//   offset 0                      vertex bytes
//   offset `texture_offset`       texel rows, each starting on a
//                                 `row_pitch` boundary
//
// The first command list copies them into the GPU-only vertex buffer and
// texture. The staging buffer stays alive afterwards; nothing reuses it.

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::{GpuBuffer, GpuImage};
use super::VulkanDevice;
use crate::error::RenderError;
use crate::geometry::{self, CHECKERS_HEIGHT, CHECKERS_WIDTH, TEXEL_SIZE};

pub const STAGING_BUFFER_SIZE: u64 = 64 * 1024;

/// Placement alignment for texture data inside an upload buffer.
pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 512;
/// Row pitch alignment for texture data inside an upload buffer.
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u64 = 256;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Where each payload lands inside the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingLayout {
    pub vertex_bytes: u64,
    pub texture_offset: u64,
    pub row_pitch: u64,
    pub texture_width: u32,
    pub texture_height: u32,
    pub total_size: u64,
}

impl StagingLayout {
    /// `placement_alignment` and `row_alignment` are raised to the fixed
    /// minimums above when the device asks for less.
    pub fn new(
        vertex_bytes: u64,
        texture_width: u32,
        texture_height: u32,
        placement_alignment: u64,
        row_alignment: u64,
    ) -> Self {
        let placement = placement_alignment.max(TEXTURE_PLACEMENT_ALIGNMENT);
        let row = row_alignment.max(TEXTURE_ROW_PITCH_ALIGNMENT);

        let texture_offset = align_up(vertex_bytes, placement);
        let row_pitch = align_up(texture_width as u64 * TEXEL_SIZE as u64, row);
        let total_size = texture_offset + row_pitch * texture_height as u64;

        Self {
            vertex_bytes,
            texture_offset,
            row_pitch,
            texture_width,
            texture_height,
            total_size,
        }
    }

    /// Layout for the triangle and the checkerboard.
    pub fn for_scene(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self::new(
            geometry::triangle_bytes().len() as u64,
            CHECKERS_WIDTH,
            CHECKERS_HEIGHT,
            limits.optimal_buffer_copy_offset_alignment,
            limits.optimal_buffer_copy_row_pitch_alignment,
        )
    }

    pub fn row_offset(&self, row: u32) -> u64 {
        self.texture_offset + self.row_pitch * row as u64
    }

    /// Copy the vertices and the texel rows into `staging`.
    pub fn write(&self, staging: &mut [u8], vertices: &[u8], texels: &[u8]) -> Result<()> {
        if self.total_size > staging.len() as u64 {
            return Err(RenderError::StagingOverflow {
                required: self.total_size,
                capacity: staging.len() as u64,
            }
            .into());
        }

        let vertex_len = self.vertex_bytes as usize;
        anyhow::ensure!(vertices.len() == vertex_len, "vertex data size mismatch");
        staging[..vertex_len].copy_from_slice(vertices);

        let row_bytes = (self.texture_width * TEXEL_SIZE) as usize;
        anyhow::ensure!(
            texels.len() == row_bytes * self.texture_height as usize,
            "texel data size mismatch"
        );
        for (row, src) in texels.chunks_exact(row_bytes).enumerate() {
            let start = self.row_offset(row as u32) as usize;
            staging[start..start + row_bytes].copy_from_slice(src);
        }

        Ok(())
    }

    /// Buffer -> image copy for the whole texture. Row length is in texels.
    pub fn texture_copy_region(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: self.texture_offset,
            buffer_row_length: (self.row_pitch / TEXEL_SIZE as u64) as u32,
            buffer_image_height: self.texture_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.texture_width,
                height: self.texture_height,
                depth: 1,
            },
        }
    }

    pub fn vertex_copy_region(&self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.vertex_bytes,
        }
    }
}

/// Staging buffer plus the GPU-local resources it fills.
pub struct UploadResources {
    pub layout: StagingLayout,
    pub staging: GpuBuffer,
    pub vertex_buffer: GpuBuffer,
    pub texture: GpuImage,
}

impl UploadResources {
    /// Create all three resources and fill the staging buffer. The copies
    /// themselves are recorded by the renderer.
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let layout = StagingLayout::for_scene(&device.properties.limits);

        let mut staging = GpuBuffer::new(
            device,
            "staging",
            STAGING_BUFFER_SIZE,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        layout.write(
            staging.mapped_bytes_mut()?,
            geometry::triangle_bytes(),
            bytemuck::cast_slice(&geometry::CHECKERS),
        )?;

        let vertex_buffer = GpuBuffer::new(
            device,
            "vertex buffer",
            layout.vertex_bytes,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::GpuOnly,
        )?;

        let texture = GpuImage::new(
            device,
            "checkers",
            vk::Extent2D {
                width: CHECKERS_WIDTH,
                height: CHECKERS_HEIGHT,
            },
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        log::debug!(
            "Staged {} vertex bytes and {}x{} texels (texture at +{}, pitch {})",
            layout.vertex_bytes,
            layout.texture_width,
            layout.texture_height,
            layout.texture_offset,
            layout.row_pitch
        );

        Ok(Self {
            layout,
            staging,
            vertex_buffer,
            texture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_layout() -> StagingLayout {
        StagingLayout::new(96, CHECKERS_WIDTH, CHECKERS_HEIGHT, 1, 1)
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(96, 512), 512);
    }

    #[test]
    fn texture_follows_vertices_at_placement_alignment() {
        let layout = scene_layout();
        assert_eq!(layout.vertex_bytes, 96);
        assert_eq!(layout.texture_offset, 512);
        assert_eq!(layout.row_pitch, 256);
        assert_eq!(layout.row_offset(0), 512);
        assert_eq!(layout.row_offset(1), 768);
        assert_eq!(layout.total_size, 1024);
        assert!(layout.total_size <= STAGING_BUFFER_SIZE);
    }

    #[test]
    fn device_alignment_wins_when_larger() {
        let layout = StagingLayout::new(96, 2, 2, 1024, 512);
        assert_eq!(layout.texture_offset, 1024);
        assert_eq!(layout.row_pitch, 512);
    }

    #[test]
    fn wide_rows_round_pitch_up() {
        // 100 texels = 400 bytes -> 512
        let layout = StagingLayout::new(96, 100, 3, 1, 1);
        assert_eq!(layout.row_pitch, 512);
        for row in 0..3 {
            assert_eq!(layout.row_offset(row) % TEXTURE_ROW_PITCH_ALIGNMENT, 0);
        }
    }

    #[test]
    fn write_places_vertices_and_rows() {
        let layout = scene_layout();
        let mut staging = vec![0u8; STAGING_BUFFER_SIZE as usize];
        let texels: &[u8] = bytemuck::cast_slice(&geometry::CHECKERS);

        layout
            .write(&mut staging, geometry::triangle_bytes(), texels)
            .unwrap();

        assert_eq!(&staging[..96], geometry::triangle_bytes());
        assert_eq!(&staging[512..520], &texels[..8]);
        assert_eq!(&staging[768..776], &texels[8..16]);
        // Padding between rows stays untouched
        assert!(staging[520..768].iter().all(|&b| b == 0));

        // Alpha byte of the first texel
        assert_eq!(staging[512 + 3], 0x20);
    }

    #[test]
    fn overflow_is_an_error() {
        let layout = scene_layout();
        let mut staging = vec![0u8; 600];
        let texels: &[u8] = bytemuck::cast_slice(&geometry::CHECKERS);

        let err = layout
            .write(&mut staging, geometry::triangle_bytes(), texels)
            .unwrap_err();
        match err.downcast_ref::<RenderError>() {
            Some(RenderError::StagingOverflow { required, capacity }) => {
                assert_eq!((*required, *capacity), (1024, 600));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn copy_regions_describe_the_layout() {
        let layout = scene_layout();
        let region = layout.texture_copy_region();
        assert_eq!(region.buffer_offset, 512);
        assert_eq!(region.buffer_row_length, 64);
        assert_eq!(region.image_extent.width, 2);
        assert_eq!(region.image_extent.height, 2);

        assert_eq!(layout.vertex_copy_region().size, 96);
    }
}
