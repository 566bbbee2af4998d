// What we draw: one triangle and a tiny checkerboard texture.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};

/// Interleaved vertex as consumed by the vertex stage.
/// Field order and formats must match `pipeline::vertex_input_description`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub uv: Vec2,
    pub color: Vec4,
}

impl Vertex {
    const fn new(position: [f32; 2], uv: [f32; 2], color: [f32; 4]) -> Self {
        Self {
            position: Vec2::from_array(position),
            uv: Vec2::from_array(uv),
            color: Vec4::from_array(color),
        }
    }
}

pub const TRIANGLE: [Vertex; 3] = [
    Vertex::new([0.0, 0.7], [1.5, 0.0], [1.0, 0.0, 0.0, 1.0]),
    Vertex::new([0.7, -0.7], [3.0, 3.0], [0.0, 1.0, 0.0, 1.0]),
    Vertex::new([-0.7, -0.7], [0.0, 3.0], [0.0, 0.0, 1.0, 1.0]),
];

/// 2x2 checkerboard, RGBA8 packed little-endian (alpha in the top byte).
/// Alpha 0x20 makes the squares mostly see-through.
pub const CHECKERS: [u32; 4] = [
    0x2000_0000, 0x20ff_ffff,
    0x20ff_ffff, 0x2000_0000,
];
pub const CHECKERS_WIDTH: u32 = 2;
pub const CHECKERS_HEIGHT: u32 = 2;

/// Bytes per checkerboard texel.
pub const TEXEL_SIZE: u32 = std::mem::size_of::<u32>() as u32;

pub fn triangle_bytes() -> &'static [u8] {
    bytemuck::cast_slice(&TRIANGLE)
}
