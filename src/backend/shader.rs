// Shader compilation and module creation
//
// Shaders live in an external WGSL file with one entry point per stage.
// naga turns each entry point into its own SPIR-V blob at startup; a syntax
// or validation error is logged with naga's annotated diagnostic and stops
// pipeline creation.

use anyhow::{Context, Result};
use ash::vk;
use std::path::{Path, PathBuf};

use super::VulkanDevice;
use crate::error::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    fn naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Pixel => naga::ShaderStage::Fragment,
        }
    }

    pub fn vk_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Pixel => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// SPIR-V for one entry point.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub spirv: Vec<u32>,
}

/// Shader source text plus where it came from, for diagnostics.
pub struct ShaderSource {
    pub path: PathBuf,
    pub text: String,
}

impl ShaderSource {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read shader source {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
        })
    }

    /// Compile one entry point. Errors are logged before being returned.
    pub fn compile(&self, entry_point: &str, stage: ShaderStage) -> Result<CompiledShader> {
        let spirv = compile_wgsl(&self.text, entry_point, stage).map_err(|diagnostic| {
            log::error!(
                "Shader compilation failed ({:?}, entry `{}`):\n{}",
                self.path,
                entry_point,
                diagnostic
            );
            RenderError::ShaderCompilation {
                path: self.path.clone(),
                entry: entry_point.to_string(),
                diagnostic,
            }
        })?;

        log::debug!(
            "Compiled {:?} entry `{}`: {} words",
            self.path,
            entry_point,
            spirv.len()
        );

        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_string(),
            spirv,
        })
    }
}

/// WGSL -> validated module -> SPIR-V for a single entry point.
/// The error is the human readable diagnostic.
fn compile_wgsl(source: &str, entry_point: &str, stage: ShaderStage) -> Result<Vec<u32>, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    let has_entry = module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage.naga());
    if !has_entry {
        return Err(format!("no {:?} entry point named `{}`", stage, entry_point));
    }

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::PUSH_CONSTANT,
    );
    let info = validator
        .validate(&module)
        .map_err(|e| e.emit_to_string(source))?;

    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage.naga(),
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(
        &module,
        &info,
        &naga::back::spv::Options::default(),
        Some(&pipeline_options),
    )
    .map_err(|e| e.to_string())
}

/// Create a shader module from compiled SPIR-V
pub fn create_shader_module(device: &VulkanDevice, shader: &CompiledShader) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&shader.spirv);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .with_context(|| format!("Failed to create shader module for `{}`", shader.entry_point))
}
