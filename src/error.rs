// Error taxonomy
//
// Almost everything flows through anyhow with context strings. The variants
// here are the cases a caller has to tell apart from "something failed".

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The driver reset or the GPU went away. Reported separately from other
    /// per-frame failures; no recovery is attempted.
    #[error("GPU device lost")]
    DeviceLost,

    #[error("failed to compile entry point `{entry}` of {path:?}:\n{diagnostic}")]
    ShaderCompilation {
        path: PathBuf,
        entry: String,
        diagnostic: String,
    },

    #[error("staging data needs {required} bytes but the upload buffer holds {capacity}")]
    StagingOverflow { required: u64, capacity: u64 },
}

impl RenderError {
    /// True if `err` (or anything in its chain) is a lost device.
    pub fn is_device_lost(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<RenderError>(), Some(RenderError::DeviceLost)))
    }
}

/// Convert a Vulkan result code, keeping device loss distinguishable.
pub fn vk_error(result: vk::Result) -> anyhow::Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost.into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn device_lost_survives_context() {
        let err: anyhow::Result<()> = Err(vk_error(vk::Result::ERROR_DEVICE_LOST));
        let err = err.context("Failed to present").unwrap_err();
        assert!(RenderError::is_device_lost(&err));
    }

    #[test]
    fn other_codes_are_not_device_loss() {
        let err = vk_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(!RenderError::is_device_lost(&err));
    }
}
