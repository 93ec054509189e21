// Shader module loading
//
// Compute kernels are SPIR-V binaries read from disk at runtime. The entry
// point is always `main`.

use super::error::{Check, Error, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;

pub const ENTRY_POINT: &CStr = c"main";

/// Read a SPIR-V binary into properly aligned words.
///
/// Rejects files whose length is not a multiple of four or whose magic
/// number is wrong.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_read = |source| Error::ShaderRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(shader_read)?;
    ash::util::read_spv(&mut file).map_err(shader_read)
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.create_shader_module(&create_info, None) }.check("vkCreateShaderModule")
}
