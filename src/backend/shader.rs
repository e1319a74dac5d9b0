// Shader module creation
//
// Programs arrive as SPIR-V words from the runtime compiler; modules only
// live while a pipeline is being created.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

pub fn create_shader_module(device: &VulkanDevice, words: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
