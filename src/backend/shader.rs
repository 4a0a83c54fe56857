// Shader module creation
//
// Vulkan consumes SPIR-V words. naga already hands us u32s, so no byte
// realignment is needed here.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, words: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

pub fn destroy_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe { device.device.destroy_shader_module(module, None) }
}
