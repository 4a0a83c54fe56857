// Render target images
//
// Depth/stencil and multisampled color attachments, backed by gpu-allocator.
// Also picks the depth/stencil format and sample count a context asks for.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::{cleanup_on_err, VulkanDevice};

/// Depth/stencil formats with their (depth, stencil) bit counts, smallest first
const DEPTH_STENCIL_FORMATS: [(vk::Format, u32, u32); 7] = [
    (vk::Format::S8_UINT, 0, 8),
    (vk::Format::D16_UNORM, 16, 0),
    (vk::Format::D16_UNORM_S8_UINT, 16, 8),
    (vk::Format::X8_D24_UNORM_PACK32, 24, 0),
    (vk::Format::D24_UNORM_S8_UINT, 24, 8),
    (vk::Format::D32_SFLOAT, 32, 0),
    (vk::Format::D32_SFLOAT_S8_UINT, 32, 8),
];

/// Formats with at least the requested precision, best match first
pub fn depth_stencil_candidates(depth_bits: u32, stencil_bits: u32) -> Vec<vk::Format> {
    let mut candidates: Vec<_> = DEPTH_STENCIL_FORMATS
        .iter()
        .filter(|&&(_, depth, stencil)| depth >= depth_bits && stencil >= stencil_bits)
        .copied()
        .collect();

    // Least wasted precision wins; on ties keep the table order
    candidates.sort_by_key(|&(_, depth, stencil)| (depth - depth_bits) + (stencil - stencil_bits));
    candidates.into_iter().map(|(format, _, _)| format).collect()
}

/// Aspects a depth/stencil format carries
pub fn depth_stencil_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        _ => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

/// Pick the first candidate usable as an optimal-tiling depth/stencil attachment
pub fn choose_depth_stencil_format(
    device: &VulkanDevice,
    depth_bits: u32,
    stencil_bits: u32,
) -> Result<vk::Format> {
    depth_stencil_candidates(depth_bits, stencil_bits)
        .into_iter()
        .find(|&format| {
            device
                .format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .with_context(|| {
            format!(
                "No depth/stencil format with {} depth and {} stencil bits",
                depth_bits, stencil_bits
            )
        })
}

/// Sample count for an antialiasing level (0 and 1 both mean off)
pub fn sample_count(level: u32) -> Option<vk::SampleCountFlags> {
    match level {
        0 | 1 => Some(vk::SampleCountFlags::TYPE_1),
        2 => Some(vk::SampleCountFlags::TYPE_2),
        4 => Some(vk::SampleCountFlags::TYPE_4),
        8 => Some(vk::SampleCountFlags::TYPE_8),
        16 => Some(vk::SampleCountFlags::TYPE_16),
        32 => Some(vk::SampleCountFlags::TYPE_32),
        64 => Some(vk::SampleCountFlags::TYPE_64),
        _ => None,
    }
}

/// Check the device can render color and depth/stencil at `level`
pub fn choose_sample_count(device: &VulkanDevice, level: u32) -> Result<vk::SampleCountFlags> {
    let samples = sample_count(level)
        .with_context(|| format!("{}x multisampling is not a valid sample count", level))?;

    let limits = &device.properties.limits;
    let supported = limits.framebuffer_color_sample_counts
        & limits.framebuffer_depth_sample_counts
        & limits.framebuffer_stencil_sample_counts;

    if !supported.contains(samples) {
        anyhow::bail!("{}x multisampling is not supported by this GPU", level);
    }

    Ok(samples)
}

/// An image + view + memory used as a framebuffer attachment
pub struct Attachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
}

impl Attachment {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create {} image", name))?;

        // Filled in step by step; `destroy` copes with the missing parts
        let mut attachment = Self {
            image,
            view: vk::ImageView::null(),
            allocation: None,
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = cleanup_on_err(allocation, || attachment.destroy(device))
            .with_context(|| format!("Failed to allocate {} memory", name))?;
        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        attachment.allocation = Some(allocation);

        let bound = unsafe { device.device.bind_image_memory(image, memory, offset) };
        cleanup_on_err(bound, || attachment.destroy(device))
            .with_context(|| format!("Failed to bind {} memory", name))?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.device.create_image_view(&view_info, None) };
        let view = cleanup_on_err(view, || attachment.destroy(device))
            .with_context(|| format!("Failed to create {} view", name))?;
        attachment.view = view;

        log::debug!(
            "Created {} attachment: {}x{} {:?} x{}",
            name,
            extent.width,
            extent.height,
            format,
            samples.as_raw()
        );

        Ok(attachment)
    }

    /// Release whatever parts exist
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
            }
            device.device.destroy_image(self.image, None);
        }
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator.lock().free(allocation) {
                log::warn!("Failed to free attachment memory: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_four_eight_prefers_the_exact_packed_format() {
        let candidates = depth_stencil_candidates(24, 8);
        assert_eq!(
            candidates,
            vec![vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT]
        );
    }

    #[test]
    fn depth_only_requests_skip_stencil_formats_when_possible() {
        let candidates = depth_stencil_candidates(16, 0);
        assert_eq!(candidates[0], vk::Format::D16_UNORM);
        assert!(candidates.contains(&vk::Format::D32_SFLOAT_S8_UINT));
    }

    #[test]
    fn impossible_precision_has_no_candidates() {
        assert!(depth_stencil_candidates(64, 8).is_empty());
    }

    #[test]
    fn packed_formats_carry_both_aspects() {
        assert_eq!(
            depth_stencil_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            depth_stencil_aspects(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
    }

    #[test]
    fn antialiasing_levels_map_to_sample_counts() {
        assert_eq!(sample_count(0), Some(vk::SampleCountFlags::TYPE_1));
        assert_eq!(sample_count(1), Some(vk::SampleCountFlags::TYPE_1));
        assert_eq!(sample_count(2), Some(vk::SampleCountFlags::TYPE_2));
        assert_eq!(sample_count(8), Some(vk::SampleCountFlags::TYPE_8));
        assert_eq!(sample_count(3), None);
    }
}
