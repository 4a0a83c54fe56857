// Synchronization primitives
//
// Acquisition is tracked per frame in flight, presentation per swapchain
// image. A present can still be waiting on its semaphore after the frame's
// fence signals, so render-finished semaphores can't be recycled with the
// frame slot.

use anyhow::{Context, Result};
use ash::vk;

use super::{cleanup_on_err, VulkanDevice};

/// Frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let device = &device.device;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first wait returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create image-available semaphore")?;

        let in_flight_fence = cleanup_on_err(
            unsafe { device.create_fence(&fence_info, None) },
            || unsafe { device.destroy_semaphore(image_available, None) },
        )
        .context("Failed to create frame fence")?;

        Ok(Self {
            image_available,
            in_flight_fence,
            command_buffer,
        })
    }

    /// Block until the GPU is done with this slot's previous frame
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
            .context("Failed waiting for frame fence")
    }

    pub fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_fences(&[self.in_flight_fence])?;
            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    /// Command buffer is freed with its pool
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Render-finished semaphores, one per swapchain image
///
/// Rebuilt with the swapchain. Reusing image `i`'s semaphore is safe once
/// image `i` has been acquired again, since that implies its last present
/// completed.
#[derive(Default)]
pub struct PresentSemaphores {
    semaphores: Vec<vk::Semaphore>,
}

impl PresentSemaphores {
    pub fn new(device: &ash::Device, image_count: usize) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let mut present = Self {
            semaphores: Vec::with_capacity(image_count),
        };

        for _ in 0..image_count {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) };
            let semaphore = cleanup_on_err(semaphore, || present.destroy(device))
                .context("Failed to create render-finished semaphore")?;
            present.semaphores.push(semaphore);
        }

        Ok(present)
    }

    /// Semaphore the submit for `image_index` signals and its present waits on
    pub fn for_image(&self, image_index: u32) -> Result<vk::Semaphore> {
        self.semaphores
            .get(image_index as usize)
            .copied()
            .with_context(|| format!("No render-finished semaphore for image {}", image_index))
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.semaphores.drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn semaphores(count: u64) -> PresentSemaphores {
        PresentSemaphores {
            semaphores: (1..=count).map(vk::Semaphore::from_raw).collect(),
        }
    }

    #[test]
    fn each_image_presents_with_its_own_semaphore() {
        let present = semaphores(3);
        let picked: Vec<_> = (0..3).map(|i| present.for_image(i).unwrap()).collect();
        assert_eq!(
            picked,
            vec![
                vk::Semaphore::from_raw(1),
                vk::Semaphore::from_raw(2),
                vk::Semaphore::from_raw(3)
            ]
        );
    }

    #[test]
    fn frame_slot_reuse_does_not_reuse_a_pending_semaphore() {
        // Three images, two frame slots: slot 0 renders images 0 then 2
        let present = semaphores(3);
        let acquired = [0u32, 1, 2, 0, 1, 2];

        for (frame, pair) in acquired.windows(MAX_FRAMES_IN_FLIGHT + 1).enumerate() {
            let slot_first = pair[0];
            let slot_next = pair[MAX_FRAMES_IN_FLIGHT];
            assert_ne!(
                present.for_image(slot_first).unwrap(),
                present.for_image(slot_next).unwrap(),
                "frame {} signals a semaphore its slot's last present may still wait on",
                frame
            );
        }
    }

    #[test]
    fn out_of_range_image_is_an_error() {
        assert!(semaphores(2).for_image(2).is_err());
    }
}
