// Graphics context - everything a window needs to be drawn into
//
// Owns the device, swapchain, render targets and per-frame sync, and exposes
// the immediate-style frame operations the frame loop uses:
//
//   clear(color) -> draw(vertex_count) -> display()
//
// `clear` starts recording a frame (acquire image, begin render pass with
// clear values), `draw` records a draw with the current program and
// `display` submits and presents.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use super::image::{self, Attachment};
use super::pipeline;
use super::swapchain::{SwapStatus, Swapchain};
use super::sync::{FrameSync, PresentSemaphores, MAX_FRAMES_IN_FLIGHT};
use super::{cleanup_on_err, VulkanDevice};

/// Attributes requested for the rendering context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    pub depth_bits: u32,
    pub stencil_bits: u32,
    pub antialiasing_level: u32,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            depth_bits: 24,
            stencil_bits: 8,
            antialiasing_level: 2,
        }
    }
}

/// The pipeline draws are issued with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundProgram {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Between `display` and the next `clear`
    Idle,
    /// Render pass open on the given swapchain image
    Recording { image_index: u32 },
    /// No image this frame (minimized or out of date); draws are dropped
    Skipped,
}

impl FrameState {
    /// Whether `clear` has to begin a frame, or can skip it
    fn begins_frame_on_clear(self) -> Result<bool> {
        match self {
            FrameState::Idle => Ok(true),
            FrameState::Skipped => Ok(false),
            FrameState::Recording { .. } => {
                anyhow::bail!("clear called twice in one frame; display first")
            }
        }
    }
}

/// Size-dependent resources, rebuilt with the swapchain
struct RenderTargets {
    msaa: Option<Attachment>,
    depth: Attachment,
    framebuffers: Vec<vk::Framebuffer>,
    render_finished: PresentSemaphores,
}

pub struct GraphicsContext {
    frames: Vec<FrameSync>,
    current_frame: usize,
    state: FrameState,
    command_pool: vk::CommandPool,

    targets: Option<RenderTargets>,
    swapchain: Option<Swapchain>,
    needs_recreate: bool,

    render_pass: vk::RenderPass,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,

    program: Option<BoundProgram>,

    // Dropped last: the surface outlives nothing but the window
    device: Arc<VulkanDevice>,
    window: Arc<Window>,
}

impl GraphicsContext {
    /// Create a context for `window` satisfying `settings`
    ///
    /// Fails if no GPU can provide the requested depth/stencil precision,
    /// sample count, or present to the window.
    pub fn new(window: Arc<Window>, settings: &ContextSettings, validation: bool) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let device = VulkanDevice::new(&window.title(), window.as_ref(), validation)?;

        let depth_format =
            image::choose_depth_stencil_format(&device, settings.depth_bits, settings.stencil_bits)?;
        let samples = image::choose_sample_count(&device, settings.antialiasing_level)?;
        let color_format = Swapchain::surface_format(&device)?.format;

        log::info!(
            "Context: depth/stencil {:?}, {}x MSAA, color {:?}",
            depth_format,
            samples.as_raw(),
            color_format
        );

        let render_pass =
            pipeline::create_render_pass(&device, color_format, depth_format, samples)?;

        // Command buffers are re-recorded every frame
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        // From here on Drop cleans up whatever got created
        let mut context = Self {
            frames: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            current_frame: 0,
            state: FrameState::Idle,
            command_pool,
            targets: None,
            swapchain: None,
            needs_recreate: false,
            render_pass,
            color_format,
            depth_format,
            samples,
            program: None,
            device,
            window,
        };

        for command_buffer in command_buffers {
            let sync = FrameSync::new(&context.device, command_buffer)?;
            context.frames.push(sync);
        }

        context.recreate_targets()?;

        log::info!("Vulkan initialized successfully!");
        Ok(context)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Make `program` the target of subsequent draws
    pub fn use_program(&mut self, program: BoundProgram) {
        self.program = Some(program);
    }

    /// Forget `pipeline` if it is current
    pub fn unbind_pipeline(&mut self, pipeline: vk::Pipeline) {
        if self.program.map(|p| p.pipeline) == Some(pipeline) {
            self.program = None;
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    // =========================================================================
    // SWAPCHAIN & TARGETS
    // =========================================================================

    /// Rebuild the swapchain and everything sized after it
    fn recreate_targets(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy_targets();

        // The surface allows one swapchain at a time
        self.swapchain = None;

        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            log::debug!("Window has no area, deferring swapchain creation");
            return Ok(());
        }

        let swapchain = Swapchain::new(self.device.clone(), size.width, size.height)?;
        if swapchain.format != self.color_format {
            anyhow::bail!(
                "Surface format changed from {:?} to {:?}",
                self.color_format,
                swapchain.format
            );
        }

        let extent = swapchain.extent;

        let mut msaa = if self.samples != vk::SampleCountFlags::TYPE_1 {
            Some(Attachment::new(
                &self.device,
                "msaa color",
                extent,
                self.color_format,
                self.samples,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
            )?)
        } else {
            None
        };

        let depth = Attachment::new(
            &self.device,
            "depth/stencil",
            extent,
            self.depth_format,
            self.samples,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            image::depth_stencil_aspects(self.depth_format),
        );
        let depth = cleanup_on_err(depth, || {
            if let Some(msaa) = msaa.as_mut() {
                msaa.destroy(&self.device);
            }
        })?;

        // Stored before the steps below so a failure leaves them to destroy_targets
        let targets = self.targets.insert(RenderTargets {
            msaa,
            depth,
            framebuffers: Vec::new(),
            render_finished: PresentSemaphores::default(),
        });

        targets.render_finished =
            PresentSemaphores::new(&self.device.device, swapchain.image_views.len())?;
        targets.framebuffers = pipeline::create_framebuffers(
            &self.device,
            &swapchain.image_views,
            targets.msaa.as_ref().map(|m| m.view),
            targets.depth.view,
            self.render_pass,
            extent,
        )?;

        self.swapchain = Some(swapchain);
        self.needs_recreate = false;

        Ok(())
    }

    fn destroy_targets(&mut self) {
        if let Some(mut targets) = self.targets.take() {
            unsafe {
                for &framebuffer in &targets.framebuffers {
                    self.device.device.destroy_framebuffer(framebuffer, None);
                }
            }
            if let Some(msaa) = targets.msaa.as_mut() {
                msaa.destroy(&self.device);
            }
            targets.depth.destroy(&self.device);
            targets.render_finished.destroy(&self.device.device);
        }
    }

    // =========================================================================
    // FRAME OPERATIONS
    // =========================================================================

    /// Clear color to `color`, depth to 1 and stencil to 0
    ///
    /// Starts the frame; once per frame.
    pub fn clear(&mut self, color: [f32; 4]) -> Result<()> {
        if self.state.begins_frame_on_clear()? {
            self.begin_frame(color)?;
        }
        Ok(())
    }

    fn begin_frame(&mut self, color: [f32; 4]) -> Result<()> {
        if self.needs_recreate || self.swapchain.is_none() {
            self.recreate_targets()?;
        }

        let (Some(swapchain), Some(targets)) = (self.swapchain.as_ref(), self.targets.as_ref())
        else {
            // Minimized
            self.state = FrameState::Skipped;
            return Ok(());
        };

        let device = &self.device.device;
        let frame = &self.frames[self.current_frame];

        // Wait for the GPU to finish the frame that last used this slot
        frame.wait(device)?;

        let (image_index, status) = swapchain.acquire_next_image(frame.image_available)?;
        match status {
            SwapStatus::OutOfDate => {
                self.needs_recreate = true;
                self.state = FrameState::Skipped;
                return Ok(());
            }
            SwapStatus::Suboptimal => self.needs_recreate = true,
            SwapStatus::Optimal => {}
        }

        // Only reset once we know a submit will follow
        frame.reset(device)?;

        let cmd = frame.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let color_value = vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };
        let clear_values = [
            color_value,
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
            color_value,
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(targets.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: swapchain.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        }

        self.state = FrameState::Recording { image_index };
        Ok(())
    }

    /// Draw `vertex_count` vertices as a triangle strip with the current program
    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        match self.state {
            FrameState::Idle => anyhow::bail!("draw called outside a frame; clear first"),
            FrameState::Skipped => return Ok(()),
            FrameState::Recording { .. } => {}
        }

        let program = self
            .program
            .context("draw called with no program in use")?;
        let extent = self
            .swapchain
            .as_ref()
            .map(|s| s.extent)
            .context("Swapchain not initialized")?;

        let device = &self.device.device;
        let cmd = self.frames[self.current_frame].command_buffer;
        let height = extent.height as f32;

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, program.pipeline);
            device.cmd_set_viewport(cmd, 0, &[pipeline::flipped_viewport(extent)]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );
            device.cmd_push_constants(
                cmd,
                program.layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                &height.to_ne_bytes(),
            );
            device.cmd_draw(cmd, vertex_count, 1, 0, 0);
        }

        Ok(())
    }

    /// Submit the frame and present it
    ///
    /// With FIFO presentation this can block until the compositor takes the image.
    pub fn display(&mut self) -> Result<()> {
        let image_index = match self.state {
            FrameState::Idle => anyhow::bail!("display called without a frame; clear first"),
            FrameState::Skipped => {
                self.state = FrameState::Idle;
                return Ok(());
            }
            FrameState::Recording { image_index } => image_index,
        };
        self.state = FrameState::Idle;

        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let targets = self.targets.as_ref().context("Render targets not initialized")?;
        let device = &self.device.device;
        let frame = &self.frames[self.current_frame];
        let cmd = frame.command_buffer;

        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [targets.render_finished.for_image(image_index)?];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device
                .queue_submit(self.device.graphics_queue, &[submit_info], frame.in_flight_fence)
                .context("Failed to submit frame")?;
        }

        let status = swapchain.present(self.device.graphics_queue, image_index, &signal_semaphores)?;
        if status != SwapStatus::Optimal {
            log::debug!("Swapchain {:?}, recreating next frame", status);
            self.needs_recreate = true;
        }

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        let _ = self.device.wait_idle();

        if self.program.is_some() {
            log::warn!("Context dropped with a program still in use");
        }

        self.destroy_targets();
        self.swapchain = None;

        unsafe {
            for sync in &self.frames {
                sync.destroy(&self.device.device);
            }
            // Also frees the command buffers
            self.device.device.destroy_command_pool(self.command_pool, None);
            self.device.device.destroy_render_pass(self.render_pass, None);
        }

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_begins_a_frame_only_when_idle() {
        assert!(FrameState::Idle.begins_frame_on_clear().unwrap());
        assert!(!FrameState::Skipped.begins_frame_on_clear().unwrap());
    }

    #[test]
    fn second_clear_in_a_frame_is_an_error() {
        let err = FrameState::Recording { image_index: 1 }
            .begins_frame_on_clear()
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }
}
