// Backend module - Vulkan abstraction layer
//
// Thin wrapper around ash: device, surface, swapchain, render targets and
// the frame operations built on top of them.

pub mod context;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use context::{BoundProgram, ContextSettings, GraphicsContext};
pub use device::VulkanDevice;

/// Pass `result` through, running `cleanup` first if it is an error
///
/// For multi-step object creation: whatever was built before the failing
/// step gets destroyed.
pub fn cleanup_on_err<T, E>(result: Result<T, E>, cleanup: impl FnOnce()) -> Result<T, E> {
    if result.is_err() {
        cleanup();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_runs_only_on_failure() {
        let mut cleaned = 0;
        let ok: Result<u32, &str> = cleanup_on_err(Ok(7), || cleaned += 1);
        assert_eq!(ok, Ok(7));
        assert_eq!(cleaned, 0);

        let err: Result<u32, &str> = cleanup_on_err(Err("out of memory"), || cleaned += 1);
        assert_eq!(err, Err("out of memory"));
        assert_eq!(cleaned, 1);
    }
}
