// Error classification for the frame pacing core
//
// Fatal kinds (resource creation, allocation, timeouts, raw Vulkan failures) bubble up
// to the caller. SwapchainStale and NotReady are recoverable and normally handled
// inside the pacer.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to create {what}: {result}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    #[error("failed to allocate memory for {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    /// A bounded fence wait expired. Treated as a lost device by default.
    #[error("fence wait timed out after {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },

    /// Swapchain is out of date or suboptimal and must be rebuilt.
    #[error("swapchain no longer matches the surface")]
    SwapchainStale,

    /// The surface has a zero-sized extent (minimized window).
    #[error("surface has a zero extent, nothing to render to")]
    NotReady,

    /// Error returned by the caller's recording callback, passed through untouched.
    #[error(transparent)]
    Callback(anyhow::Error),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("frame ring needs at least 2 slots, got {0}")]
    RingTooSmall(usize),

    #[error("staging upload called with no data")]
    EmptyUpload,

    #[error("pipeline cache file {}: {source}", path.display())]
    CacheIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FrameError {
    pub(crate) fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::ResourceCreation { what, result }
    }

    pub(crate) fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { call, result }
    }

    pub(crate) fn allocation(what: &'static str) -> impl FnOnce(gpu_allocator::AllocationError) -> Self {
        move |source| Self::Allocation { what, source }
    }

    /// Conditions the pacer absorbs by skipping a frame instead of failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainStale | Self::NotReady)
    }

    /// True when the GPU has most likely been lost.
    pub fn is_device_lost(&self) -> bool {
        match self {
            Self::FenceTimeout { .. } => true,
            Self::Vulkan { result, .. } | Self::ResourceCreation { result, .. } => {
                *result == vk::Result::ERROR_DEVICE_LOST
            }
            _ => false,
        }
    }
}

pub type FrameResult<T> = Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_swapchain_conditions_are_recoverable() {
        assert!(FrameError::SwapchainStale.is_recoverable());
        assert!(FrameError::NotReady.is_recoverable());
        assert!(!FrameError::FenceTimeout { timeout_ns: 1 }.is_recoverable());
        assert!(!FrameError::RingTooSmall(1).is_recoverable());
        assert!(!FrameError::creation("fence")(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_recoverable());
    }

    #[test]
    fn timeouts_and_device_lost_results_flag_a_lost_device() {
        assert!(FrameError::FenceTimeout { timeout_ns: 2_000_000_000 }.is_device_lost());
        assert!(FrameError::vulkan("vkQueueSubmit")(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(!FrameError::vulkan("vkQueueSubmit")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_device_lost());
    }

    #[test]
    fn callback_errors_keep_their_message() {
        let err = FrameError::Callback(anyhow::anyhow!("shadow pass exploded"));
        assert_eq!(err.to_string(), "shadow pass exploded");
    }
}
