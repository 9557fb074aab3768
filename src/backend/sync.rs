// Synchronization primitives
//
// Fences order GPU -> CPU, binary semaphores order GPU -> GPU.
// A fence only changes state through an explicit wait or reset; nothing here polls.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// Default hard upper bound for any fence wait (2 seconds).
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 2_000_000_000;

/// Outcome of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Map the raw result of `vkWaitForFences` onto a status or an error.
pub fn classify_wait(result: Result<(), vk::Result>) -> FrameResult<FenceStatus> {
    match result {
        Ok(()) => Ok(FenceStatus::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
        Err(e) => Err(FrameError::vulkan("vkWaitForFences")(e)),
    }
}

/// A semaphore the submission waits on, and the stage that waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSemaphore {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// Binary semaphore, GPU -> GPU ordering only.
pub struct Semaphore {
    handle: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl Semaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> FrameResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.device.create_semaphore(&create_info, None) }
            .map_err(FrameError::creation("semaphore"))?;

        Ok(Self {
            handle,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Destroy the semaphore. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.handle != vk::Semaphore::null() {
            unsafe { self.device.device.destroy_semaphore(self.handle, None) };
            self.handle = vk::Semaphore::null();
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Binary fence, GPU -> CPU ordering.
pub struct Fence {
    handle: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl Fence {
    /// Create a fence. Pass `signaled = true` when the first wait must not block,
    /// e.g. for frame ring slots that have never been submitted.
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> FrameResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.device.create_fence(&create_info, None) }
            .map_err(FrameError::creation("fence"))?;

        Ok(Self {
            handle,
            device: Arc::clone(device),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> FrameResult<FenceStatus> {
        wait_for_fences(&self.device, &[self], true, timeout_ns)
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> FrameResult<()> {
        reset_fences(&self.device, &[self])
    }

    /// Destroy the fence. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.handle != vk::Fence::null() {
            unsafe { self.device.device.destroy_fence(self.handle, None) };
            self.handle = vk::Fence::null();
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Wait on a set of fences. An empty set succeeds immediately.
pub fn wait_for_fences(
    device: &VulkanDevice,
    fences: &[&Fence],
    wait_all: bool,
    timeout_ns: u64,
) -> FrameResult<FenceStatus> {
    if fences.is_empty() {
        return Ok(FenceStatus::Signaled);
    }
    let handles: Vec<vk::Fence> = fences.iter().map(|fence| fence.handle).collect();
    classify_wait(unsafe { device.device.wait_for_fences(&handles, wait_all, timeout_ns) })
}

/// Reset a set of fences. An empty set is a no-op.
pub fn reset_fences(device: &VulkanDevice, fences: &[&Fence]) -> FrameResult<()> {
    if fences.is_empty() {
        return Ok(());
    }
    let handles: Vec<vk::Fence> = fences.iter().map(|fence| fence.handle).collect();
    unsafe { device.device.reset_fences(&handles) }.map_err(FrameError::vulkan("vkResetFences"))
}

/// Submit one batch to `queue`. `fence` may be null.
pub fn submit(
    device: &VulkanDevice,
    queue: vk::Queue,
    waits: &[WaitSemaphore],
    command_buffers: &[vk::CommandBuffer],
    signals: &[vk::Semaphore],
    fence: vk::Fence,
) -> FrameResult<()> {
    let wait_semaphores: Vec<vk::Semaphore> = waits.iter().map(|w| w.semaphore).collect();
    let wait_stages: Vec<vk::PipelineStageFlags> = waits.iter().map(|w| w.stage).collect();

    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(command_buffers)
        .signal_semaphores(signals);

    unsafe { device.device.queue_submit(queue, &[submit_info], fence) }
        .map_err(FrameError::vulkan("vkQueueSubmit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_wait_is_signaled() {
        assert_eq!(classify_wait(Ok(())).unwrap(), FenceStatus::Signaled);
    }

    #[test]
    fn timeout_is_an_outcome_not_an_error() {
        assert_eq!(
            classify_wait(Err(vk::Result::TIMEOUT)).unwrap(),
            FenceStatus::TimedOut
        );
    }

    #[test]
    fn device_lost_during_wait_is_an_error() {
        let err = classify_wait(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(err.is_device_lost());
    }
}
