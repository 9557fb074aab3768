// Vulkan implementation of the pacer backend
//
// Owns the swapchain, the frame ring, the render pass the ring's framebuffers are built
// for, and the command pool the ring's recording targets come from.

use ash::vk;
use std::sync::Arc;

use super::pacer::FrameBackend;
use super::ring::{FrameRing, FrameSlot};
use crate::backend::render_pass::{Framebuffer, RenderPass};
use crate::backend::swapchain::{AcquireOutcome, PresentOutcome};
use crate::backend::sync::{self, Fence};
use crate::backend::{
    CommandPool, FenceStatus, Surface, SwapchainPreferences, SwapchainState, VulkanDevice,
    WaitSemaphore,
};
use crate::error::{FrameError, FrameResult};

pub struct VulkanFrameBackend {
    // Drop order matters: ring and framebuffers before the render pass and the pool
    ring: FrameRing,
    render_pass: RenderPass,
    swapchain: SwapchainState,
    _pool: CommandPool,
    preferences: SwapchainPreferences,
    device: Arc<VulkanDevice>,
}

impl VulkanFrameBackend {
    pub fn new(
        device: &Arc<VulkanDevice>,
        surface: Surface,
        preferences: SwapchainPreferences,
        ring_size: usize,
        depth_format: Option<vk::Format>,
    ) -> FrameResult<Self> {
        let swapchain = SwapchainState::new(device, surface, &preferences)?;
        let render_pass = RenderPass::new(device, swapchain.format(), depth_format)?;
        let pool = CommandPool::new(device, device.graphics_queue.family)?;
        let mut ring = FrameRing::new(device, &pool, ring_size, depth_format)?;
        ring.rebuild_depth_attachments(swapchain.extent())?;

        Ok(Self {
            ring,
            render_pass,
            swapchain,
            _pool: pool,
            preferences,
            device: Arc::clone(device),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn swapchain(&self) -> &SwapchainState {
        &self.swapchain
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Size to use when the surface lets the swapchain pick, i.e. the window size.
    pub fn set_fallback_extent(&mut self, extent: vk::Extent2D) {
        self.preferences.fallback_extent = extent;
    }

    pub fn set_present_mode(&mut self, present_mode: vk::PresentModeKHR) {
        self.preferences.present_mode = present_mode;
    }

    fn fence(&self, slot: usize) -> FrameResult<&Fence> {
        slot_fence(self.ring.slot(slot))
    }
}

fn slot_fence(slot: &FrameSlot) -> FrameResult<&Fence> {
    slot.drawing_finished()
        .ok_or_else(|| FrameError::Unsupported("using a torn-down frame slot".to_string()))
}

impl FrameBackend for VulkanFrameBackend {
    fn slot_count(&self) -> usize {
        self.ring.len()
    }

    fn not_ready(&self) -> bool {
        self.swapchain.not_ready()
    }

    fn image_acquired(&self, slot: usize) -> vk::Semaphore {
        self.ring.slot(slot).image_acquired()
    }

    fn wait_slot(&mut self, slot: usize, timeout_ns: u64) -> FrameResult<FenceStatus> {
        self.fence(slot)?.wait(timeout_ns)
    }

    fn reset_slot(&mut self, slot: usize) -> FrameResult<()> {
        self.fence(slot)?.reset()
    }

    fn acquire(&mut self, slot: usize, timeout_ns: u64) -> FrameResult<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(self.ring.slot(slot).image_acquired(), timeout_ns)
    }

    fn prepare_framebuffer(&mut self, slot: usize, image_index: u32) -> FrameResult<vk::Framebuffer> {
        let color_view = self
            .swapchain
            .images()
            .get(image_index as usize)
            .map(|image| image.view())
            .ok_or(FrameError::SwapchainStale)?;

        let mut attachments = vec![color_view];
        if self.render_pass.has_depth() {
            let depth_view = self.ring.slot(slot).depth_view().ok_or(FrameError::NotReady)?;
            attachments.push(depth_view);
        }

        // The slot's fence has been waited on, so its old framebuffer is free to go
        let framebuffer = Framebuffer::new(
            &self.device,
            self.render_pass.handle(),
            &attachments,
            self.swapchain.extent(),
        )?;
        Ok(self.ring.slot_mut(slot).replace_framebuffer(framebuffer))
    }

    fn recording_target(&self, slot: usize) -> vk::CommandBuffer {
        self.ring.slot(slot).recording_target()
    }

    fn submit(&mut self, slot: usize, waits: &[WaitSemaphore]) -> FrameResult<()> {
        let frame = self.ring.slot(slot);
        sync::submit(
            &self.device,
            self.device.graphics_queue.handle,
            waits,
            &[frame.recording_target()],
            &[frame.ready_to_present()],
            slot_fence(frame)?.handle(),
        )
    }

    fn present(&mut self, slot: usize, image_index: u32) -> FrameResult<PresentOutcome> {
        let ready = self.ring.slot(slot).ready_to_present();
        self.swapchain
            .present(self.device.present_queue.handle, image_index, &[ready])
    }

    fn retire(&mut self, slot: usize, image_acquired: bool) -> FrameResult<()> {
        let frame = self.ring.slot(slot);
        let acquired = [WaitSemaphore {
            semaphore: frame.image_acquired(),
            stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }];
        let waits: &[WaitSemaphore] = if image_acquired { &acquired } else { &[] };
        log::debug!("Retiring frame slot {} without work", slot);
        sync::submit(
            &self.device,
            self.device.graphics_queue.handle,
            waits,
            &[],
            &[],
            slot_fence(frame)?.handle(),
        )
    }

    fn rebuild(&mut self) -> FrameResult<()> {
        self.device
            .wait_idle()
            .map_err(FrameError::vulkan("vkDeviceWaitIdle"))?;

        let old_format = self.swapchain.format();
        self.swapchain.rebuild(&self.preferences)?;

        if !self.swapchain.not_ready() && self.swapchain.format() != old_format {
            log::info!(
                "Swapchain format changed {:?} -> {:?}, recreating render pass",
                old_format,
                self.swapchain.format()
            );
            // Framebuffers reference the old pass; drop them first
            self.ring.rebuild_depth_attachments(vk::Extent2D::default())?;
            self.render_pass = RenderPass::new(
                &self.device,
                self.swapchain.format(),
                self.ring.depth_format(),
            )?;
        }

        self.ring.rebuild_depth_attachments(self.swapchain.extent())
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait before frame teardown failed: {}", e);
        }
        self.ring.teardown();
    }
}
