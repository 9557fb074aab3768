// Frame resource ring
//
// N slots of per-frame resources, used round-robin. A slot's fence must be waited on
// before its command buffer is re-recorded or its framebuffer replaced.

use ash::vk;
use std::sync::Arc;

use crate::backend::memory::DepthAttachment;
use crate::backend::render_pass::Framebuffer;
use crate::backend::{CommandPool, Fence, Semaphore, VulkanDevice};
use crate::error::{FrameError, FrameResult};

/// Resources one in-flight frame needs. Move-only.
///
/// A default slot is inert: no handles, nothing to destroy.
#[derive(Default)]
pub struct FrameSlot {
    recording_target: vk::CommandBuffer,
    image_acquired: Option<Semaphore>,
    ready_to_present: Option<Semaphore>,
    drawing_finished: Option<Fence>,
    depth: Option<DepthAttachment>,
    framebuffer: Option<Framebuffer>,
}

impl FrameSlot {
    fn new(device: &Arc<VulkanDevice>, recording_target: vk::CommandBuffer) -> FrameResult<Self> {
        Ok(Self {
            recording_target,
            image_acquired: Some(Semaphore::new(device)?),
            ready_to_present: Some(Semaphore::new(device)?),
            // Signaled, so the first wait on a fresh slot returns at once
            drawing_finished: Some(Fence::new(device, true)?),
            depth: None,
            framebuffer: None,
        })
    }

    pub fn recording_target(&self) -> vk::CommandBuffer {
        self.recording_target
    }

    pub fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired
            .as_ref()
            .map_or(vk::Semaphore::null(), Semaphore::handle)
    }

    pub fn ready_to_present(&self) -> vk::Semaphore {
        self.ready_to_present
            .as_ref()
            .map_or(vk::Semaphore::null(), Semaphore::handle)
    }

    pub fn drawing_finished(&self) -> Option<&Fence> {
        self.drawing_finished.as_ref()
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.depth.as_ref().map(DepthAttachment::view)
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
            .as_ref()
            .map_or(vk::Framebuffer::null(), Framebuffer::handle)
    }

    /// Install this cycle's framebuffer, destroying the previous one.
    pub fn replace_framebuffer(&mut self, framebuffer: Framebuffer) -> vk::Framebuffer {
        self.framebuffer = None;
        let handle = framebuffer.handle();
        self.framebuffer = Some(framebuffer);
        handle
    }

    /// Move everything out, leaving this slot inert.
    pub fn take(&mut self) -> FrameSlot {
        std::mem::take(self)
    }

    pub fn is_inert(&self) -> bool {
        self.recording_target == vk::CommandBuffer::null()
            && self.image_acquired.is_none()
            && self.ready_to_present.is_none()
            && self.drawing_finished.is_none()
            && self.depth.is_none()
            && self.framebuffer.is_none()
    }

    /// Release everything the slot owns. Safe to call more than once.
    ///
    /// The command buffer belongs to the pool and is only forgotten here.
    pub fn teardown(&mut self) {
        self.recording_target = vk::CommandBuffer::null();
        self.image_acquired = None;
        self.ready_to_present = None;
        self.drawing_finished = None;
        self.depth = None;
        self.framebuffer = None;
    }
}

pub struct FrameRing {
    slots: Vec<FrameSlot>,
    depth_format: Option<vk::Format>,
    device: Arc<VulkanDevice>,
}

impl FrameRing {
    /// Build `count` slots with command buffers from `pool`. Depth attachments are
    /// created by the first `rebuild_depth_attachments`.
    pub fn new(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        count: usize,
        depth_format: Option<vk::Format>,
    ) -> FrameResult<Self> {
        check_ring_size(count)?;

        let targets = pool.allocate(count as u32)?;
        let slots = targets
            .into_iter()
            .map(|target| FrameSlot::new(device, target))
            .collect::<FrameResult<Vec<_>>>()?;

        log::info!(
            "Frame ring created: {} slots, depth {:?}",
            count,
            depth_format
        );
        Ok(Self {
            slots,
            depth_format,
            device: Arc::clone(device),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    /// Recreate every slot's depth attachment at `extent` and drop cached framebuffers.
    ///
    /// The caller must have waited for the device to go idle.
    pub fn rebuild_depth_attachments(&mut self, extent: vk::Extent2D) -> FrameResult<()> {
        let zero = extent.width == 0 || extent.height == 0;
        for slot in &mut self.slots {
            slot.framebuffer = None;
            slot.depth = None;
            if let (Some(format), false) = (self.depth_format, zero) {
                slot.depth = Some(DepthAttachment::new(&self.device, format, extent)?);
            }
        }
        if !zero && self.depth_format.is_some() {
            log::debug!(
                "Rebuilt {} depth attachments at {}x{}",
                self.slots.len(),
                extent.width,
                extent.height
            );
        }
        Ok(())
    }

    /// Release every slot. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.slots.iter().all(FrameSlot::is_inert) {
            return;
        }
        for slot in &mut self.slots {
            slot.teardown();
        }
        log::info!("Frame ring torn down");
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub(crate) fn check_ring_size(count: usize) -> FrameResult<()> {
    if count < 2 {
        return Err(FrameError::RingTooSmall(count));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_needs_two_slots() {
        assert!(matches!(check_ring_size(0), Err(FrameError::RingTooSmall(0))));
        assert!(matches!(check_ring_size(1), Err(FrameError::RingTooSmall(1))));
        assert!(check_ring_size(2).is_ok());
        assert!(check_ring_size(3).is_ok());
    }

    #[test]
    fn default_slot_is_inert() {
        let mut slot = FrameSlot::default();
        assert!(slot.is_inert());
        assert_eq!(slot.image_acquired(), vk::Semaphore::null());
        assert_eq!(slot.framebuffer(), vk::Framebuffer::null());
        assert!(slot.drawing_finished().is_none());

        // Teardown of an inert slot is a no-op, twice over
        slot.teardown();
        slot.teardown();
        assert!(slot.is_inert());
    }

    #[test]
    fn take_moves_the_target_and_leaves_source_inert() {
        use ash::vk::Handle;

        let mut slot = FrameSlot {
            recording_target: vk::CommandBuffer::from_raw(0x42),
            ..Default::default()
        };
        let moved = slot.take();

        assert_eq!(moved.recording_target(), vk::CommandBuffer::from_raw(0x42));
        assert!(slot.is_inert());
    }
}
